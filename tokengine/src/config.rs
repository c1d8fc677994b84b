//! # Engine Configuration
//!
//! Deserializable configuration records for the engine, its networks,
//! and its token/transfer table. The shapes mirror the JSON config file
//! the outer layers load; the core consumes them as plain structs.
//!
//! Configuration is read once at startup. The only pieces consulted
//! afterwards are the server URL stamped into audit records and the
//! per-network RPC timeout.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default public URL stamped into audit records when none is configured.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

/// Default bound on any single outbound chain RPC call.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 15_000;

// ---------------------------------------------------------------------------
// Engine config
// ---------------------------------------------------------------------------

/// Top-level engine configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Public URL of this server, used as the `server` field of audit
    /// records. Defaults to [`DEFAULT_SERVER_URL`].
    pub url: Option<String>,

    /// One entry per connected chain network.
    pub networks: Vec<NetworkConfig>,

    /// Cross-chain token alias table.
    pub tokens: Vec<TokenConfig>,

    /// Operational settings (persistence, audit sink location).
    pub operations: OperationsConfig,
}

impl EngineConfig {
    /// The audit `server` field: configured URL or the default.
    pub fn server_field(&self) -> &str {
        self.url.as_deref().unwrap_or(DEFAULT_SERVER_URL)
    }
}

/// Operational settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationsConfig {
    /// Path for the persistent ledger store. The literal value `"temp"`
    /// (or omission) selects an ephemeral store, useful for tests and
    /// throwaway deployments.
    pub store_path: Option<String>,

    /// Location of the audit sink endpoint. `None` disables audit
    /// delivery entirely: submissions report "not queued".
    pub audit_url: Option<String>,

    /// Directory holding operator key files. Loading the keys is the
    /// outer layer's job; the core only passes the path through.
    pub key_dir: Option<String>,
}

// ---------------------------------------------------------------------------
// Network config
// ---------------------------------------------------------------------------

/// Configuration for one chain network / adapter instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    /// CAIP-2 chain ID, e.g. `eip155:11155111`. Required; the namespace
    /// selects the adapter family.
    #[serde(rename = "chainID")]
    pub chain_id: String,

    /// Short alias resolvable wherever a chain ID is accepted.
    pub alias: Option<String>,

    /// Human-readable description for status reports.
    pub description: Option<String>,

    /// Chain RPC endpoint URL. Opaque to the core; handed to the RPC
    /// client provider.
    pub url: Option<String>,

    /// The account this system controls to fund payouts.
    pub operator_address: Option<String>,

    /// The account users must pay deposits into. Defaults to the
    /// operator address when omitted.
    pub receiver_address: Option<String>,

    /// Per-call RPC timeout in milliseconds.
    /// Defaults to [`DEFAULT_RPC_TIMEOUT_MS`].
    pub timeout_ms: Option<u64>,

    /// Test mode: enables the `"test"` asset sentinel, which deploys a
    /// throwaway token on the network at configuration time.
    pub test_mode: bool,
}

impl NetworkConfig {
    /// The bounded timeout applied to every outbound RPC call on this
    /// network.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_RPC_TIMEOUT_MS))
    }
}

// ---------------------------------------------------------------------------
// Token config
// ---------------------------------------------------------------------------

/// A cross-chain token alias and its per-network deployments.
///
/// Each entry maps the alias to exactly one asset per network; the
/// engine registers every deployment into the owning adapter's token
/// mapping at startup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenConfig {
    /// The cross-chain symbolic name, e.g. `USDT`.
    pub alias: String,

    /// One deployment record per network carrying this token.
    pub networks: Vec<TokenNetworkEntry>,
}

/// One token deployment on one network.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenNetworkEntry {
    /// Chain ID or alias of the network.
    pub network: String,

    /// Symbol used on this network (defaults to the token alias).
    pub symbol: Option<String>,

    /// CAIP-19 asset ID, or the `"test"` sentinel in test mode.
    #[serde(rename = "assetID")]
    pub asset_id: String,

    /// Receiver account for deposits of this token; defaults to the
    /// adapter's receiver address.
    pub receiver_address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config_json() {
        let json = r#"{
            "url": "https://bridge.example.com",
            "networks": [
                {
                    "chainID": "eip155:11155111",
                    "alias": "sepolia",
                    "description": "Sepolia testnet",
                    "url": "https://sepolia.drpc.org",
                    "operatorAddress": "0x5fbe74a283f7954f10aa04c2edf55578811aeb03",
                    "timeoutMs": 5000
                },
                { "chainID": "convex:test", "alias": "convex", "testMode": true }
            ],
            "tokens": [
                {
                    "alias": "USDT",
                    "networks": [
                        {
                            "network": "sepolia",
                            "symbol": "USDT",
                            "assetID": "erc20:0x1c7d4b196cb0c7b01d743fbc6116a902379c7238"
                        }
                    ]
                }
            ],
            "operations": { "storePath": "temp", "auditUrl": "https://kfk.example.net/topics/audit" }
        }"#;

        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.server_field(), "https://bridge.example.com");
        assert_eq!(cfg.networks.len(), 2);
        assert_eq!(cfg.networks[0].chain_id, "eip155:11155111");
        assert_eq!(cfg.networks[0].rpc_timeout(), Duration::from_millis(5000));
        assert!(cfg.networks[1].test_mode);
        assert_eq!(cfg.tokens[0].alias, "USDT");
        assert_eq!(cfg.operations.store_path.as_deref(), Some("temp"));
    }

    #[test]
    fn defaults_apply_when_fields_missing() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.server_field(), DEFAULT_SERVER_URL);
        assert!(cfg.networks.is_empty());

        let net: NetworkConfig = serde_json::from_str(r#"{ "chainID": "convex:main" }"#).unwrap();
        assert_eq!(
            net.rpc_timeout(),
            Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS)
        );
        assert!(!net.test_mode);
    }
}
