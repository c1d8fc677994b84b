//! # Chain Adapters
//!
//! One adapter per connected network translates between chain-agnostic
//! identifiers and the chain's native formats, verifies deposits
//! against the chain, and submits payouts. Adapters are self-contained:
//! they hold their own configuration and RPC client and never reach
//! back into the engine or the ledger.
//!
//! The actual wire clients live behind the per-family RPC traits
//! ([`evm::EvmRpc`], [`convex::ConvexRpc`], [`tezos::TezosRpc`]) so the
//! verification logic can be exercised against recorded or scripted
//! responses. Every RPC call is bounded by the network's configured
//! timeout; transport failures and timeouts surface uniformly as
//! retryable errors.

pub mod convex;
pub mod evm;
pub mod tezos;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::caip::{Address, AssetId, ChainId, TxId, UserKey};
use crate::config::NetworkConfig;
use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Asset handles
// ---------------------------------------------------------------------------

/// An asset in an adapter's native terms: either the chain's native
/// coin or a token contract on it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AssetHandle {
    /// The chain's native coin (CAIP-19 `slip44:<coin>`).
    Native,
    /// A token identified by its contract account.
    Contract(Address),
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// A point-in-time description of one adapter, for status reporting.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStatus {
    #[serde(rename = "chainID")]
    pub chain_id: ChainId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub description: String,
    pub receiver_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_address: Option<String>,
    /// Whether the last liveness probe of the chain endpoint succeeded.
    pub connected: bool,
}

// ---------------------------------------------------------------------------
// The adapter trait
// ---------------------------------------------------------------------------

/// The protocol every connected chain implements.
///
/// Parsing methods are pure and synchronous; they canonicalize
/// chain-native spellings exactly once. The async methods talk to the
/// chain and may fail transiently.
#[async_trait]
pub trait ChainAdapter: Send + Sync + 'static {
    /// Connects the adapter to its chain. Called once at engine
    /// startup; a failure skips this network without blocking others.
    async fn start(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Releases chain connections. Called once at engine shutdown.
    async fn close(&self) {}

    /// The CAIP-2 chain this adapter serves.
    fn chain_id(&self) -> &ChainId;

    /// Optional short alias resolvable wherever a chain ID is accepted.
    fn alias(&self) -> Option<&str>;

    /// Human-readable description for status reports.
    fn description(&self) -> &str;

    /// The default deposit receiver account on this chain.
    fn receiver_address(&self) -> &Address;

    /// The operator account funding payouts, when configured.
    fn operator_address(&self) -> Option<&Address>;

    /// Parses a chain-native or CAIP-10 account string into the
    /// canonical [`Address`].
    ///
    /// A CAIP-10 prefix naming a different chain is refused.
    ///
    /// # Errors
    ///
    /// [`EngineError::Format`] on any malformed input.
    fn parse_address(&self, s: &str) -> EngineResult<Address>;

    /// Stringified form of [`parse_address`](Self::parse_address): the
    /// canonical ledger key for an account.
    fn parse_user_key(&self, s: &str) -> EngineResult<UserKey> {
        Ok(UserKey::from(&self.parse_address(s)?))
    }

    /// Parses a chain-native transaction ID string.
    fn parse_tx_id(&self, s: &str) -> EngineResult<TxId>;

    /// Live on-chain balance of `asset` held by `address`.
    ///
    /// # Errors
    ///
    /// [`EngineError::TransientChain`] on RPC failure or timeout.
    async fn get_balance(&self, asset: &AssetHandle, address: &Address) -> EngineResult<u128>;

    /// Live on-chain balance of `asset` held by the operator account.
    async fn operator_balance(&self, asset: &AssetHandle) -> EngineResult<u128> {
        let operator = self.operator_address().ok_or_else(|| {
            EngineError::Config(format!(
                "{}: no operator account configured",
                self.chain_id()
            ))
        })?;
        self.get_balance(asset, operator).await
    }

    /// Parses a CAIP-19 asset ID into this chain's native handle.
    fn parse_asset(&self, s: &str) -> EngineResult<AssetHandle>;

    /// Renders a native asset handle back to its canonical CAIP-19 ID.
    /// Inverse of [`parse_asset`](Self::parse_asset).
    fn caip_asset_id(&self, asset: &AssetHandle) -> AssetId;

    /// Verifies a personal signature over `message`, using the chain
    /// family's signature scheme. `signer` is interpreted per family:
    /// an account address for recoverable schemes (EVM), a hex public
    /// key for Ed25519 chains. Returns whether the signature is valid.
    ///
    /// # Errors
    ///
    /// [`EngineError::Format`] when the signer or signature bytes have
    /// the wrong shape for the scheme.
    fn verify_personal_signature(
        &self,
        message: &[u8],
        signature: &[u8],
        signer: &str,
    ) -> EngineResult<bool>;

    /// Verifies a claimed deposit against the chain.
    ///
    /// Returns `Ok(Some(amount))` with the verified amount actually
    /// received by `receiver` from `expected_sender` in transaction
    /// `tx` — which may legitimately be zero — or `Ok(None)` when the
    /// transaction is not yet verifiable (unknown or unconfirmed;
    /// reverted transactions also land here and never become
    /// verifiable).
    ///
    /// # Errors
    ///
    /// [`EngineError::SenderMismatch`] when the transaction exists but
    /// was sent by someone else; [`EngineError::TransientChain`] on RPC
    /// failure; [`EngineError::Invariant`] on nonsensical chain data
    /// (negative or overflowing amounts).
    async fn check_transaction(
        &self,
        tx: &TxId,
        expected_sender: &Address,
        asset: &AssetHandle,
        receiver: &Address,
    ) -> EngineResult<Option<u128>>;

    /// Submits an on-chain transfer of `amount` of `asset` from the
    /// operator account to `to`, returning the submitted transaction ID.
    ///
    /// Submission is not settlement: the caller has already debited the
    /// ledger, and the returned ID is the handle for tracking the
    /// transfer on chain.
    async fn make_payout(
        &self,
        asset: &AssetHandle,
        to: &Address,
        amount: u128,
    ) -> EngineResult<TxId>;

    /// Resolves a configured asset spec, honoring the `"test"` sentinel
    /// where the adapter supports deploying a throwaway token.
    async fn configure_asset(&self, spec: &str) -> EngineResult<AssetHandle> {
        self.parse_asset(spec)
    }

    /// Probes the chain endpoint and reports this adapter's status.
    async fn status(&self) -> AdapterStatus;
}

// ---------------------------------------------------------------------------
// RPC client provision
// ---------------------------------------------------------------------------

/// Supplies the wire clients adapters talk through. Production wires in
/// real JSON-RPC clients; tests wire in scripted ones.
///
/// Each method defaults to a configuration error so a provider only
/// implements the families its deployment connects.
pub trait RpcProvider: Send + Sync + 'static {
    fn evm(&self, cfg: &NetworkConfig) -> EngineResult<Arc<dyn evm::EvmRpc>> {
        Err(EngineError::Config(format!(
            "no EVM RPC client available for {}",
            cfg.chain_id
        )))
    }

    fn convex(&self, cfg: &NetworkConfig) -> EngineResult<Arc<dyn convex::ConvexRpc>> {
        Err(EngineError::Config(format!(
            "no Convex RPC client available for {}",
            cfg.chain_id
        )))
    }

    fn tezos(&self, cfg: &NetworkConfig) -> EngineResult<Arc<dyn tezos::TezosRpc>> {
        Err(EngineError::Config(format!(
            "no Tezos RPC client available for {}",
            cfg.chain_id
        )))
    }
}

/// Builds the adapter for one configured network, dispatching on the
/// chain namespace.
///
/// # Errors
///
/// [`EngineError::Unsupported`] for an unknown namespace;
/// [`EngineError::Config`] when the network entry is incomplete.
pub fn build_adapter(
    cfg: &NetworkConfig,
    provider: &dyn RpcProvider,
) -> EngineResult<Arc<dyn ChainAdapter>> {
    let chain = ChainId::parse(&cfg.chain_id)?;
    debug!(chain = %chain, "building adapter");
    match chain.namespace() {
        "eip155" => Ok(Arc::new(evm::EvmAdapter::new(
            chain,
            cfg,
            provider.evm(cfg)?,
        )?)),
        "convex" => Ok(Arc::new(convex::ConvexAdapter::new(
            chain,
            cfg,
            provider.convex(cfg)?,
        )?)),
        "tezos" => Ok(Arc::new(tezos::TezosAdapter::new(
            chain,
            cfg,
            provider.tezos(cfg)?,
        )?)),
        other => Err(EngineError::Unsupported(format!(
            "no adapter for chain namespace {other:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Bounds an RPC future by `timeout`, mapping both elapsed timeouts and
/// transport errors to [`EngineError::TransientChain`].
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    what: &str,
    fut: impl Future<Output = anyhow::Result<T>> + Send,
) -> EngineResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(EngineError::TransientChain(format!("{what}: {e}"))),
        Err(_) => Err(EngineError::TransientChain(format!(
            "{what}: timed out after {timeout:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoProvider;
    impl RpcProvider for NoProvider {}

    #[test]
    fn unknown_namespace_is_unsupported() {
        let cfg = NetworkConfig {
            chain_id: "solana:mainnet".into(),
            ..Default::default()
        };
        assert!(matches!(
            build_adapter(&cfg, &NoProvider),
            Err(EngineError::Unsupported(_))
        ));
    }

    #[test]
    fn missing_rpc_client_is_a_config_error() {
        let cfg = NetworkConfig {
            chain_id: "eip155:1".into(),
            ..Default::default()
        };
        assert!(matches!(
            build_adapter(&cfg, &NoProvider),
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn timeouts_surface_as_transient() {
        let err = with_timeout(Duration::from_millis(5), "probe", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn transport_errors_surface_as_transient() {
        let err = with_timeout(Duration::from_secs(1), "probe", async {
            Err::<(), _>(anyhow::anyhow!("connection refused"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::TransientChain(_)));
    }
}
