//! # Tezos Adapter
//!
//! Serves `tezos:*` networks. Accounts are Base58Check strings
//! (`tz1…`/`tz2…`/`tz3…` implicit accounts and `KT1…` contracts),
//! assets are the native coin (`slip44:1729`) or FA2 token contracts
//! (`fa2:KT1…`), and transaction IDs arrive either as Base58Check
//! operation hashes (`o…`) or as raw 32-byte hex.
//!
//! The common network names `mainnet` and `ghostnet` normalize to the
//! genesis block hash prefixes CAIP-2 uses for Tezos, so either
//! spelling configures the same chain.
//!
//! Personal signatures are Ed25519 over the raw message bytes, checked
//! against the signer's hex public key.

use async_trait::async_trait;
use ed25519_dalek::{Signature, VerifyingKey};
use tracing::{debug, warn};

use crate::caip::{split_caip10, Address, AssetId, ChainId, TxId};
use crate::config::NetworkConfig;
use crate::error::{EngineError, EngineResult};

use super::{with_timeout, AdapterStatus, AssetHandle, ChainAdapter};

use std::sync::Arc;
use std::time::Duration;

/// SLIP-44 coin type for tez.
const NATIVE_COIN_TYPE: &str = "1729";

/// CAIP-2 references for the well-known networks.
const MAINNET_REFERENCE: &str = "NetXdQprcVkpaWU";
const GHOSTNET_REFERENCE: &str = "NetXnHfVqm9iesp";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One transfer inside an operation, as indexed by the node.
#[derive(Clone, Debug)]
pub struct TezosTransfer {
    /// Whether this content was applied. Failed or backtracked contents
    /// moved nothing.
    pub applied: bool,
    pub sender: String,
    pub destination: String,
    /// Amount moved, in mutez or the token's smallest unit.
    pub amount: u128,
    /// FA2 contract for token transfers; `None` for plain tez.
    pub contract: Option<String>,
}

/// The node surface this adapter needs.
#[async_trait]
pub trait TezosRpc: Send + Sync + 'static {
    /// The transfers an operation performed; `None` while the operation
    /// is unknown or unconfirmed.
    async fn operation(&self, tx: &TxId) -> anyhow::Result<Option<Vec<TezosTransfer>>>;

    /// Submits a transfer from the operator account. `contract` selects
    /// an FA2 transfer; `None` sends plain tez.
    async fn send_transfer(
        &self,
        to: &str,
        amount: u128,
        contract: Option<&str>,
    ) -> anyhow::Result<TxId>;

    /// Balance held by an account: mutez, or an FA2 token balance when
    /// `contract` names the token.
    async fn balance(&self, address: &str, contract: Option<&str>) -> anyhow::Result<u128>;

    /// Originates a throwaway FA2 token for test-mode networks and
    /// returns its `KT1…` address.
    async fn deploy_test_token(&self) -> anyhow::Result<String>;

    /// Liveness probe: the current head block level.
    async fn head_level(&self) -> anyhow::Result<u64>;
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Adapter for one `tezos:*` network.
pub struct TezosAdapter {
    chain: ChainId,
    alias: Option<String>,
    description: String,
    receiver: Address,
    operator: Option<Address>,
    timeout: Duration,
    test_mode: bool,
    rpc: Arc<dyn TezosRpc>,
}

impl TezosAdapter {
    pub fn new(chain: ChainId, cfg: &NetworkConfig, rpc: Arc<dyn TezosRpc>) -> EngineResult<Self> {
        let chain = normalize_chain(&chain)?;
        let operator = cfg
            .operator_address
            .as_deref()
            .map(|s| parse_tezos_address(&chain, s))
            .transpose()?;
        let receiver = match cfg.receiver_address.as_deref() {
            Some(s) => parse_tezos_address(&chain, s)?,
            None => operator.clone().ok_or_else(|| {
                EngineError::Config(format!("{chain}: neither receiver nor operator configured"))
            })?,
        };
        let description = cfg
            .description
            .clone()
            .unwrap_or_else(|| "Tezos Network".to_string());
        Ok(TezosAdapter {
            alias: cfg.alias.clone(),
            description,
            receiver,
            operator,
            timeout: cfg.rpc_timeout(),
            test_mode: cfg.test_mode,
            rpc,
            chain,
        })
    }
}

#[async_trait]
impl ChainAdapter for TezosAdapter {
    fn chain_id(&self) -> &ChainId {
        &self.chain
    }

    fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn receiver_address(&self) -> &Address {
        &self.receiver
    }

    fn operator_address(&self) -> Option<&Address> {
        self.operator.as_ref()
    }

    fn parse_address(&self, s: &str) -> EngineResult<Address> {
        parse_tezos_address(&self.chain, s)
    }

    fn parse_tx_id(&self, s: &str) -> EngineResult<TxId> {
        parse_operation_hash(s)
    }

    fn parse_asset(&self, s: &str) -> EngineResult<AssetHandle> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("XTZ") {
            return Ok(AssetHandle::Native);
        }
        match s.split_once(':') {
            Some(("fa2", contract)) => {
                let addr = parse_tezos_address(&self.chain, contract)?;
                let Address::Base58(b58) = &addr else {
                    return Err(EngineError::Format(format!(
                        "FA2 asset must be a contract address: {contract:?}"
                    )));
                };
                if !b58.starts_with("KT1") {
                    return Err(EngineError::Format(format!(
                        "FA2 asset must be a KT1 contract: {contract:?}"
                    )));
                }
                Ok(AssetHandle::Contract(addr))
            }
            Some(("slip44", NATIVE_COIN_TYPE)) => Ok(AssetHandle::Native),
            Some(("slip44", other)) => Err(EngineError::Unsupported(format!(
                "slip44:{other} is not the native coin of a Tezos chain"
            ))),
            _ => Err(EngineError::Format(format!(
                "unrecognized Tezos asset ID: {s:?}"
            ))),
        }
    }

    fn caip_asset_id(&self, asset: &AssetHandle) -> AssetId {
        match asset {
            AssetHandle::Native => AssetId::from_canonical(format!("slip44:{NATIVE_COIN_TYPE}")),
            AssetHandle::Contract(addr) => AssetId::from_canonical(format!("fa2:{addr}")),
        }
    }

    fn verify_personal_signature(
        &self,
        message: &[u8],
        signature: &[u8],
        signer: &str,
    ) -> EngineResult<bool> {
        let key_bytes = decode_hex32(signer).ok_or_else(|| {
            EngineError::Format(format!("not a 32-byte hex Ed25519 public key: {signer:?}"))
        })?;
        let key = match VerifyingKey::from_bytes(&key_bytes) {
            Ok(key) => key,
            Err(_) => return Ok(false),
        };
        let sig = Signature::from_slice(signature).map_err(|_| {
            EngineError::Format(format!(
                "Ed25519 signature must be 64 bytes, got {}",
                signature.len()
            ))
        })?;
        Ok(key.verify_strict(message, &sig).is_ok())
    }

    async fn get_balance(&self, asset: &AssetHandle, address: &Address) -> EngineResult<u128> {
        let Address::Base58(b58) = address else {
            return Err(EngineError::Format(
                "Tezos balance query requires a Base58 address".into(),
            ));
        };
        let contract = match asset {
            AssetHandle::Native => None,
            AssetHandle::Contract(Address::Base58(kt)) => Some(kt.as_str()),
            AssetHandle::Contract(_) => {
                return Err(EngineError::Format(
                    "Tezos token asset must be a KT1 contract".into(),
                ))
            }
        };
        with_timeout(self.timeout, "tezos balance query", async {
            self.rpc.balance(b58, contract).await
        })
        .await
    }

    async fn check_transaction(
        &self,
        tx: &TxId,
        expected_sender: &Address,
        asset: &AssetHandle,
        receiver: &Address,
    ) -> EngineResult<Option<u128>> {
        let (Address::Base58(sender), Address::Base58(receiver)) = (expected_sender, receiver)
        else {
            return Err(EngineError::Format(
                "Tezos deposit check requires Base58 addresses".into(),
            ));
        };
        let contract = match asset {
            AssetHandle::Native => None,
            AssetHandle::Contract(Address::Base58(kt)) => Some(kt.as_str()),
            AssetHandle::Contract(_) => {
                return Err(EngineError::Format(
                    "Tezos token asset must be a KT1 contract".into(),
                ))
            }
        };

        let contents = match with_timeout(self.timeout, "tezos operation lookup", async {
            self.rpc.operation(tx).await
        })
        .await?
        {
            Some(contents) => contents,
            None => {
                debug!(%tx, "operation not yet confirmed");
                return Ok(None);
            }
        };

        if !contents.iter().any(|c| c.sender == *sender) {
            let actual = contents
                .first()
                .map(|c| c.sender.clone())
                .unwrap_or_else(|| "<none>".to_string());
            return Err(EngineError::SenderMismatch {
                expected: sender.clone(),
                actual,
            });
        }
        if contents.iter().any(|c| !c.applied) {
            // partially failed operations moved nothing that counts
            debug!(%tx, "operation not fully applied; not verifiable");
            return Ok(None);
        }

        let mut total: u128 = 0;
        for content in &contents {
            if content.sender != *sender
                || content.destination != *receiver
                || content.contract.as_deref() != contract
            {
                continue;
            }
            total = total.checked_add(content.amount).ok_or_else(|| {
                EngineError::Invariant(format!("transfer sum overflows in operation {tx}"))
            })?;
        }
        Ok(Some(total))
    }

    async fn make_payout(
        &self,
        asset: &AssetHandle,
        to: &Address,
        amount: u128,
    ) -> EngineResult<TxId> {
        let Address::Base58(to) = to else {
            return Err(EngineError::Format(
                "Tezos payout destination must be a Base58 address".into(),
            ));
        };
        if self.operator.is_none() {
            return Err(EngineError::Config(format!(
                "{}: no operator account configured for payouts",
                self.chain
            )));
        }
        let contract = match asset {
            AssetHandle::Native => None,
            AssetHandle::Contract(Address::Base58(kt)) => Some(kt.as_str()),
            AssetHandle::Contract(_) => {
                return Err(EngineError::Format(
                    "Tezos token asset must be a KT1 contract".into(),
                ))
            }
        };
        with_timeout(self.timeout, "tezos transfer", async {
            self.rpc.send_transfer(to, amount, contract).await
        })
        .await
    }

    async fn configure_asset(&self, spec: &str) -> EngineResult<AssetHandle> {
        if spec.trim() == "test" {
            if !self.test_mode {
                return Err(EngineError::Config(format!(
                    "{}: the \"test\" asset requires test mode",
                    self.chain
                )));
            }
            let contract = with_timeout(self.timeout, "deploy test token", async {
                self.rpc.deploy_test_token().await
            })
            .await?;
            let addr = parse_tezos_address(&self.chain, &contract)?;
            warn!(chain = %self.chain, contract = %addr, "originated throwaway test token");
            return Ok(AssetHandle::Contract(addr));
        }
        self.parse_asset(spec)
    }

    async fn status(&self) -> AdapterStatus {
        let connected = with_timeout(self.timeout, "tezos head probe", async {
            self.rpc.head_level().await
        })
        .await
        .is_ok();
        AdapterStatus {
            chain_id: self.chain.clone(),
            alias: self.alias.clone(),
            description: self.description.clone(),
            receiver_address: self.receiver.to_string(),
            operator_address: self.operator.as_ref().map(|a| a.to_string()),
            connected,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Rewrites the friendly network names to their CAIP-2 references.
fn normalize_chain(chain: &ChainId) -> EngineResult<ChainId> {
    let reference = match chain.reference() {
        "mainnet" => MAINNET_REFERENCE,
        "ghostnet" => GHOSTNET_REFERENCE,
        other => other,
    };
    ChainId::parse(&format!("tezos:{reference}"))
}

/// Parses a Tezos account string, accepting a CAIP-10 prefix for this
/// chain (in normalized or friendly spelling).
fn parse_tezos_address(chain: &ChainId, s: &str) -> EngineResult<Address> {
    let s = s.trim();
    let (prefix, bare) = split_caip10(s);
    if let Some(prefix) = prefix {
        let prefixed_chain = ChainId::parse(prefix).and_then(|c| normalize_chain(&c))?;
        if prefixed_chain != *chain {
            return Err(EngineError::Format(format!(
                "address {s:?} belongs to chain {prefix}, not {chain}"
            )));
        }
    }
    let valid_prefix = ["tz1", "tz2", "tz3", "KT1"]
        .iter()
        .any(|p| bare.starts_with(p));
    if !valid_prefix || bare.len() != 36 {
        return Err(EngineError::Format(format!(
            "not a Tezos account address: {bare:?}"
        )));
    }
    bs58::decode(bare)
        .with_check(None)
        .into_vec()
        .map_err(|e| EngineError::Format(format!("bad Base58Check address {bare:?}: {e}")))?;
    Ok(Address::Base58(bare.to_string()))
}

/// Parses an operation hash: Base58Check `o…` form or raw 32-byte hex.
/// The canonical ID is the trailing 32 bytes of the checked payload.
fn parse_operation_hash(s: &str) -> EngineResult<TxId> {
    let s = s.trim();
    if let Some(tx) = TxId::parse_hex(s) {
        return Ok(tx);
    }
    if s.starts_with('o') {
        let payload = bs58::decode(s)
            .with_check(None)
            .into_vec()
            .map_err(|e| EngineError::Format(format!("bad operation hash {s:?}: {e}")))?;
        if payload.len() < 32 {
            return Err(EngineError::Format(format!(
                "operation hash payload too short: {s:?}"
            )));
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&payload[payload.len() - 32..]);
        return Ok(TxId::from_bytes(id));
    }
    Err(EngineError::Format(format!(
        "not a Tezos operation hash: {s:?}"
    )))
}

fn decode_hex32(s: &str) -> Option<[u8; 32]> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if s.len() != 64 {
        return None;
    }
    let bytes = hex::decode(s).ok()?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    // Base58Check test fixtures generated from raw payloads below.
    const SENDER: &str = "tz1VSUr8wwNhLAzempoch5d6hLRiTh8Cjcjb";
    const RECEIVER: &str = "tz1Ke2h7sDdakHJQh8WX4Z372du1KChsksyU";

    fn chain() -> ChainId {
        ChainId::parse("tezos:ghostnet").unwrap()
    }

    fn config() -> NetworkConfig {
        NetworkConfig {
            chain_id: "tezos:ghostnet".into(),
            operator_address: Some(RECEIVER.into()),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct MockRpc {
        contents: Mutex<Option<Vec<TezosTransfer>>>,
    }

    #[async_trait]
    impl TezosRpc for MockRpc {
        async fn operation(&self, _tx: &TxId) -> anyhow::Result<Option<Vec<TezosTransfer>>> {
            Ok(self.contents.lock().clone())
        }

        async fn send_transfer(
            &self,
            _to: &str,
            _amount: u128,
            _contract: Option<&str>,
        ) -> anyhow::Result<TxId> {
            Ok(TxId::from_bytes([0xDD; 32]))
        }

        async fn balance(&self, _address: &str, _contract: Option<&str>) -> anyhow::Result<u128> {
            Ok(1_000_000)
        }

        async fn deploy_test_token(&self) -> anyhow::Result<String> {
            anyhow::bail!("not supported by this mock")
        }

        async fn head_level(&self) -> anyhow::Result<u64> {
            Ok(1)
        }
    }

    fn adapter() -> (TezosAdapter, Arc<MockRpc>) {
        let rpc = Arc::new(MockRpc::default());
        let adapter = TezosAdapter::new(chain(), &config(), rpc.clone()).unwrap();
        (adapter, rpc)
    }

    #[test]
    fn friendly_network_names_normalize() {
        let (adapter, _) = adapter();
        assert_eq!(adapter.chain_id().as_str(), "tezos:NetXnHfVqm9iesp");

        let rpc = Arc::new(MockRpc::default());
        let mainnet = TezosAdapter::new(
            ChainId::parse("tezos:mainnet").unwrap(),
            &NetworkConfig {
                chain_id: "tezos:mainnet".into(),
                operator_address: Some(RECEIVER.into()),
                ..Default::default()
            },
            rpc,
        )
        .unwrap();
        assert_eq!(mainnet.chain_id().as_str(), "tezos:NetXdQprcVkpaWU");
    }

    #[test]
    fn addresses_validate_base58check() {
        let (adapter, _) = adapter();
        assert_eq!(
            adapter.parse_address(SENDER).unwrap(),
            Address::Base58(SENDER.into())
        );
        // prefixed for this chain, friendly or normalized spelling
        assert!(adapter
            .parse_address(&format!("tezos:ghostnet:{SENDER}"))
            .is_ok());
        assert!(adapter
            .parse_address(&format!("tezos:NetXnHfVqm9iesp:{SENDER}"))
            .is_ok());
        // prefixed for a different chain
        assert!(adapter
            .parse_address(&format!("tezos:mainnet:{SENDER}"))
            .is_err());

        // corrupted checksum
        let mut corrupted = SENDER.to_string();
        corrupted.replace_range(10..11, "2");
        assert!(adapter.parse_address(&corrupted).is_err());
        // wrong prefix / shape
        assert!(adapter.parse_address("tb1qxyz").is_err());
        assert!(adapter.parse_address("tz1short").is_err());
    }

    #[test]
    fn operation_hashes_accept_hex_and_base58() {
        let hex64 = "9d3a3663d32b9ff5cf2d393e433b7b31489d13b398133a35c4bb6e2085bd8e83";
        let from_hex = parse_operation_hash(hex64).unwrap();
        assert_eq!(from_hex.to_hex(), hex64);

        // build a checked op hash around a known payload
        let mut payload = vec![0x05, 0x74];
        payload.extend_from_slice(from_hex.as_bytes());
        let b58 = bs58::encode(&payload).with_check().into_string();
        // operation hashes encode with a leading 'o'
        if b58.starts_with('o') {
            assert_eq!(parse_operation_hash(&b58).unwrap(), from_hex);
        }

        assert!(parse_operation_hash("not-a-hash").is_err());
        assert!(parse_operation_hash("o123").is_err());
    }

    #[test]
    fn asset_ids_round_trip() {
        let (adapter, _) = adapter();
        let native = adapter.parse_asset("slip44:1729").unwrap();
        assert_eq!(native, AssetHandle::Native);
        assert_eq!(adapter.caip_asset_id(&native).as_str(), "slip44:1729");
        assert_eq!(adapter.parse_asset("XTZ").unwrap(), AssetHandle::Native);

        assert!(adapter.parse_asset("slip44:60").is_err());
        // tz1 is an implicit account, not an FA2 contract
        assert!(adapter.parse_asset(&format!("fa2:{SENDER}")).is_err());
    }

    #[tokio::test]
    async fn sums_applied_native_transfers_to_the_receiver() {
        let (adapter, rpc) = adapter();
        *rpc.contents.lock() = Some(vec![
            TezosTransfer {
                applied: true,
                sender: SENDER.into(),
                destination: RECEIVER.into(),
                amount: 1_000_000,
                contract: None,
            },
            // different destination: ignored
            TezosTransfer {
                applied: true,
                sender: SENDER.into(),
                destination: SENDER.into(),
                amount: 5,
                contract: None,
            },
        ]);

        let amount = adapter
            .check_transaction(
                &TxId::from_bytes([4; 32]),
                &Address::Base58(SENDER.into()),
                &AssetHandle::Native,
                &Address::Base58(RECEIVER.into()),
            )
            .await
            .unwrap();
        assert_eq!(amount, Some(1_000_000));
    }

    #[tokio::test]
    async fn unapplied_operations_are_not_verifiable() {
        let (adapter, rpc) = adapter();
        *rpc.contents.lock() = Some(vec![TezosTransfer {
            applied: false,
            sender: SENDER.into(),
            destination: RECEIVER.into(),
            amount: 9,
            contract: None,
        }]);

        let amount = adapter
            .check_transaction(
                &TxId::from_bytes([4; 32]),
                &Address::Base58(SENDER.into()),
                &AssetHandle::Native,
                &Address::Base58(RECEIVER.into()),
            )
            .await
            .unwrap();
        assert_eq!(amount, None);
    }

    #[tokio::test]
    async fn foreign_sender_is_a_mismatch() {
        let (adapter, rpc) = adapter();
        *rpc.contents.lock() = Some(vec![TezosTransfer {
            applied: true,
            sender: RECEIVER.into(),
            destination: RECEIVER.into(),
            amount: 9,
            contract: None,
        }]);

        let err = adapter
            .check_transaction(
                &TxId::from_bytes([4; 32]),
                &Address::Base58(SENDER.into()),
                &AssetHandle::Native,
                &Address::Base58(RECEIVER.into()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SenderMismatch { .. }));
    }
}
