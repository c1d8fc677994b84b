//! # Convex Adapter
//!
//! Serves `convex:*` networks. Accounts are plain numeric indexes
//! (`#11`), assets are either the native coin (`slip44:864`) or CAD-29
//! fungible tokens identified by their token actor account (`cad29:72`),
//! and personal signatures are Ed25519 over the raw message bytes,
//! verified against the signer's hex-encoded public key.
//!
//! Deposit verification reads the transaction result and sums the asset
//! transfers that moved value from the claimed sender to the receiver.

use async_trait::async_trait;
use ed25519_dalek::{Signature, VerifyingKey};
use tracing::{debug, warn};

use crate::caip::{split_caip10, Address, AssetId, ChainId, TxId};
use crate::config::NetworkConfig;
use crate::error::{EngineError, EngineResult};

use super::{with_timeout, AdapterStatus, AssetHandle, ChainAdapter};

use std::sync::Arc;
use std::time::Duration;

/// SLIP-44 coin type for Convex Coins.
const NATIVE_COIN_TYPE: &str = "864";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One value movement reported in a transaction result.
#[derive(Clone, Debug)]
pub struct ConvexTransfer {
    pub sender: u64,
    pub receiver: u64,
    /// Amount moved, smallest unit.
    pub amount: u128,
    /// Token actor account for CAD-29 transfers; `None` for the native
    /// coin.
    pub token: Option<u64>,
}

/// The settled result of a transaction.
#[derive(Clone, Debug)]
pub struct ConvexResult {
    /// The account that signed and submitted the transaction.
    pub origin: u64,
    /// Whether the transaction errored. Errored transactions moved
    /// nothing.
    pub errored: bool,
    pub transfers: Vec<ConvexTransfer>,
}

/// The peer surface this adapter needs from a Convex node.
#[async_trait]
pub trait ConvexRpc: Send + Sync + 'static {
    /// Settled result of a transaction; `None` while unknown.
    async fn transaction_result(&self, tx: &TxId) -> anyhow::Result<Option<ConvexResult>>;

    /// Submits a transfer from the operator account.
    async fn transfer(&self, to: u64, amount: u128, token: Option<u64>) -> anyhow::Result<TxId>;

    /// Balance held by an account: native coins, or a CAD-29 token
    /// balance when `token` names the token actor.
    async fn balance(&self, account: u64, token: Option<u64>) -> anyhow::Result<u128>;

    /// Deploys a throwaway CAD-29 token for test-mode networks and
    /// returns its actor account.
    async fn deploy_test_token(&self) -> anyhow::Result<u64>;

    /// Liveness probe: the current consensus sequence number.
    async fn sequence(&self) -> anyhow::Result<u64>;
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Adapter for one `convex:*` network.
pub struct ConvexAdapter {
    chain: ChainId,
    alias: Option<String>,
    description: String,
    receiver: Address,
    operator: Option<Address>,
    timeout: Duration,
    test_mode: bool,
    rpc: Arc<dyn ConvexRpc>,
}

impl ConvexAdapter {
    pub fn new(chain: ChainId, cfg: &NetworkConfig, rpc: Arc<dyn ConvexRpc>) -> EngineResult<Self> {
        let operator = cfg
            .operator_address
            .as_deref()
            .map(|s| parse_convex_address(&chain, s))
            .transpose()?;
        let receiver = match cfg.receiver_address.as_deref() {
            Some(s) => parse_convex_address(&chain, s)?,
            None => operator.clone().ok_or_else(|| {
                EngineError::Config(format!("{chain}: neither receiver nor operator configured"))
            })?,
        };
        let description = cfg
            .description
            .clone()
            .unwrap_or_else(|| "Convex Network".to_string());
        Ok(ConvexAdapter {
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

    fn token_account(asset: &AssetHandle) -> EngineResult<Option<u64>> {
        match asset {
            AssetHandle::Native => Ok(None),
            AssetHandle::Contract(Address::Account(n)) => Ok(Some(*n)),
            AssetHandle::Contract(_) => Err(EngineError::Format(
                "Convex token asset must be a numeric account".into(),
            )),
        }
    }
}

#[async_trait]
impl ChainAdapter for ConvexAdapter {
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
        parse_convex_address(&self.chain, s)
    }

    fn parse_tx_id(&self, s: &str) -> EngineResult<TxId> {
        TxId::parse_hex(s).ok_or_else(|| {
            EngineError::Format(format!("not a 32-byte hex transaction ID: {s:?}"))
        })
    }

    fn parse_asset(&self, s: &str) -> EngineResult<AssetHandle> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("CVM") {
            return Ok(AssetHandle::Native);
        }
        match s.split_once(':') {
            Some(("cad29", token)) => {
                let addr = parse_convex_address(&self.chain, token)?;
                Ok(AssetHandle::Contract(addr))
            }
            Some(("slip44", NATIVE_COIN_TYPE)) => Ok(AssetHandle::Native),
            Some(("slip44", other)) => Err(EngineError::Unsupported(format!(
                "slip44:{other} is not the native coin of a Convex chain"
            ))),
            _ => Err(EngineError::Format(format!(
                "unrecognized Convex asset ID: {s:?}"
            ))),
        }
    }

    fn caip_asset_id(&self, asset: &AssetHandle) -> AssetId {
        match asset {
            AssetHandle::Native => AssetId::from_canonical(format!("slip44:{NATIVE_COIN_TYPE}")),
            AssetHandle::Contract(Address::Account(n)) => {
                AssetId::from_canonical(format!("cad29:{n}"))
            }
            AssetHandle::Contract(other) => {
                // unreachable through parse_asset; render faithfully anyway
                AssetId::from_canonical(format!("cad29:{other}"))
            }
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
            // not a valid curve point: no signature can verify against it
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
        let Address::Account(account) = address else {
            return Err(EngineError::Format(
                "Convex balance query requires a numeric account".into(),
            ));
        };
        let token = Self::token_account(asset)?;
        with_timeout(self.timeout, "convex balance query", async {
            self.rpc.balance(*account, token).await
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
        let (Address::Account(sender), Address::Account(receiver)) = (expected_sender, receiver)
        else {
            return Err(EngineError::Format(
                "Convex deposit check requires numeric accounts".into(),
            ));
        };
        let token = Self::token_account(asset)?;

        let result = match with_timeout(self.timeout, "convex transaction lookup", async {
            self.rpc.transaction_result(tx).await
        })
        .await?
        {
            Some(result) => result,
            None => {
                debug!(%tx, "transaction not yet settled");
                return Ok(None);
            }
        };

        if result.origin != *sender {
            return Err(EngineError::SenderMismatch {
                expected: format!("#{sender}"),
                actual: format!("#{}", result.origin),
            });
        }
        if result.errored {
            debug!(%tx, "transaction errored; not verifiable");
            return Ok(None);
        }

        let mut total: u128 = 0;
        for transfer in &result.transfers {
            if transfer.sender != *sender
                || transfer.receiver != *receiver
                || transfer.token != token
            {
                continue;
            }
            total = total.checked_add(transfer.amount).ok_or_else(|| {
                EngineError::Invariant(format!("transfer sum overflows in transaction {tx}"))
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
        let Address::Account(to) = to else {
            return Err(EngineError::Format(
                "Convex payout destination must be a numeric account".into(),
            ));
        };
        if self.operator.is_none() {
            return Err(EngineError::Config(format!(
                "{}: no operator account configured for payouts",
                self.chain
            )));
        }
        let token = Self::token_account(asset)?;
        with_timeout(self.timeout, "convex transfer", async {
            self.rpc.transfer(*to, amount, token).await
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
            let account = with_timeout(self.timeout, "deploy test token", async {
                self.rpc.deploy_test_token().await
            })
            .await?;
            warn!(chain = %self.chain, account, "deployed throwaway test token");
            return Ok(AssetHandle::Contract(Address::Account(account)));
        }
        self.parse_asset(spec)
    }

    async fn status(&self) -> AdapterStatus {
        let connected = with_timeout(self.timeout, "convex sequence probe", async {
            self.rpc.sequence().await
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

/// Parses a Convex account string: `#11`, `11`, or CAIP-10 prefixed for
/// this chain.
fn parse_convex_address(chain: &ChainId, s: &str) -> EngineResult<Address> {
    let s = s.trim();
    let (prefix, bare) = split_caip10(s);
    if let Some(prefix) = prefix {
        if prefix != chain.as_str() {
            return Err(EngineError::Format(format!(
                "address {s:?} belongs to chain {prefix}, not {chain}"
            )));
        }
    }
    let digits = bare.strip_prefix('#').unwrap_or(bare);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EngineError::Format(format!(
            "not a numeric Convex account: {bare:?}"
        )));
    }
    let n: u64 = digits
        .parse()
        .map_err(|_| EngineError::Format(format!("account index out of range: {bare:?}")))?;
    Ok(Address::Account(n))
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
