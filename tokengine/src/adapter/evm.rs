//! # EVM Adapter
//!
//! Serves `eip155:*` networks. Deposits are verified by fetching the
//! transaction receipt and summing the ERC-20 `Transfer` events that
//! actually moved value from the claimed sender to the configured
//! receiver; everything else in the receipt is ignored. Native-coin
//! deposits are verified from the transaction body instead, since plain
//! value transfers emit no logs.
//!
//! Personal signatures follow the `personal_sign` scheme: the message
//! is prefixed with `\x19Ethereum Signed Message:\n<len>`, hashed with
//! Keccak-256, and the signer's address is recovered from the 65-byte
//! recoverable secp256k1 signature.

use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};
use tracing::{debug, warn};

use crate::caip::{split_caip10, Address, AssetId, ChainId, TxId};
use crate::config::NetworkConfig;
use crate::error::{EngineError, EngineResult};

use super::{with_timeout, AdapterStatus, AssetHandle, ChainAdapter};

use std::sync::Arc;
use std::time::Duration;

/// `keccak256("Transfer(address,address,uint256)")`, the topic every
/// ERC-20 `Transfer` event carries.
pub const TRANSFER_TOPIC: &str = "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// SLIP-44 coin type for Ether, the native-coin sentinel on EVM chains.
const NATIVE_COIN_TYPE: &str = "60";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One event log from a transaction receipt. Addresses and topics are
/// hex strings as the node returns them; the adapter normalizes.
#[derive(Clone, Debug)]
pub struct EvmLog {
    /// Emitting contract address.
    pub address: String,
    /// Indexed topics, each 32 bytes of hex.
    pub topics: Vec<String>,
    /// Unindexed data.
    pub data: Vec<u8>,
}

/// A mined transaction receipt.
#[derive(Clone, Debug)]
pub struct EvmReceipt {
    /// Whether the transaction succeeded. Reverted transactions keep
    /// their receipt but moved nothing.
    pub succeeded: bool,
    /// The transaction sender.
    pub from: String,
    /// Event logs emitted during execution.
    pub logs: Vec<EvmLog>,
}

/// The body of a mined transaction, used for native-coin deposits.
#[derive(Clone, Debug)]
pub struct EvmTransaction {
    pub from: String,
    pub to: Option<String>,
    /// Transferred value in wei.
    pub value: u128,
}

/// The JSON-RPC surface this adapter needs from an EVM node. The wire
/// client owns transport, operator key handling, nonce and gas.
#[async_trait]
pub trait EvmRpc: Send + Sync + 'static {
    /// Receipt for a mined transaction; `None` when unknown or pending.
    async fn transaction_receipt(&self, tx: &TxId) -> anyhow::Result<Option<EvmReceipt>>;

    /// Body of a mined transaction; `None` when unknown or pending.
    async fn transaction(&self, tx: &TxId) -> anyhow::Result<Option<EvmTransaction>>;

    /// Submits a signed native-coin transfer from the operator account.
    async fn send_native_transfer(&self, from: &str, to: &str, value: u128)
        -> anyhow::Result<TxId>;

    /// Submits a signed contract call from the operator account.
    async fn send_contract_call(
        &self,
        from: &str,
        contract: &str,
        calldata: Vec<u8>,
    ) -> anyhow::Result<TxId>;

    /// Native-coin balance of an account, in wei.
    async fn native_balance(&self, address: &str) -> anyhow::Result<u128>;

    /// ERC-20 balance of an account (`balanceOf` call).
    async fn erc20_balance(&self, contract: &str, address: &str) -> anyhow::Result<u128>;

    /// Deploys a throwaway ERC-20 for test-mode networks and returns
    /// its contract address.
    async fn deploy_test_token(&self, from: &str) -> anyhow::Result<String>;

    /// Liveness probe.
    async fn block_number(&self) -> anyhow::Result<u64>;
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Adapter for one `eip155:*` network.
pub struct EvmAdapter {
    chain: ChainId,
    alias: Option<String>,
    description: String,
    receiver: Address,
    operator: Option<Address>,
    timeout: Duration,
    test_mode: bool,
    rpc: Arc<dyn EvmRpc>,
}

impl EvmAdapter {
    pub fn new(chain: ChainId, cfg: &NetworkConfig, rpc: Arc<dyn EvmRpc>) -> EngineResult<Self> {
        let operator = cfg
            .operator_address
            .as_deref()
            .map(|s| parse_evm_address(&chain, s))
            .transpose()?;
        let receiver = match cfg.receiver_address.as_deref() {
            Some(s) => parse_evm_address(&chain, s)?,
            None => operator.clone().ok_or_else(|| {
                EngineError::Config(format!("{chain}: neither receiver nor operator configured"))
            })?,
        };
        let description = cfg
            .description
            .clone()
            .unwrap_or_else(|| format!("EVM network {}", chain.reference()));
        Ok(EvmAdapter {
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

    fn operator_hex(&self) -> EngineResult<&str> {
        match &self.operator {
            Some(Address::Evm(hex)) => Ok(hex),
            _ => Err(EngineError::Config(format!(
                "{}: no operator account configured for payouts",
                self.chain
            ))),
        }
    }

    /// Sums Transfer events in `logs` that moved `contract` tokens from
    /// `sender` to `receiver`.
    fn sum_transfers(
        &self,
        logs: &[EvmLog],
        contract: &str,
        sender: &str,
        receiver: &str,
    ) -> EngineResult<u128> {
        let mut total: u128 = 0;
        for log in logs {
            if normalize_hex(&log.address) != contract {
                continue;
            }
            if log.topics.len() != 3 {
                continue;
            }
            if normalize_hex(&log.topics[0]) != TRANSFER_TOPIC {
                continue;
            }
            let (Some(from), Some(to)) = (
                topic_address(&log.topics[1]),
                topic_address(&log.topics[2]),
            ) else {
                continue;
            };
            if from != sender || to != receiver {
                continue;
            }
            let amount = uint256_to_u128(&log.data)?;
            total = total.checked_add(amount).ok_or_else(|| {
                EngineError::Invariant(format!(
                    "transfer sum overflows for contract {contract}"
                ))
            })?;
        }
        Ok(total)
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
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
        parse_evm_address(&self.chain, s)
    }

    fn parse_tx_id(&self, s: &str) -> EngineResult<TxId> {
        TxId::parse_hex(s).ok_or_else(|| {
            EngineError::Format(format!("not a 32-byte hex transaction ID: {s:?}"))
        })
    }

    fn parse_asset(&self, s: &str) -> EngineResult<AssetHandle> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("ETH") {
            return Ok(AssetHandle::Native);
        }
        match s.split_once(':') {
            Some(("erc20", contract)) => {
                let addr = parse_evm_address(&self.chain, contract)?;
                Ok(AssetHandle::Contract(addr))
            }
            Some(("slip44", NATIVE_COIN_TYPE)) => Ok(AssetHandle::Native),
            Some(("slip44", other)) => Err(EngineError::Unsupported(format!(
                "slip44:{other} is not the native coin of an EVM chain"
            ))),
            _ => Err(EngineError::Format(format!(
                "unrecognized EVM asset ID: {s:?}"
            ))),
        }
    }

    fn caip_asset_id(&self, asset: &AssetHandle) -> AssetId {
        match asset {
            AssetHandle::Native => AssetId::from_canonical(format!("slip44:{NATIVE_COIN_TYPE}")),
            AssetHandle::Contract(addr) => AssetId::from_canonical(format!("erc20:0x{addr}")),
        }
    }

    fn verify_personal_signature(
        &self,
        message: &[u8],
        signature: &[u8],
        signer: &str,
    ) -> EngineResult<bool> {
        let expected = parse_evm_hex(&self.chain, signer)?;
        if signature.len() != 65 {
            return Err(EngineError::Format(format!(
                "EVM personal signature must be 65 bytes, got {}",
                signature.len()
            )));
        }
        let v = signature[64];
        let v = if v >= 27 { v - 27 } else { v };
        let recovery = RecoveryId::try_from(v)
            .map_err(|_| EngineError::Format(format!("invalid recovery byte {v}")))?;
        let sig = Signature::from_slice(&signature[..64])
            .map_err(|e| EngineError::Format(format!("malformed signature: {e}")))?;

        let digest = personal_message_hash(message);
        let key = match VerifyingKey::recover_from_prehash(&digest, &sig, recovery) {
            Ok(key) => key,
            // unrecoverable signatures are invalid, not malformed input
            Err(_) => return Ok(false),
        };
        Ok(address_of_key(&key) == *expected)
    }

    async fn get_balance(&self, asset: &AssetHandle, address: &Address) -> EngineResult<u128> {
        let Address::Evm(hex) = address else {
            return Err(EngineError::Format(
                "EVM balance query requires an EVM address".into(),
            ));
        };
        match asset {
            AssetHandle::Native => {
                with_timeout(self.timeout, "eth_getBalance", async {
                    self.rpc.native_balance(hex).await
                })
                .await
            }
            AssetHandle::Contract(Address::Evm(contract)) => {
                with_timeout(self.timeout, "erc20 balanceOf", async {
                    self.rpc.erc20_balance(contract, hex).await
                })
                .await
            }
            AssetHandle::Contract(_) => Err(EngineError::Format(
                "EVM token asset must be an EVM contract address".into(),
            )),
        }
    }

    async fn check_transaction(
        &self,
        tx: &TxId,
        expected_sender: &Address,
        asset: &AssetHandle,
        receiver: &Address,
    ) -> EngineResult<Option<u128>> {
        let (Address::Evm(sender_hex), Address::Evm(receiver_hex)) = (expected_sender, receiver)
        else {
            return Err(EngineError::Format(
                "EVM deposit check requires EVM addresses".into(),
            ));
        };

        let receipt = match with_timeout(self.timeout, "eth_getTransactionReceipt", async {
            self.rpc.transaction_receipt(tx).await
        })
        .await?
        {
            Some(receipt) => receipt,
            None => {
                debug!(%tx, "transaction not yet mined");
                return Ok(None);
            }
        };

        if normalize_hex(&receipt.from) != *sender_hex {
            return Err(EngineError::SenderMismatch {
                expected: sender_hex.clone(),
                actual: normalize_hex(&receipt.from),
            });
        }
        if !receipt.succeeded {
            // a reverted transaction moved nothing and never will
            debug!(%tx, "transaction reverted; not verifiable");
            return Ok(None);
        }

        match asset {
            AssetHandle::Contract(Address::Evm(contract)) => {
                let sum = self.sum_transfers(&receipt.logs, contract, sender_hex, receiver_hex)?;
                Ok(Some(sum))
            }
            AssetHandle::Contract(_) => Err(EngineError::Format(
                "EVM token asset must be an EVM contract address".into(),
            )),
            AssetHandle::Native => {
                let body = match with_timeout(self.timeout, "eth_getTransactionByHash", async {
                    self.rpc.transaction(tx).await
                })
                .await?
                {
                    Some(body) => body,
                    None => return Ok(None),
                };
                let paid = match body.to.as_deref().map(normalize_hex) {
                    Some(to) if to == *receiver_hex => body.value,
                    _ => 0,
                };
                Ok(Some(paid))
            }
        }
    }

    async fn make_payout(
        &self,
        asset: &AssetHandle,
        to: &Address,
        amount: u128,
    ) -> EngineResult<TxId> {
        let Address::Evm(to_hex) = to else {
            return Err(EngineError::Format(
                "EVM payout destination must be an EVM address".into(),
            ));
        };
        let operator = self.operator_hex()?.to_string();
        match asset {
            AssetHandle::Native => {
                with_timeout(self.timeout, "eth_sendTransaction", async {
                    self.rpc.send_native_transfer(&operator, to_hex, amount).await
                })
                .await
            }
            AssetHandle::Contract(Address::Evm(contract)) => {
                let calldata = erc20_transfer_calldata(to_hex, amount)?;
                with_timeout(self.timeout, "eth_sendTransaction", async {
                    self.rpc
                        .send_contract_call(&operator, contract, calldata)
                        .await
                })
                .await
            }
            AssetHandle::Contract(_) => Err(EngineError::Format(
                "EVM token asset must be an EVM contract address".into(),
            )),
        }
    }

    async fn configure_asset(&self, spec: &str) -> EngineResult<AssetHandle> {
        if spec.trim() == "test" {
            if !self.test_mode {
                return Err(EngineError::Config(format!(
                    "{}: the \"test\" asset requires test mode",
                    self.chain
                )));
            }
            let operator = self.operator_hex()?.to_string();
            let contract = with_timeout(self.timeout, "deploy test token", async {
                self.rpc.deploy_test_token(&operator).await
            })
            .await?;
            let addr = parse_evm_address(&self.chain, &contract)?;
            warn!(chain = %self.chain, contract = %addr, "deployed throwaway test token");
            return Ok(AssetHandle::Contract(addr));
        }
        self.parse_asset(spec)
    }

    async fn status(&self) -> AdapterStatus {
        let connected = with_timeout(self.timeout, "eth_blockNumber", async {
            self.rpc.block_number().await
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
// Parsing and hashing helpers
// ---------------------------------------------------------------------------

/// Lowercases a hex string and strips any `0x` prefix.
fn normalize_hex(s: &str) -> String {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    s.to_lowercase()
}

/// Parses an EVM account string (bare hex, `0x` hex, or CAIP-10 with a
/// prefix matching `chain`) to its canonical lowercase hex form.
fn parse_evm_hex(chain: &ChainId, s: &str) -> EngineResult<String> {
    let s = s.trim();
    let (prefix, bare) = split_caip10(s);
    if let Some(prefix) = prefix {
        if prefix != chain.as_str() {
            return Err(EngineError::Format(format!(
                "address {s:?} belongs to chain {prefix}, not {chain}"
            )));
        }
    }
    let hex = normalize_hex(bare);
    if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(EngineError::Format(format!(
            "not a 20-byte hex EVM address: {bare:?}"
        )));
    }
    Ok(hex)
}

fn parse_evm_address(chain: &ChainId, s: &str) -> EngineResult<Address> {
    parse_evm_hex(chain, s).map(Address::Evm)
}

/// Extracts the address packed into a 32-byte indexed topic.
fn topic_address(topic: &str) -> Option<String> {
    let hex = normalize_hex(topic);
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    // address topics are left-padded with zeros
    if !hex[..24].bytes().all(|b| b == b'0') {
        return None;
    }
    Some(hex[24..].to_string())
}

/// Decodes a big-endian uint256 word into `u128`.
///
/// # Errors
///
/// [`EngineError::Invariant`] when the word has the wrong width or the
/// value exceeds `u128`. Amounts beyond that are not representable in
/// the ledger and crediting a truncation would corrupt it.
fn uint256_to_u128(data: &[u8]) -> EngineResult<u128> {
    if data.len() != 32 {
        return Err(EngineError::Invariant(format!(
            "transfer amount word is {} bytes, expected 32",
            data.len()
        )));
    }
    if data[..16].iter().any(|&b| b != 0) {
        return Err(EngineError::Invariant(
            "transfer amount exceeds 128 bits".into(),
        ));
    }
    let mut word = [0u8; 16];
    word.copy_from_slice(&data[16..]);
    Ok(u128::from_be_bytes(word))
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// The `personal_sign` digest of `message`.
fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// The address a secp256k1 public key controls: the trailing 20 bytes
/// of the Keccak-256 of the uncompressed point.
fn address_of_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    hex::encode(&digest[12..])
}

/// ABI-encodes `transfer(address,uint256)` calldata.
fn erc20_transfer_calldata(to_hex: &str, amount: u128) -> EngineResult<Vec<u8>> {
    let to_bytes = hex::decode(to_hex)
        .map_err(|e| EngineError::Format(format!("bad payout address {to_hex:?}: {e}")))?;
    let mut calldata = Vec::with_capacity(4 + 32 + 32);
    calldata.extend_from_slice(&[0xa9, 0x05, 0x9c, 0xbb]);
    calldata.extend_from_slice(&[0u8; 12]);
    calldata.extend_from_slice(&to_bytes);
    calldata.extend_from_slice(&[0u8; 16]);
    calldata.extend_from_slice(&amount.to_be_bytes());
    Ok(calldata)
}
