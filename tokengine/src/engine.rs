//! # Engine
//!
//! The engine wires configuration, adapters, the ledger, and the audit
//! queue into one object and exposes the deposit/payout operations.
//!
//! Deposits follow check-then-credit: the claimed transaction is
//! verified against its chain first (outside any lock, since it is an
//! RPC round trip), and only a verified amount enters the ledger,
//! atomically with the receipt that makes the transaction unreplayable.
//! Payouts follow debit-then-submit: the source's ledger debit is
//! committed before the chain sees the transfer, and it stands even
//! when submission fails, since the chain may have accepted the
//! transfer anyway. That case is surfaced for manual reconciliation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::adapter::{build_adapter, AdapterStatus, AssetHandle, ChainAdapter, RpcProvider};
use crate::audit::{AuditQueue, AuditSink};
use crate::caip::{AssetId, TokenKey, TxId, UserKey};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{Ledger, LedgerStore};

/// A signed payout instruction presented with a payout request.
#[derive(Clone, Debug)]
pub struct PayoutInstruction {
    /// The human-readable instruction text that was signed.
    pub message: String,
    /// Signature over the message, hex encoded.
    pub signature: String,
    /// The signer, in the chain family's signer format (an address or
    /// a hex public key).
    pub signer: String,
}

/// Aggregate status of the engine and its networks.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub server: String,
    pub ledger_version: u64,
    pub networks: Vec<AdapterStatus>,
}

/// The running engine.
pub struct Engine {
    ledger: Arc<Ledger>,
    audit: Arc<AuditQueue>,
    adapters: Vec<Arc<dyn ChainAdapter>>,
    by_name: HashMap<String, usize>,
    server: String,
    closed: AtomicBool,
}

impl Engine {
    /// Builds and starts an engine from configuration.
    ///
    /// Networks whose adapter fails to build are skipped with an error
    /// log so one unreachable chain does not take the whole service
    /// down. Token mapping conflicts are configuration errors and do
    /// fail startup.
    pub async fn start(
        config: EngineConfig,
        provider: &dyn RpcProvider,
        audit_sink: Option<Arc<dyn AuditSink>>,
    ) -> EngineResult<Self> {
        let audit = Arc::new(match audit_sink {
            Some(sink) => AuditQueue::start(sink),
            None => {
                if config.operations.audit_url.is_some() {
                    warn!("audit endpoint configured but no sink wired; auditing disabled");
                }
                AuditQueue::disabled()
            }
        });

        let store = match config.operations.store_path.as_deref() {
            None | Some("temp") => LedgerStore::temporary()?,
            Some(path) => LedgerStore::open(path)?,
        };
        let fingerprint = serde_json::to_string(&config)
            .map_err(|e| EngineError::Config(format!("configuration not serializable: {e}")))?;
        let server = config.server_field().to_string();
        let ledger = Arc::new(Ledger::open(
            store,
            Arc::clone(&audit),
            server.clone(),
            fingerprint,
        )?);

        let mut adapters: Vec<Arc<dyn ChainAdapter>> = Vec::new();
        let mut by_name = HashMap::new();
        for net in &config.networks {
            let adapter = match build_adapter(net, provider) {
                Ok(adapter) => adapter,
                Err(e) => {
                    error!(chain = %net.chain_id, error = %e, "skipping network: adapter failed to build");
                    continue;
                }
            };
            if let Err(e) = adapter.start().await {
                error!(chain = %net.chain_id, error = %e, "skipping network: adapter failed to start");
                continue;
            }
            let idx = adapters.len();
            let mut names = vec![net.chain_id.clone(), adapter.chain_id().as_str().to_string()];
            if let Some(alias) = adapter.alias() {
                names.push(alias.to_string());
            }
            names.sort();
            names.dedup();
            for name in names {
                if by_name.insert(name.clone(), idx).is_some() {
                    return Err(EngineError::Config(format!(
                        "network name {name:?} is claimed by more than one network"
                    )));
                }
            }
            info!(chain = %adapter.chain_id(), description = adapter.description(), "connected network");
            adapters.push(adapter);
        }

        let engine = Engine {
            ledger,
            audit,
            adapters,
            by_name,
            server,
            closed: AtomicBool::new(false),
        };

        for token in &config.tokens {
            for entry in &token.networks {
                let Ok(adapter) = engine.adapter(&entry.network) else {
                    warn!(
                        token = token.alias,
                        network = entry.network,
                        "skipping token deployment on unconnected network"
                    );
                    continue;
                };
                let handle = match adapter.configure_asset(&entry.asset_id).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(
                            token = token.alias,
                            network = entry.network,
                            error = %e,
                            "skipping token deployment"
                        );
                        continue;
                    }
                };
                let key = TokenKey::new(
                    adapter.chain_id().clone(),
                    adapter.caip_asset_id(&handle),
                );
                let receiver = match entry.receiver_address.as_deref() {
                    Some(s) => adapter.parse_address(s)?,
                    None => adapter.receiver_address().clone(),
                };
                let symbol = entry.symbol.as_deref().unwrap_or(&token.alias);
                engine
                    .ledger
                    .register_token(&key, symbol, receiver.to_string())?;
                info!(token = %key, symbol, "registered token");
            }
        }

        Ok(engine)
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    /// Looks up an adapter by chain ID or alias.
    ///
    /// # Errors
    ///
    /// [`EngineError::Unsupported`] for an unknown network name.
    pub fn adapter(&self, network: &str) -> EngineResult<&Arc<dyn ChainAdapter>> {
        self.by_name
            .get(network.trim())
            .map(|&idx| &self.adapters[idx])
            .ok_or_else(|| EngineError::Unsupported(format!("no such network: {network:?}")))
    }

    /// Resolves an asset spec — a CAIP-19 ID or a registered symbol —
    /// on the given adapter's chain.
    fn resolve_asset(
        &self,
        adapter: &Arc<dyn ChainAdapter>,
        spec: &str,
    ) -> EngineResult<(AssetHandle, TokenKey)> {
        let spec = spec.trim();
        let handle = if spec.contains(':') {
            adapter.parse_asset(spec)?
        } else if let Some(asset) = self.ledger.asset_for_symbol(adapter.chain_id(), spec) {
            adapter.parse_asset(asset.as_str())?
        } else {
            // native-coin symbols (ETH/CVM/XTZ) resolve without
            // registration; anything else is unknown
            adapter.parse_asset(spec).map_err(|_| {
                EngineError::Unsupported(format!("no token {spec:?} on {}", adapter.chain_id()))
            })?
        };
        let key = TokenKey::new(adapter.chain_id().clone(), adapter.caip_asset_id(&handle));
        Ok((handle, key))
    }

    /// Resolves `token` — a CAIP-19 ID, a registered symbol, or a bare
    /// native-coin symbol — to its canonical asset ID on the adapter's
    /// chain, or `None` when nothing on that chain answers to it.
    pub fn lookup_caip_asset_id(
        &self,
        adapter: &Arc<dyn ChainAdapter>,
        token: &str,
    ) -> Option<AssetId> {
        self.resolve_asset(adapter, token)
            .ok()
            .map(|(_, key)| key.asset().clone())
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Verifies a claimed deposit transaction and credits the verified
    /// amount to the sender's virtual balance.
    ///
    /// Returns `Ok(Some(amount))` once credited, or `Ok(None)` while the
    /// transaction is not yet verifiable; callers retry the same call
    /// later.
    pub async fn make_deposit(
        &self,
        network: &str,
        asset: &str,
        sender: &str,
        tx: &str,
    ) -> EngineResult<Option<u128>> {
        self.ensure_open()?;
        let adapter = self.adapter(network)?;
        let sender_addr = adapter.parse_address(sender)?;
        let (handle, token) = self.resolve_asset(adapter, asset)?;
        let record = self.ledger.token_record(&token).ok_or_else(|| {
            EngineError::Unsupported(format!("token {token} is not configured for deposits"))
        })?;
        let receiver = adapter.parse_address(&record.receiver)?;
        let tx = adapter.parse_tx_id(tx)?;
        let chain = adapter.chain_id();

        // cheap duplicate check before the chain round trip; the ledger
        // re-checks under its write lock
        if self.ledger.has_receipt(chain, &tx) {
            return Err(EngineError::DuplicateDeposit {
                chain: chain.clone(),
                tx: tx.to_hex(),
            });
        }

        let amount = match adapter
            .check_transaction(&tx, &sender_addr, &handle, &receiver)
            .await?
        {
            Some(amount) => amount,
            None => return Ok(None),
        };

        let user = UserKey::from(&sender_addr);
        let new_balance = self.ledger.apply_deposit(chain, &tx, &token, &user, amount)?;
        info!(%token, %user, amount, new_balance, %tx, "deposit credited");
        Ok(Some(amount))
    }

    /// Debits `amount` from `source`'s virtual balance and submits the
    /// matching on-chain transfer to `destination`, returning the
    /// submitted transaction ID.
    ///
    /// When a signed instruction is supplied it must verify against the
    /// chain family's signature scheme before anything is debited. The
    /// debit is committed before submission and is never rolled back
    /// here: a submission error after the debit may still have reached
    /// the chain, so it is propagated for manual reconciliation.
    pub async fn make_payout(
        &self,
        network: &str,
        asset: &str,
        source: &str,
        destination: &str,
        amount: u128,
        instruction: Option<&PayoutInstruction>,
    ) -> EngineResult<TxId> {
        self.ensure_open()?;
        let adapter = self.adapter(network)?;
        let from = adapter.parse_address(source)?;
        let to = adapter.parse_address(destination)?;
        let (handle, token) = self.resolve_asset(adapter, asset)?;

        if let Some(ins) = instruction {
            let sig = ins.signature.trim();
            let sig = sig.strip_prefix("0x").unwrap_or(sig);
            let sig = hex::decode(sig)
                .map_err(|e| EngineError::Format(format!("signature is not hex: {e}")))?;
            if !adapter.verify_personal_signature(ins.message.as_bytes(), &sig, &ins.signer)? {
                return Err(EngineError::Format(
                    "payout instruction signature does not verify".into(),
                ));
            }
        }

        // the operator must actually hold what we are about to send;
        // checked before any debit so a shortfall changes nothing
        let operator_funds = adapter.operator_balance(&handle).await?;
        if operator_funds < amount {
            return Err(EngineError::InsufficientFunds {
                available: operator_funds,
                requested: amount,
            });
        }

        let user = UserKey::from(&from);
        self.ledger.subtract_virtual_credit(&token, &user, amount)?;
        match adapter.make_payout(&handle, &to, amount).await {
            Ok(tx) => {
                info!(%token, %user, destination = %to, amount, %tx, "payout submitted");
                Ok(tx)
            }
            Err(e) => {
                // the transfer may have reached the chain despite the
                // error, so the debit stands; reconcile by hand against
                // the audited DEBIT record
                error!(
                    %token,
                    %user,
                    destination = %to,
                    amount,
                    error = %e,
                    "payout submission failed after debit; manual reconciliation required"
                );
                Err(e)
            }
        }
    }

    /// The account's current virtual balance for an asset.
    pub fn virtual_credit(&self, network: &str, asset: &str, account: &str) -> EngineResult<u128> {
        self.ensure_open()?;
        let adapter = self.adapter(network)?;
        let addr = adapter.parse_address(account)?;
        let (_, token) = self.resolve_asset(adapter, asset)?;
        Ok(self.ledger.virtual_credit(&token, &UserKey::from(&addr)))
    }

    /// Probes every network and reports aggregate status.
    pub async fn status(&self) -> EngineStatus {
        let mut networks = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            networks.push(adapter.status().await);
        }
        EngineStatus {
            server: self.server.clone(),
            ledger_version: self.ledger.snapshot().version,
            networks,
        }
    }

    /// The underlying ledger.
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Stops accepting operations and drains the audit queue. Records
    /// already queued are delivered before this returns. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for adapter in &self.adapters {
            adapter.close().await;
        }
        self.audit.close().await;
        info!("engine closed");
    }
}
