//! # Virtual Credit Ledger
//!
//! The ledger is the single source of truth for user balances. It holds
//! the current [`LedgerState`] behind an `Arc` and mutates copy-on-write:
//! one process-wide write lock serializes mutations, each mutation
//! clones the snapshot, edits the clone, persists it, and swaps it in.
//! Reads grab the `Arc` and never block behind a writer.
//!
//! Every committed mutation bumps the version, is written through to
//! the store, and emits an audit record. Persistence failures are
//! reported but do not roll back the in-memory commit: the process
//! keeps serving with the authoritative in-memory state.

mod state;
mod store;

pub use state::{LedgerState, ReceiptRecord, TokenRecord};
pub use store::LedgerStore;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::audit::{timestamp_string, AuditKind, AuditQueue, AuditRecord};
use crate::caip::{AssetId, ChainId, TokenKey, TxId, UserKey};
use crate::error::EngineResult;

/// The balance ledger. Cheap to share behind an `Arc`.
pub struct Ledger {
    current: RwLock<Arc<LedgerState>>,
    write: Mutex<()>,
    store: LedgerStore,
    audit: Arc<AuditQueue>,
    server: String,
    config_fingerprint: String,
}

impl Ledger {
    /// Opens the ledger over `store`, resuming persisted state when
    /// present.
    ///
    /// # Errors
    ///
    /// Propagates store corruption; a missing state is not an error.
    pub fn open(
        store: LedgerStore,
        audit: Arc<AuditQueue>,
        server: impl Into<String>,
        config_fingerprint: impl Into<String>,
    ) -> EngineResult<Self> {
        let config_fingerprint = config_fingerprint.into();
        let state = match store.load(&config_fingerprint)? {
            Some(state) => state,
            None => {
                info!("starting with a fresh ledger");
                LedgerState::default()
            }
        };
        Ok(Ledger {
            current: RwLock::new(Arc::new(state)),
            write: Mutex::new(()),
            store,
            audit,
            server: server.into(),
            config_fingerprint,
        })
    }

    /// The current state snapshot. Consistent and immutable; later
    /// mutations produce new snapshots and leave this one untouched.
    pub fn snapshot(&self) -> Arc<LedgerState> {
        Arc::clone(&self.current.read())
    }

    /// Runs one mutation against a clone of the current state, commits
    /// the clone, and emits the produced audit records in order.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut LedgerState) -> EngineResult<(T, Vec<AuditRecord>)>,
    ) -> EngineResult<T> {
        let _guard = self.write.lock();
        let mut next = (**self.current.read()).clone();
        let (value, events) = f(&mut next)?;
        next.version += 1;
        if let Err(e) = self.store.persist(&next, &self.config_fingerprint) {
            warn!(error = %e, "ledger persistence failed; serving from memory");
        }
        *self.current.write() = Arc::new(next);
        for event in events {
            if !self.audit.submit(event) {
                debug!("audit record dropped: queue unavailable");
            }
        }
        Ok(value)
    }

    fn audit_record(
        &self,
        kind: AuditKind,
        token: &TokenKey,
        user: &UserKey,
        amount: u128,
        new_balance: u128,
    ) -> AuditRecord {
        AuditRecord {
            kind,
            token: token.to_string(),
            user: user.to_string(),
            amount,
            new_balance,
            timestamp: timestamp_string(),
            server: self.server.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Current balance for `user` under `token`. Zero when absent.
    pub fn virtual_credit(&self, token: &TokenKey, user: &UserKey) -> u128 {
        self.snapshot().balance(token, user)
    }

    /// Credits `amount` to the user and returns the new balance.
    pub fn add_virtual_credit(
        &self,
        token: &TokenKey,
        user: &UserKey,
        amount: u128,
    ) -> EngineResult<u128> {
        self.mutate(|state| {
            let new_balance = state.credit(token, user, amount)?;
            let event = self.audit_record(AuditKind::Credit, token, user, amount, new_balance);
            Ok((new_balance, vec![event]))
        })
    }

    /// Debits `amount` from the user and returns the new balance.
    ///
    /// # Errors
    ///
    /// [`crate::error::EngineError::InsufficientFunds`] when the balance
    /// is short; nothing is committed or audited in that case.
    pub fn subtract_virtual_credit(
        &self,
        token: &TokenKey,
        user: &UserKey,
        amount: u128,
    ) -> EngineResult<u128> {
        self.mutate(|state| {
            let new_balance = state.debit(token, user, amount)?;
            let event = self.audit_record(AuditKind::Debit, token, user, amount, new_balance);
            Ok((new_balance, vec![event]))
        })
    }

    /// Applies a verified deposit: records the `(chain, tx)` receipt and
    /// credits the verified amount, atomically with respect to other
    /// mutations. Returns the new balance.
    ///
    /// A zero verified amount is legal (the transaction genuinely moved
    /// nothing to the receiver); the receipt is still recorded so the
    /// transaction cannot be replayed later.
    ///
    /// # Errors
    ///
    /// [`crate::error::EngineError::DuplicateDeposit`] when the receipt
    /// already exists.
    pub fn apply_deposit(
        &self,
        chain: &ChainId,
        tx: &TxId,
        token: &TokenKey,
        user: &UserKey,
        amount: u128,
    ) -> EngineResult<u128> {
        self.mutate(|state| {
            state.record_receipt(
                chain,
                tx,
                ReceiptRecord {
                    token: token.to_string(),
                    user: user.clone(),
                    amount,
                    timestamp: timestamp_string(),
                },
            )?;
            if amount == 0 {
                warn!(%tx, %token, "deposit verified with zero amount; recording receipt only");
            }
            let new_balance = state.credit(token, user, amount)?;
            let event = self.audit_record(AuditKind::Credit, token, user, amount, new_balance);
            Ok((new_balance, vec![event]))
        })
    }

    /// Registers a token mapping from configuration.
    ///
    /// # Errors
    ///
    /// [`crate::error::EngineError::Config`] on duplicate token or
    /// symbol registration.
    pub fn register_token(
        &self,
        token: &TokenKey,
        symbol: &str,
        receiver: String,
    ) -> EngineResult<()> {
        self.mutate(|state| {
            state.register_token(token, symbol, receiver)?;
            Ok(((), Vec::new()))
        })
    }

    /// The mapping record for a registered token.
    pub fn token_record(&self, token: &TokenKey) -> Option<TokenRecord> {
        self.snapshot().token_record(token).cloned()
    }

    /// Resolves a symbol to its asset on `chain`, case-insensitively.
    pub fn asset_for_symbol(&self, chain: &ChainId, symbol: &str) -> Option<AssetId> {
        self.snapshot().asset_for_symbol(chain, symbol).cloned()
    }

    /// Whether a receipt exists for the `(chain, tx)` pair.
    pub fn has_receipt(&self, chain: &ChainId, tx: &TxId) -> bool {
        self.snapshot().receipt(chain, tx).is_some()
    }

    /// The audit queue this ledger emits into.
    pub fn audit(&self) -> &AuditQueue {
        &self.audit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemorySink;
    use crate::error::EngineError;

    fn ledger_with_sink() -> (Ledger, Arc<MemorySink>) {
        let sink = MemorySink::new();
        let audit = Arc::new(AuditQueue::start(sink.clone()));
        let ledger = Ledger::open(
            LedgerStore::temporary().unwrap(),
            audit,
            "http://localhost:8080",
            "cfg",
        )
        .unwrap();
        (ledger, sink)
    }

    fn token() -> TokenKey {
        "convex:test/cad29:72".parse().unwrap()
    }

    #[tokio::test]
    async fn snapshots_are_stable_across_mutations() {
        let (ledger, _sink) = ledger_with_sink();
        let t = token();
        let u = UserKey::new("#11");

        ledger.add_virtual_credit(&t, &u, 100).unwrap();
        let before = ledger.snapshot();
        ledger.add_virtual_credit(&t, &u, 50).unwrap();

        assert_eq!(before.balance(&t, &u), 100);
        assert_eq!(ledger.virtual_credit(&t, &u), 150);
        assert_eq!(ledger.snapshot().version, before.version + 1);
    }

    #[tokio::test]
    async fn deposits_are_idempotent_per_transaction() {
        let (ledger, _sink) = ledger_with_sink();
        let t = token();
        let u = UserKey::new("#11");
        let chain = t.chain().clone();
        let tx = TxId::from_bytes([9u8; 32]);

        assert_eq!(ledger.apply_deposit(&chain, &tx, &t, &u, 1090).unwrap(), 1090);
        assert!(matches!(
            ledger.apply_deposit(&chain, &tx, &t, &u, 1090),
            Err(EngineError::DuplicateDeposit { .. })
        ));
        assert_eq!(ledger.virtual_credit(&t, &u), 1090);
        assert!(ledger.has_receipt(&chain, &tx));
    }

    #[tokio::test]
    async fn failed_debit_commits_and_audits_nothing() {
        let (ledger, sink) = ledger_with_sink();
        let t = token();
        let u = UserKey::new("#11");

        ledger.add_virtual_credit(&t, &u, 500).unwrap();
        let version = ledger.snapshot().version;

        assert!(matches!(
            ledger.subtract_virtual_credit(&t, &u, 1000),
            Err(EngineError::InsufficientFunds { .. })
        ));
        assert_eq!(ledger.snapshot().version, version);
        assert_eq!(ledger.virtual_credit(&t, &u), 500);

        ledger.audit().close().await;
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, AuditKind::Credit);
    }

    #[tokio::test]
    async fn mutations_emit_ordered_audit_records() {
        let (ledger, sink) = ledger_with_sink();
        let t = token();
        let u = UserKey::new("#11");

        ledger.apply_deposit(&t.chain().clone(), &TxId::from_bytes([1; 32]), &t, &u, 1090)
            .unwrap();
        ledger.subtract_virtual_credit(&t, &u, 500).unwrap();
        ledger.audit().close().await;

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, AuditKind::Credit);
        assert_eq!(records[0].amount, 1090);
        assert_eq!(records[0].new_balance, 1090);
        assert_eq!(records[1].kind, AuditKind::Debit);
        assert_eq!(records[1].new_balance, 590);
        assert_eq!(records[1].server, "http://localhost:8080");
    }

    #[tokio::test]
    async fn zero_amount_deposit_records_receipt_without_credit() {
        let (ledger, _sink) = ledger_with_sink();
        let t = token();
        let u = UserKey::new("#11");
        let chain = t.chain().clone();
        let tx = TxId::from_bytes([3u8; 32]);

        assert_eq!(ledger.apply_deposit(&chain, &tx, &t, &u, 0).unwrap(), 0);
        assert!(ledger.has_receipt(&chain, &tx));
        assert_eq!(ledger.virtual_credit(&t, &u), 0);
        // replaying the zero deposit is still a duplicate
        assert!(ledger.apply_deposit(&chain, &tx, &t, &u, 0).is_err());
    }
}
