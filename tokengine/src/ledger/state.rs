//! Immutable ledger state snapshot.
//!
//! [`LedgerState`] is a plain value: balances, deposit receipts, and the
//! token mapping tables, all in ordinary maps. The ledger wrapper in
//! [`super`] holds the current snapshot behind an `Arc` and mutates by
//! cloning, editing the clone, and swapping it in. Readers therefore
//! always see a consistent snapshot, and every method here is a simple
//! synchronous edit with no locking of its own.
//!
//! All mutators use checked arithmetic. Overflow and underflow surface
//! as errors; the state is never left partially modified by a failed
//! call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::caip::{AssetId, ChainId, TokenKey, TxId, UserKey};
use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A recorded deposit receipt: one per `(chain, tx)` pair, written at
/// the moment the deposit was credited. Its presence is the idempotency
/// barrier against double-crediting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRecord {
    /// Token the deposit credited, as a `chain/asset` key string.
    pub token: String,
    /// Ledger user that was credited.
    pub user: UserKey,
    /// Verified amount, in the asset's smallest unit. May be zero.
    pub amount: u128,
    /// ISO-8601 UTC timestamp of the credit.
    pub timestamp: String,
}

/// Per-token mapping data registered at configuration time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    /// Symbol the token carries on its network.
    pub symbol: String,
    /// Deposit receiver account for this token, canonical string form.
    pub receiver: String,
}

// ---------------------------------------------------------------------------
// LedgerState
// ---------------------------------------------------------------------------

/// The full ledger value at one instant.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerState {
    /// Monotonic mutation counter, bumped once per committed mutation.
    pub version: u64,

    /// Virtual credit balances: token -> user -> amount. Absent entries
    /// mean zero; a balance debited to zero is removed rather than kept
    /// as an explicit zero.
    pub credits: HashMap<TokenKey, HashMap<UserKey, u128>>,

    /// Deposit receipts: chain ID string -> tx hex -> record.
    pub receipts: HashMap<String, HashMap<String, ReceiptRecord>>,

    /// Registered token mappings, keyed by `chain/asset` string.
    pub tokens: HashMap<String, TokenRecord>,

    /// Symbol lookup: `chain/symbol` (symbol lowercased) -> asset ID.
    pub symbols: HashMap<String, AssetId>,
}

impl LedgerState {
    /// Current balance for a user under a token. Zero when absent.
    pub fn balance(&self, token: &TokenKey, user: &UserKey) -> u128 {
        self.credits
            .get(token)
            .and_then(|m| m.get(user))
            .copied()
            .unwrap_or(0)
    }

    /// Adds `amount` to the user's balance and returns the new balance.
    ///
    /// # Errors
    ///
    /// [`EngineError::Invariant`] if the balance would overflow `u128`.
    pub fn credit(&mut self, token: &TokenKey, user: &UserKey, amount: u128) -> EngineResult<u128> {
        let entry = self
            .credits
            .entry(token.clone())
            .or_default()
            .entry(user.clone())
            .or_insert(0);
        *entry = entry.checked_add(amount).ok_or_else(|| {
            EngineError::Invariant(format!("balance overflow crediting {amount} to {user}"))
        })?;
        Ok(*entry)
    }

    /// Subtracts `amount` from the user's balance and returns the new
    /// balance. Zero balances are removed from the maps.
    ///
    /// # Errors
    ///
    /// [`EngineError::InsufficientFunds`] when the balance is short; the
    /// state is unchanged in that case.
    pub fn debit(&mut self, token: &TokenKey, user: &UserKey, amount: u128) -> EngineResult<u128> {
        let available = self.balance(token, user);
        let remaining = available
            .checked_sub(amount)
            .ok_or(EngineError::InsufficientFunds {
                available,
                requested: amount,
            })?;
        if let Some(users) = self.credits.get_mut(token) {
            if remaining == 0 {
                users.remove(user);
                if users.is_empty() {
                    self.credits.remove(token);
                }
            } else {
                users.insert(user.clone(), remaining);
            }
        }
        Ok(remaining)
    }

    /// Looks up the receipt recorded for a `(chain, tx)` pair.
    pub fn receipt(&self, chain: &ChainId, tx: &TxId) -> Option<&ReceiptRecord> {
        self.receipts.get(chain.as_str())?.get(&tx.to_hex())
    }

    /// Records a deposit receipt.
    ///
    /// # Errors
    ///
    /// [`EngineError::DuplicateDeposit`] if the pair is already present.
    pub fn record_receipt(
        &mut self,
        chain: &ChainId,
        tx: &TxId,
        record: ReceiptRecord,
    ) -> EngineResult<()> {
        let per_chain = self.receipts.entry(chain.as_str().to_string()).or_default();
        let hex = tx.to_hex();
        if per_chain.contains_key(&hex) {
            return Err(EngineError::DuplicateDeposit {
                chain: chain.clone(),
                tx: hex,
            });
        }
        per_chain.insert(hex, record);
        Ok(())
    }

    /// Registers a token mapping and its symbol lookup entry.
    ///
    /// Re-registering an identical mapping is a no-op, so restarts over
    /// persisted state can replay their configuration.
    ///
    /// # Errors
    ///
    /// [`EngineError::Config`] if the token or its symbol is already
    /// registered differently on the same chain.
    pub fn register_token(
        &mut self,
        token: &TokenKey,
        symbol: &str,
        receiver: String,
    ) -> EngineResult<()> {
        let token_key = token.to_string();
        if let Some(existing) = self.tokens.get(&token_key) {
            if existing.symbol == symbol && existing.receiver == receiver {
                return Ok(());
            }
            return Err(EngineError::Config(format!(
                "token {token_key} is already registered with different settings"
            )));
        }
        let symbol_key = format!("{}/{}", token.chain(), symbol.to_lowercase());
        if self.symbols.contains_key(&symbol_key) {
            return Err(EngineError::Config(format!(
                "symbol {symbol} is already registered on {}",
                token.chain()
            )));
        }
        self.tokens.insert(
            token_key,
            TokenRecord {
                symbol: symbol.to_string(),
                receiver,
            },
        );
        self.symbols.insert(symbol_key, token.asset().clone());
        Ok(())
    }

    /// The mapping record for a token, if registered.
    pub fn token_record(&self, token: &TokenKey) -> Option<&TokenRecord> {
        self.tokens.get(&token.to_string())
    }

    /// Resolves a symbol to the asset it denotes on `chain`.
    /// Case-insensitive.
    pub fn asset_for_symbol(&self, chain: &ChainId, symbol: &str) -> Option<&AssetId> {
        self.symbols
            .get(&format!("{}/{}", chain, symbol.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> TokenKey {
        "convex:test/cad29:72".parse().unwrap()
    }

    fn user(s: &str) -> UserKey {
        UserKey::new(s)
    }

    #[test]
    fn credit_then_debit_round_trip() {
        let mut state = LedgerState::default();
        let t = token();
        let u = user("#11");

        assert_eq!(state.credit(&t, &u, 1090).unwrap(), 1090);
        assert_eq!(state.balance(&t, &u), 1090);
        assert_eq!(state.debit(&t, &u, 500).unwrap(), 590);
        assert_eq!(state.balance(&t, &u), 590);
    }

    #[test]
    fn debit_to_zero_removes_the_entry() {
        let mut state = LedgerState::default();
        let t = token();
        let u = user("#11");

        state.credit(&t, &u, 100).unwrap();
        assert_eq!(state.debit(&t, &u, 100).unwrap(), 0);
        assert!(state.credits.is_empty());
        assert_eq!(state.balance(&t, &u), 0);
    }

    #[test]
    fn overdraw_fails_and_leaves_state_untouched() {
        let mut state = LedgerState::default();
        let t = token();
        let u = user("#11");
        state.credit(&t, &u, 500).unwrap();

        let err = state.debit(&t, &u, 1000).unwrap_err();
        match err {
            EngineError::InsufficientFunds {
                available,
                requested,
            } => {
                assert_eq!(available, 500);
                assert_eq!(requested, 1000);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(state.balance(&t, &u), 500);
    }

    #[test]
    fn credit_overflow_is_an_invariant_violation() {
        let mut state = LedgerState::default();
        let t = token();
        let u = user("#11");
        state.credit(&t, &u, u128::MAX).unwrap();
        assert!(matches!(
            state.credit(&t, &u, 1),
            Err(EngineError::Invariant(_))
        ));
    }

    #[test]
    fn receipts_are_write_once() {
        let mut state = LedgerState::default();
        let chain = ChainId::parse("eip155:11155111").unwrap();
        let tx = TxId::from_bytes([7u8; 32]);
        let record = ReceiptRecord {
            token: token().to_string(),
            user: user("#11"),
            amount: 1090,
            timestamp: "2026-01-01T00:00:00.000Z".into(),
        };

        state.record_receipt(&chain, &tx, record.clone()).unwrap();
        assert_eq!(state.receipt(&chain, &tx), Some(&record));
        assert!(matches!(
            state.record_receipt(&chain, &tx, record),
            Err(EngineError::DuplicateDeposit { .. })
        ));
    }

    #[test]
    fn symbol_lookup_is_case_insensitive_and_unique() {
        let mut state = LedgerState::default();
        let t = token();
        state.register_token(&t, "USDT", "#900".into()).unwrap();

        let chain = t.chain().clone();
        assert_eq!(
            state.asset_for_symbol(&chain, "usdt"),
            Some(t.asset())
        );
        assert_eq!(
            state.asset_for_symbol(&chain, "USDT"),
            Some(t.asset())
        );
        assert!(state.asset_for_symbol(&chain, "OTHER").is_none());

        let dup = "convex:test/cad29:99".parse().unwrap();
        assert!(matches!(
            state.register_token(&dup, "usdt", "#900".into()),
            Err(EngineError::Config(_))
        ));

        // identical re-registration is fine; a conflicting one is not
        assert!(state.register_token(&t, "USDT", "#900".into()).is_ok());
        assert!(state.register_token(&t, "USDT", "#901".into()).is_err());
    }

    #[test]
    fn state_serde_round_trip() {
        let mut state = LedgerState::default();
        let t = token();
        state.credit(&t, &user("#11"), 1090).unwrap();
        state.register_token(&t, "USDT", "#900".into()).unwrap();
        state.version = 3;

        let json = serde_json::to_string(&state).unwrap();
        let back: LedgerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, 3);
        assert_eq!(back.balance(&t, &user("#11")), 1090);
        assert_eq!(back.token_record(&t).unwrap().symbol, "USDT");
    }
}
