//! Durable ledger storage on sled.
//!
//! The whole [`LedgerState`] is persisted as one JSON blob under a
//! single key. The state is small (balances and receipts, not chain
//! history), mutations are serialized by the ledger's write lock, and a
//! single-blob write keeps the on-disk value atomic per sled's own
//! guarantees.
//!
//! Alongside the state blob the store keeps a fingerprint of the
//! configuration that produced it. A fingerprint mismatch at load time
//! is reported but not fatal: operators do legitimately edit endpoints
//! and aliases between restarts. A state blob that is present but
//! missing its balance table IS fatal, because continuing would silently
//! zero every user's credit.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

use super::state::LedgerState;

const STATE_KEY: &[u8] = b"ledger/state";
const CONFIG_KEY: &[u8] = b"ledger/config";

/// Sled-backed persistence for the ledger.
pub struct LedgerStore {
    db: sled::Db,
    ephemeral: bool,
}

impl LedgerStore {
    /// Opens (or creates) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .map_err(|e| EngineError::Config(format!("cannot open store at {path:?}: {e}")))?;
        info!(path = %path.display(), "opened ledger store");
        Ok(LedgerStore {
            db,
            ephemeral: false,
        })
    }

    /// Opens an in-memory store that vanishes on drop.
    pub fn temporary() -> EngineResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| EngineError::Config(format!("cannot open temporary store: {e}")))?;
        debug!("opened ephemeral ledger store");
        Ok(LedgerStore {
            db,
            ephemeral: true,
        })
    }

    /// Whether this store is ephemeral (in-memory, test/throwaway mode).
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Loads the persisted state, if any.
    ///
    /// `config_fingerprint` is compared against the fingerprint stored
    /// with the state; a mismatch logs a warning and loads anyway.
    ///
    /// # Errors
    ///
    /// [`EngineError::Invariant`] when a state blob exists but is
    /// unreadable or lacks its balance table. Starting fresh over such
    /// a blob would discard user funds.
    pub fn load(&self, config_fingerprint: &str) -> EngineResult<Option<LedgerState>> {
        let blob = match self
            .db
            .get(STATE_KEY)
            .map_err(|e| EngineError::Invariant(format!("store read failed: {e}")))?
        {
            Some(blob) => blob,
            None => return Ok(None),
        };

        let value: serde_json::Value = serde_json::from_slice(&blob)
            .map_err(|e| EngineError::Invariant(format!("persisted state is not JSON: {e}")))?;
        if value.get("credits").is_none() {
            return Err(EngineError::Invariant(
                "persisted state has no balance table; refusing to start over it".into(),
            ));
        }
        let state: LedgerState = serde_json::from_value(value)
            .map_err(|e| EngineError::Invariant(format!("persisted state is malformed: {e}")))?;

        match self
            .db
            .get(CONFIG_KEY)
            .map_err(|e| EngineError::Invariant(format!("store read failed: {e}")))?
        {
            Some(stored) if stored.as_ref() != config_fingerprint.as_bytes() => {
                warn!("configuration changed since the ledger was last persisted");
            }
            _ => {}
        }

        info!(version = state.version, "loaded persisted ledger state");
        Ok(Some(state))
    }

    /// Persists the state and the configuration fingerprint, then
    /// flushes to disk.
    pub fn persist(&self, state: &LedgerState, config_fingerprint: &str) -> EngineResult<()> {
        let blob = serde_json::to_vec(state)
            .map_err(|e| EngineError::Invariant(format!("state serialization failed: {e}")))?;
        self.db
            .insert(STATE_KEY, blob)
            .map_err(|e| EngineError::Invariant(format!("store write failed: {e}")))?;
        self.db
            .insert(CONFIG_KEY, config_fingerprint.as_bytes())
            .map_err(|e| EngineError::Invariant(format!("store write failed: {e}")))?;
        self.db
            .flush()
            .map_err(|e| EngineError::Invariant(format!("store flush failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caip::{TokenKey, UserKey};

    #[test]
    fn fresh_store_loads_nothing() {
        let store = LedgerStore::temporary().unwrap();
        assert!(store.load("cfg-a").unwrap().is_none());
    }

    #[test]
    fn persist_and_reload_preserves_balances() {
        let store = LedgerStore::temporary().unwrap();
        let token: TokenKey = "eip155:1/slip44:60".parse().unwrap();
        let user = UserKey::new("a752b195b4e7b1af82ca472756edfdb13bc9c79d");

        let mut state = LedgerState::default();
        state.credit(&token, &user, 1090).unwrap();
        state.version = 7;
        store.persist(&state, "cfg-a").unwrap();

        let loaded = store.load("cfg-a").unwrap().unwrap();
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.balance(&token, &user), 1090);
    }

    #[test]
    fn config_mismatch_still_loads() {
        let store = LedgerStore::temporary().unwrap();
        store.persist(&LedgerState::default(), "cfg-a").unwrap();
        assert!(store.load("cfg-b").unwrap().is_some());
    }

    #[test]
    fn blob_without_balance_table_is_fatal() {
        let store = LedgerStore::temporary().unwrap();
        store
            .db
            .insert(STATE_KEY, br#"{"version": 1}"#.to_vec())
            .unwrap();
        assert!(matches!(
            store.load("cfg-a"),
            Err(EngineError::Invariant(_))
        ));
    }

    #[test]
    fn reopening_a_disk_store_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let token: TokenKey = "convex:test/cad29:72".parse().unwrap();
        let user = UserKey::new("#11");

        {
            let store = LedgerStore::open(dir.path()).unwrap();
            let mut state = LedgerState::default();
            state.credit(&token, &user, 42).unwrap();
            store.persist(&state, "cfg").unwrap();
        }

        let store = LedgerStore::open(dir.path()).unwrap();
        let loaded = store.load("cfg").unwrap().unwrap();
        assert_eq!(loaded.balance(&token, &user), 42);
    }
}
