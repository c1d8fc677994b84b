//! Error types for the TokEngine core.
//!
//! Every fallible operation in the engine returns an [`EngineError`]. The
//! variants map one-to-one onto the retry semantics a caller needs:
//! some failures are permanent (a malformed address will never become
//! valid), some are retryable (an RPC timeout), and one is fatal
//! ([`EngineError::Invariant`] — corrupted state, refuse and log loudly).
//!
//! "Transaction not yet verifiable" is deliberately NOT an error: it is
//! the `Ok(None)` value of [`check_transaction`] and
//! [`make_deposit`], because an unconfirmed deposit is a normal outcome
//! the caller retries with the same proof.
//!
//! [`check_transaction`]: crate::adapter::ChainAdapter::check_transaction
//! [`make_deposit`]: crate::engine::Engine::make_deposit

use thiserror::Error;

use crate::caip::ChainId;

/// Errors that can occur during engine, ledger, and adapter operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed address, asset ID, transaction ID, or chain ID.
    ///
    /// Never retryable — this is a caller or configuration bug.
    #[error("invalid format: {0}")]
    Format(String),

    /// The capability is not implemented for this asset or chain family.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The on-chain transaction was sent by someone other than the
    /// claimed depositor. Rejected loudly: crediting it would let a
    /// caller claim another user's payment.
    #[error("transaction sender {actual} does not match expected sender {expected}")]
    SenderMismatch {
        /// The address the caller claimed sent the funds.
        expected: String,
        /// The address the chain says actually sent them.
        actual: String,
    },

    /// A receipt for this `(chain, tx)` pair is already recorded.
    ///
    /// Permanent: the funds from this transaction were already credited.
    #[error("duplicate deposit: transaction {tx} on {chain} already credited")]
    DuplicateDeposit {
        /// The chain the transaction was observed on.
        chain: ChainId,
        /// Hex transaction ID.
        tx: String,
    },

    /// A debit or payout exceeds the available balance.
    ///
    /// Permanent for the current state; no mutation occurred.
    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds {
        /// The balance available at the time of the request.
        available: u128,
        /// The amount that was requested.
        requested: u128,
    },

    /// An RPC transport failure or timeout while talking to a chain.
    ///
    /// Caller-retryable; the engine itself never retries.
    #[error("transient chain error: {0}")]
    TransientChain(String),

    /// A state invariant was violated: negative verified amount,
    /// arithmetic overflow, corrupted persisted state.
    ///
    /// Fatal — refuse the operation, no silent recovery.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Startup misconfiguration, e.g. duplicate token registration or
    /// a missing RPC endpoint.
    #[error("configuration error: {0}")]
    Config(String),

    /// The engine, store, or queue has been closed.
    #[error("engine is closed")]
    Closed,
}

impl EngineError {
    /// Whether a caller may retry the same request unchanged and hope
    /// for a different outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientChain(_))
    }
}

/// Shorthand result alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;
