//! # TokEngine
//!
//! A custodial bridging ledger. TokEngine watches deposits of tokens on
//! several chain families, credits each depositor with off-chain
//! *virtual credit*, and authorizes payouts back to any connected
//! chain. The on-chain transaction is the proof of deposit: the engine
//! verifies it against the chain itself before a single unit is
//! credited, and records a receipt so it can never be credited twice.
//!
//! ## Architecture
//!
//! - [`caip`] — chain-agnostic identifiers (CAIP-2/10/19) and their
//!   canonical wrappers.
//! - [`adapter`] — one adapter per chain family (EVM, Convex, Tezos)
//!   translating identifiers, verifying deposits, submitting payouts.
//! - [`ledger`] — the balance book: copy-on-write snapshots, receipt
//!   dedup, sled persistence.
//! - [`audit`] — the ordered, fire-and-forget audit trail of every
//!   balance mutation.
//! - [`engine`] — the orchestrator tying the above to configuration.
//!
//! Outer surfaces (HTTP API, CLI, real JSON-RPC clients) live outside
//! this crate and plug in through [`adapter::RpcProvider`] and
//! [`audit::AuditSink`].

pub mod adapter;
pub mod audit;
pub mod caip;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;

pub use caip::{Address, AssetId, ChainId, TokenKey, TxId, UserKey};
pub use engine::{Engine, EngineStatus, PayoutInstruction};
pub use error::{EngineError, EngineResult};
