//! # Audit Trail
//!
//! Every balance mutation emits an audit record describing the change.
//! Records are fire-and-forget: submission never blocks or fails the
//! mutation that produced them, and delivery happens on exactly one
//! background task so records reach the sink in submission order.
//!
//! The queue is unbounded. Audit volume is bounded by deposit/payout
//! throughput, which is itself serialized by the ledger write lock, so
//! backpressure here would only add a failure mode without protecting
//! anything.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// The direction of a balance mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    /// Balance increased (a deposit was credited).
    #[serde(rename = "CREDIT")]
    Credit,
    /// Balance decreased (a payout was authorized).
    #[serde(rename = "DEBIT")]
    Debit,
}

/// One audit record, emitted per committed balance mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// CREDIT or DEBIT.
    #[serde(rename = "type")]
    pub kind: AuditKind,
    /// The token mutated, as a `chain/asset` key string.
    pub token: String,
    /// The ledger user whose balance changed.
    pub user: String,
    /// Amount of the change, smallest asset unit.
    pub amount: u128,
    /// Balance after the change.
    pub new_balance: u128,
    /// ISO-8601 UTC timestamp, millisecond precision.
    pub timestamp: String,
    /// Public URL of the server that made the change.
    pub server: String,
}

/// Renders the current UTC time the way audit records carry it,
/// e.g. `2026-08-25T14:03:07.123Z`.
pub fn timestamp_string() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

// ---------------------------------------------------------------------------
// Sink and queue
// ---------------------------------------------------------------------------

/// Destination for audit records. Implementations deliver to whatever
/// backs the trail (a message broker, a file, a test buffer).
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    /// Delivers one record. Errors are logged by the worker and the
    /// record is dropped; delivery is not retried.
    async fn deliver(&self, record: &AuditRecord) -> anyhow::Result<()>;
}

struct QueueInner {
    tx: Option<mpsc::UnboundedSender<AuditRecord>>,
    worker: Option<JoinHandle<()>>,
}

/// The audit queue: an unbounded channel drained by a single worker
/// task, preserving submission order.
pub struct AuditQueue {
    inner: Mutex<QueueInner>,
}

impl AuditQueue {
    /// Starts a queue delivering to `sink`. Must be called from within
    /// a tokio runtime.
    pub fn start(sink: Arc<dyn AuditSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();
        let worker = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = sink.deliver(&record).await {
                    warn!(error = %e, token = %record.token, "audit delivery failed");
                }
            }
            debug!("audit worker drained and stopped");
        });
        AuditQueue {
            inner: Mutex::new(QueueInner {
                tx: Some(tx),
                worker: Some(worker),
            }),
        }
    }

    /// A queue with no sink. Every submission reports "not queued".
    pub fn disabled() -> Self {
        AuditQueue {
            inner: Mutex::new(QueueInner {
                tx: None,
                worker: None,
            }),
        }
    }

    /// Submits a record for delivery. Returns whether it was queued;
    /// `false` after [`close`](Self::close) or on a disabled queue.
    pub fn submit(&self, record: AuditRecord) -> bool {
        let inner = self.inner.lock();
        match &inner.tx {
            Some(tx) => tx.send(record).is_ok(),
            None => false,
        }
    }

    /// Closes the queue and waits for every already-queued record to be
    /// delivered. Idempotent.
    pub async fn close(&self) {
        let worker = {
            let mut inner = self.inner.lock();
            inner.tx = None; // dropping the sender ends the worker loop
            inner.worker.take()
        };
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "audit worker ended abnormally");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// An in-memory sink that buffers records for later inspection. Used by
/// tests and by deployments that poll the trail over the status surface.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(MemorySink::default())
    }

    /// A copy of everything delivered so far, in delivery order.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn deliver(&self, record: &AuditRecord) -> anyhow::Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u128) -> AuditRecord {
        AuditRecord {
            kind: AuditKind::Credit,
            token: "convex:test/cad29:72".into(),
            user: "#11".into(),
            amount: n,
            new_balance: n,
            timestamp: timestamp_string(),
            server: "http://localhost:8080".into(),
        }
    }

    #[tokio::test]
    async fn records_arrive_in_submission_order() {
        let sink = MemorySink::new();
        let queue = AuditQueue::start(sink.clone());

        for n in 0..100u128 {
            assert!(queue.submit(record(n)));
        }
        queue.close().await;

        let delivered = sink.records();
        assert_eq!(delivered.len(), 100);
        for (n, rec) in delivered.iter().enumerate() {
            assert_eq!(rec.amount, n as u128);
        }
    }

    #[tokio::test]
    async fn close_drains_then_rejects() {
        let sink = MemorySink::new();
        let queue = AuditQueue::start(sink.clone());

        assert!(queue.submit(record(1)));
        queue.close().await;
        assert_eq!(sink.records().len(), 1);

        assert!(!queue.submit(record(2)));
        // second close is a no-op
        queue.close().await;
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn disabled_queue_never_accepts() {
        let queue = AuditQueue::disabled();
        assert!(!queue.submit(record(1)));
        queue.close().await;
    }

    #[test]
    fn record_serializes_with_wire_field_names() {
        let rec = AuditRecord {
            kind: AuditKind::Debit,
            token: "eip155:1/slip44:60".into(),
            user: "a752b195b4e7b1af82ca472756edfdb13bc9c79d".into(),
            amount: 500,
            new_balance: 590,
            timestamp: "2026-08-25T00:00:00.000Z".into(),
            server: "http://localhost:8080".into(),
        };
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["type"], "DEBIT");
        assert_eq!(json["newBalance"], serde_json::json!(590));
        assert!(json.get("new_balance").is_none());
    }
}
