//! Bounded queue and background worker feeding a [`UsageSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::UsageSink;
use crate::router::retry::BACKOFF_DURATIONS;
use crate::tracker::UsageRecord;

/// Sending half of the persistence queue. Never blocks.
#[derive(Clone)]
pub struct UsageQueue {
    tx: mpsc::Sender<UsageRecord>,
    dropped: Arc<AtomicU64>,
}

impl UsageQueue {
    /// Hand a record to the worker. When the queue is full the record is
    /// dropped and counted; the in-memory ledger still has it.
    pub fn enqueue(&self, record: UsageRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(record_id = %record.id, "usage queue full, record not persisted");
            }
            Err(TrySendError::Closed(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(record_id = %record.id, "usage worker stopped, record not persisted");
            }
        }
    }

    /// Records that never reached the worker.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Append one record, retrying with backoff. Returns whether it was stored.
async fn append_with_retry(sink: &dyn UsageSink, record: &UsageRecord) -> bool {
    let mut attempt = 0;
    loop {
        match sink.append(record).await {
            Ok(()) => return true,
            Err(e) if attempt < BACKOFF_DURATIONS.len() => {
                let delay = BACKOFF_DURATIONS[attempt];
                tracing::warn!(
                    record_id = %record.id,
                    attempt = attempt + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Failed to persist usage record, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    record_id = %record.id,
                    attempts = attempt + 1,
                    error = %e,
                    "Giving up on usage record"
                );
                return false;
            }
        }
    }
}

/// Start the persistence worker.
///
/// The worker drains the queue in order and exits once every [`UsageQueue`]
/// clone has been dropped and the queue is empty.
pub fn spawn_usage_worker(
    sink: Arc<dyn UsageSink>,
    capacity: usize,
) -> (UsageQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<UsageRecord>(capacity.max(1));
    let queue = UsageQueue {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };

    let handle = tokio::spawn(async move {
        let mut stored = 0u64;
        let mut lost = 0u64;
        while let Some(record) = rx.recv().await {
            if append_with_retry(sink.as_ref(), &record).await {
                stored += 1;
            } else {
                lost += 1;
            }
        }
        tracing::debug!(stored, lost, "usage worker stopped");
    });

    (queue, handle)
}
