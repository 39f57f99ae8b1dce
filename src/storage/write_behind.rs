//! Write-behind queue for assistant/tool message batches
//!
//! The turn controller must never wait on the database while a turn is
//! streaming. Batches go into a bounded channel drained by one background
//! worker, which applies them strictly in enqueue order. When the channel
//! is full the batch is dropped with a warning; the producer never blocks.

use super::sessions::SessionStore;
use super::types::StoreBatch;
use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Destination of queued batches
pub trait BatchWriter: Send + Sync + 'static {
    /// Apply one batch atomically
    fn write_batch(&self, batch: &StoreBatch) -> Result<()>;
}

impl BatchWriter for SessionStore {
    fn write_batch(&self, batch: &StoreBatch) -> Result<()> {
        self.save_messages(&batch.session_id, &batch.messages)
    }
}

enum QueueItem {
    Batch(StoreBatch),
    Flush(oneshot::Sender<()>),
}

/// Bounded single-worker queue in front of a [`BatchWriter`]
pub struct WriteBehindQueue {
    tx: Mutex<Option<mpsc::Sender<QueueItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl std::fmt::Debug for WriteBehindQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBehindQueue")
            .field("dropped", &self.dropped_count())
            .field("written", &self.written_count())
            .field("failed", &self.failed_count())
            .finish()
    }
}

impl WriteBehindQueue {
    /// Start the worker on the current Tokio runtime
    ///
    /// # Arguments
    ///
    /// * `writer` - Where batches are applied
    /// * `capacity` - Number of batches that may wait; at least one
    pub fn spawn(writer: Arc<dyn BatchWriter>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let written = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(run_worker(
            writer,
            rx,
            Arc::clone(&written),
            Arc::clone(&failed),
        ));

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            dropped: Arc::new(AtomicU64::new(0)),
            written,
            failed,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<QueueItem>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Try to queue a batch without blocking
    ///
    /// Returns `false` when the batch was dropped because the queue is full
    /// or already shut down.
    pub fn enqueue(&self, batch: StoreBatch) -> bool {
        let Some(tx) = self.sender() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                session_id = %batch.session_id,
                messages = batch.messages.len(),
                "Write queue closed, dropping batch"
            );
            return false;
        };

        match tx.try_send(QueueItem::Batch(batch)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(QueueItem::Batch(batch)))
            | Err(mpsc::error::TrySendError::Closed(QueueItem::Batch(batch))) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    session_id = %batch.session_id,
                    messages = batch.messages.len(),
                    dropped_total = dropped,
                    "Write queue full, dropping batch"
                );
                false
            }
            Err(_) => false,
        }
    }

    /// Wait until every batch enqueued before this call has been applied
    ///
    /// Unlike [`enqueue`](Self::enqueue) this waits for queue space. Returns
    /// immediately if the queue was shut down.
    pub async fn flush(&self) {
        let Some(tx) = self.sender() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(QueueItem::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Close the queue and wait up to `timeout` for pending batches
    ///
    /// Returns `true` if the worker drained everything in time. Later
    /// enqueues are dropped.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        drop(self.tx.lock().unwrap_or_else(|e| e.into_inner()).take());
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(worker) = worker else {
            return true;
        };

        match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(())) => {
                tracing::debug!(
                    written = self.written_count(),
                    dropped = self.dropped_count(),
                    "Write queue drained"
                );
                true
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Write queue worker panicked");
                false
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Write queue did not drain before timeout"
                );
                false
            }
        }
    }

    /// Batches dropped because the queue was full or closed
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Batches applied successfully
    pub fn written_count(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Batches the writer rejected
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

async fn run_worker(
    writer: Arc<dyn BatchWriter>,
    mut rx: mpsc::Receiver<QueueItem>,
    written: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            QueueItem::Batch(batch) => {
                let writer = Arc::clone(&writer);
                let session_id = batch.session_id.clone();
                let count = batch.messages.len();
                match tokio::task::spawn_blocking(move || writer.write_batch(&batch)).await {
                    Ok(Ok(())) => {
                        written.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            session_id = %session_id,
                            messages = count,
                            error = %e,
                            "Failed to write message batch"
                        );
                    }
                    Err(e) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(session_id = %session_id, error = %e, "Batch writer panicked");
                    }
                }
            }
            QueueItem::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::trace!("Write queue worker exiting");
}
