//! Serial work queue.
//!
//! Units are drained FIFO by exactly one background worker, so at most one
//! unit runs at a time. Producers never block. Each unit runs on its own
//! spawned task so an error or panic is contained to that unit.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};

/// A queued unit of work.
pub type WorkUnit = BoxFuture<'static, anyhow::Result<()>>;

struct QueuedUnit {
    label: String,
    epoch: u64,
    unit: WorkUnit,
}

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    /// Accepted but not yet started (includes units a clear will discard)
    pub pending: usize,
    /// 0 or 1
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub discarded: u64,
}

pub struct WorkQueue {
    tx: mpsc::UnboundedSender<QueuedUnit>,
    epoch: Arc<AtomicU64>,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
    closed: AtomicBool,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WorkQueue {
    /// Create the queue and spawn its worker. Must be called inside a tokio
    /// runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));
        let counters = Arc::new(Counters::default());
        let idle = Arc::new(Notify::new());

        let worker = tokio::spawn(run_worker(
            rx,
            Arc::clone(&epoch),
            Arc::clone(&counters),
            Arc::clone(&idle),
        ));

        Self {
            tx,
            epoch,
            counters,
            idle,
            closed: AtomicBool::new(false),
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    /// Append a unit to the queue. Returns false if the queue was shut down.
    pub fn add_task<F>(&self, label: impl Into<String>, unit: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        if self.closed.load(Ordering::SeqCst) {
            tracing::warn!(unit = %label, "Work queue is shut down, dropping unit");
            return false;
        }

        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedUnit {
            label,
            epoch: self.epoch.load(Ordering::SeqCst),
            unit: unit.boxed(),
        };
        match self.tx.send(queued) {
            Ok(()) => true,
            Err(mpsc::error::SendError(queued)) => {
                self.counters.pending.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(unit = %queued.label, "Work queue worker is gone, dropping unit");
                false
            }
        }
    }

    /// Discard every unit that has not started yet. The running unit, if
    /// any, is not interrupted.
    pub fn clear_queue(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            pending = self.counters.pending.load(Ordering::SeqCst),
            epoch = epoch,
            "Cleared work queue"
        );
    }

    pub fn get_queue_info(&self) -> QueueInfo {
        QueueInfo {
            pending: self.counters.pending.load(Ordering::SeqCst),
            running: self.counters.running.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            discarded: self.counters.discarded.load(Ordering::SeqCst),
        }
    }

    /// Wait until every unit enqueued so far, and every unit those units
    /// enqueue in turn, has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let info = self.get_queue_info();
            if info.pending == 0 && info.running == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting units, discard pending ones and stop the worker.
    /// A unit already running finishes on its own task.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.clear_queue();
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                handle.abort();
            }
        }
        self.idle.notify_waiters();
        tracing::info!("Work queue shut down");
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<QueuedUnit>,
    epoch: Arc<AtomicU64>,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
) {
    while let Some(QueuedUnit {
        label,
        epoch: unit_epoch,
        unit,
    }) = rx.recv().await
    {
        // Mark running before dropping pending so the queue never looks idle
        // between the two.
        counters.running.store(1, Ordering::SeqCst);
        counters.pending.fetch_sub(1, Ordering::SeqCst);

        if unit_epoch < epoch.load(Ordering::SeqCst) {
            counters.discarded.fetch_add(1, Ordering::SeqCst);
            counters.running.store(0, Ordering::SeqCst);
            tracing::debug!(unit = %label, "Discarding cleared unit");
            idle.notify_waiters();
            continue;
        }

        tracing::trace!(unit = %label, "Running unit");

        match tokio::spawn(unit).await {
            Ok(Ok(())) => {
                counters.completed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::error!(unit = %label, error = %e, "Work unit failed");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::error!(unit = %label, error = %e, "Work unit panicked");
            }
        }

        counters.running.store(0, Ordering::SeqCst);
        idle.notify_waiters();
    }
}
