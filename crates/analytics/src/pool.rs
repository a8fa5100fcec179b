//! The bounded upload worker pool: a fixed number of workers drain a bounded
//! reservoir with per-task exponential backoff; anything that overflows the
//! reservoir is diverted to a best-effort drain that deletes rather than
//! retries, so a burst of staged files never blocks the producer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::uploader::{StagedFile, Uploader};

/// Fixed by policy, not configurable: two concurrent upload workers.
pub const NUM_UPLOADERS: usize = 2;

pub struct Pool {
    reservoir_tx: mpsc::Sender<StagedFile>,
    overflow_tx: mpsc::UnboundedSender<StagedFile>,
    closed: Arc<AtomicBool>,
    short_circuited: Arc<AtomicBool>,
    worker_handles: Vec<JoinHandle<()>>,
    overflow_handle: JoinHandle<()>,
}

impl Pool {
    /// Spawns `NUM_UPLOADERS` workers plus the overflow drain. `capacity` is
    /// the reservoir's bound; pushes beyond it are diverted to overflow
    /// instead of blocking the caller.
    pub fn spawn(uploader: Arc<dyn Uploader>, capacity: usize) -> Pool {
        let (reservoir_tx, reservoir_rx) = mpsc::channel(capacity.max(1));
        let (overflow_tx, overflow_rx) = mpsc::unbounded_channel();

        let closed = Arc::new(AtomicBool::new(false));
        let short_circuited = Arc::new(AtomicBool::new(false));

        let reservoir_rx = Arc::new(tokio::sync::Mutex::new(reservoir_rx));
        let mut worker_handles = Vec::with_capacity(NUM_UPLOADERS);
        for _ in 0..NUM_UPLOADERS {
            let uploader = uploader.clone();
            let closed = closed.clone();
            let short_circuited = short_circuited.clone();
            let reservoir_rx = reservoir_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = reservoir_rx.lock().await;
                        rx.recv().await
                    };
                    match task {
                        Some(task) => upload_with_backoff(&*uploader, task, &closed, &short_circuited).await,
                        None => break,
                    }
                }
            }));
        }

        let overflow_handle = tokio::spawn(drain_overflow(uploader, overflow_rx));

        Pool { reservoir_tx, overflow_tx, closed, short_circuited, worker_handles, overflow_handle }
    }

    /// Pushes a staged file onto the reservoir; diverts to overflow (deleted
    /// without retry) if the reservoir is full, and drops it with a log if
    /// the pool has already been shut down.
    pub fn push(&self, file: StagedFile) {
        match self.reservoir_tx.try_send(file) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(file)) => {
                tracing::warn!(tenant = %file.tenant, file = %file.file_name, "reservoir full, diverting to overflow");
                let _ = self.overflow_tx.send(file);
            }
            Err(mpsc::error::TrySendError::Closed(file)) => {
                tracing::warn!(tenant = %file.tenant, file = %file.file_name, "pool closed, dropping staged file push");
            }
        }
    }

    /// Stops accepting new work and waits for in-flight uploads and the
    /// overflow drain to finish. Staged files still mid-backoff-retry at this
    /// point are abandoned in place, to be picked up by the next recovery.
    pub async fn shutdown(self) {
        self.closed.store(true, Ordering::SeqCst);
        drop(self.reservoir_tx);
        drop(self.overflow_tx);
        for handle in self.worker_handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "upload worker task panicked");
            }
        }
        if let Err(e) = self.overflow_handle.await {
            tracing::error!(error = %e, "overflow drain task panicked");
        }
    }
}

async fn upload_with_backoff(
    uploader: &dyn Uploader,
    task: StagedFile,
    closed: &AtomicBool,
    short_circuited: &AtomicBool,
) {
    let mut backoff = backoff::ExponentialBackoffBuilder::new().with_max_elapsed_time(None).build();

    loop {
        if closed.load(Ordering::SeqCst) {
            tracing::warn!(tenant = %task.tenant, file = %task.file_name, "upload abandoned at shutdown, left staged for recovery");
            return;
        }
        if short_circuited.load(Ordering::SeqCst) {
            tracing::warn!(tenant = %task.tenant, file = %task.file_name, "skipping upload after short-circuit failure this sweep");
            return;
        }

        match uploader.upload_or_delete(&task, false).await {
            Ok(()) => return,
            Err(e) if e.is_short_circuit() => {
                short_circuited.store(true, Ordering::SeqCst);
                tracing::error!(tenant = %task.tenant, file = %task.file_name, error = %e, "short-circuit upload failure");
                return;
            }
            Err(e) => {
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                tracing::warn!(tenant = %task.tenant, file = %task.file_name, error = %e, delay_ms = delay.as_millis() as u64, "transient upload failure, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn drain_overflow(uploader: Arc<dyn Uploader>, mut rx: mpsc::UnboundedReceiver<StagedFile>) {
    while let Some(task) = rx.recv().await {
        if let Err(e) = uploader.upload_or_delete(&task, true).await {
            tracing::error!(tenant = %task.tenant, file = %task.file_name, error = %e, "failed to delete overflow-diverted staged file");
        }
    }
}
