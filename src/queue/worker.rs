//! Upload worker pool
//!
//! A dispatcher loop feeds leased records into a bounded channel; a fixed
//! set of worker tasks consumes it. Workers re-validate content right
//! before the network call so a file edited after lease acquisition is
//! re-pended instead of shipped stale.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::fingerprint::fingerprint_bytes;
use crate::queue::{LeasedWork, QueueManager};
use crate::transport::{Transport, TransportStatus};
use crate::types::{AttemptOutcome, RecordOp};

const DISPATCH_TICK: Duration = Duration::from_millis(500);

pub struct WorkerPool {
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    work_tx: async_channel::Sender<(LeasedWork, OwnedSemaphorePermit)>,
}

impl WorkerPool {
    /// Spawn the dispatcher and worker tasks
    pub fn start(manager: Arc<QueueManager>, transport: Arc<dyn Transport>) -> Self {
        let concurrency = manager.config().concurrency.max(1);
        let (work_tx, work_rx) =
            async_channel::bounded::<(LeasedWork, OwnedSemaphorePermit)>(concurrency);
        // One permit per lease, held from dispatch until the outcome is
        // recorded, so outstanding leases never exceed the worker count
        // no matter how long uploads run.
        let in_flight = Arc::new(Semaphore::new(concurrency));

        let dispatcher = {
            let manager = manager.clone();
            let work_tx = work_tx.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(DISPATCH_TICK);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = manager.wakeup() => {}
                        _ = tick.tick() => {}
                    }

                    let slots = in_flight.available_permits();
                    let batch = match manager.dispatch(slots) {
                        Ok(batch) => batch,
                        Err(e) => {
                            // Store hiccups are transient; retry next tick
                            tracing::warn!("Dispatch failed: {}", e);
                            continue;
                        }
                    };

                    for work in batch {
                        let permit = match in_flight.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return,
                        };
                        if work_tx.send((work, permit)).await.is_err() {
                            tracing::info!("Work channel closed, dispatcher stopping");
                            return;
                        }
                    }
                }
            })
        };

        let workers = (0..concurrency)
            .map(|i| {
                let manager = manager.clone();
                let transport = transport.clone();
                let work_rx = work_rx.clone();
                tokio::spawn(async move {
                    while let Ok((work, permit)) = work_rx.recv().await {
                        let path = work.path.display().to_string();
                        let outcome = run_attempt(&work, transport.as_ref()).await;
                        if let Err(e) = manager.report(&work, outcome) {
                            tracing::error!(worker = i, path = %path, "Failed to record outcome: {}", e);
                        }
                        drop(permit);
                    }
                    tracing::debug!(worker = i, "Worker stopped");
                })
            })
            .collect();

        Self {
            dispatcher,
            workers,
            work_tx,
        }
    }

    /// Stop accepting new work and wait for in-flight uploads to finish.
    /// Any record still leased at abort time is recovered by the sweep on
    /// next start.
    pub async fn shutdown(self) {
        self.work_tx.close();
        self.dispatcher.abort();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// Perform one attempt for a leased record and classify the result
pub async fn run_attempt(work: &LeasedWork, transport: &dyn Transport) -> AttemptOutcome {
    match work.op {
        RecordOp::Upload => run_upload(work, transport).await,
        RecordOp::Delete => to_outcome(transport.delete(&work.path).await),
    }
}

async fn run_upload(work: &LeasedWork, transport: &dyn Transport) -> AttemptOutcome {
    let leased_fp = match &work.fingerprint {
        Some(fp) => fp,
        // Fingerprint vanished under the lease (delete raced in): the
        // settled delete intent owns the record's future, treat as stale.
        None => return AttemptOutcome::Stale,
    };

    let content = match std::fs::read(&work.path) {
        Ok(bytes) => bytes,
        Err(e) => {
            // Unreadable at upload time: transient, the file may reappear
            return AttemptOutcome::Transient(format!("read failed: {}", e));
        }
    };

    // Re-validate immediately before the network call: newer content is
    // not broken content, so it supersedes this attempt instead of
    // consuming a retry.
    let current_fp = fingerprint_bytes(&content);
    if &current_fp != leased_fp {
        return AttemptOutcome::Stale;
    }

    to_outcome(transport.upload(&work.path, content, leased_fp).await)
}

fn to_outcome(result: Result<TransportStatus>) -> AttemptOutcome {
    match result {
        Ok(TransportStatus::Success) => AttemptOutcome::Success,
        Ok(TransportStatus::Transient(msg)) => AttemptOutcome::Transient(msg),
        Ok(TransportStatus::Permanent(msg)) => AttemptOutcome::Permanent(msg),
        Err(e) if e.is_retryable() => AttemptOutcome::Transient(e.to_string()),
        Err(e) => AttemptOutcome::Permanent(e.to_string()),
    }
}
