//! Reconciliation sweep
//!
//! Periodic, event-stream-independent pass that repairs state after a
//! crash: expired-lease records revert to pending, and retries whose
//! backoff ripened while the dispatcher slept get a wakeup. This is the
//! only actor allowed to break a lease it does not hold.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::queue::QueueManager;
use crate::storage::records;
use crate::storage::Storage;

pub struct ReconciliationSweep {
    handle: JoinHandle<()>,
}

impl ReconciliationSweep {
    /// Spawn the sweep task with the configured period
    pub fn start(storage: Storage, manager: Arc<QueueManager>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tick.tick().await;
                // Store trouble is never fatal here; log and try again
                // next period.
                if let Err(e) = run_sweep(&storage, &manager) {
                    tracing::warn!("Reconciliation sweep failed: {}", e);
                }
            }
        });

        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

/// One sweep pass: revert expired leases, wake the dispatcher for ripe
/// pending work.
pub fn run_sweep(storage: &Storage, manager: &QueueManager) -> Result<()> {
    let now = Utc::now();

    let reverted = storage.with_transaction(|conn| records::revert_expired_leases(conn, now))?;
    for path in &reverted {
        tracing::warn!(path = %path, "Lease expired, presuming worker dead; re-pended");
    }

    let ripe = storage.with_connection(|conn| records::count_ripe_pending(conn, now))?;
    if ripe > 0 || !reverted.is_empty() {
        manager.wake();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_bytes;
    use crate::storage::records::{acquire_lease, get_record, settle_upload};
    use crate::types::{PipelineConfig, RecordStatus};
    use chrono::Duration as ChronoDuration;

    #[test]
    fn sweep_revives_crashed_upload() {
        let storage = Storage::open_in_memory().unwrap();
        let manager = QueueManager::new(storage.clone(), PipelineConfig::default());

        // Simulate a worker that died holding a lease
        let past = Utc::now() - ChronoDuration::seconds(600);
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fingerprint_bytes(b"x"), past)?;
                acquire_lease(conn, "/w/a.txt", "dead", past, Duration::from_secs(60))?;
                Ok(())
            })
            .unwrap();

        run_sweep(&storage, &manager).unwrap();

        let record = storage
            .with_connection(|conn| get_record(conn, "/w/a.txt"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert!(record.next_eligible_at <= Utc::now());

        // And it is immediately re-dispatchable
        let claimed = manager.dispatch(1).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].path.display().to_string(), "/w/a.txt");
    }

    #[test]
    fn sweep_leaves_live_leases_alone() {
        let storage = Storage::open_in_memory().unwrap();
        let manager = QueueManager::new(storage.clone(), PipelineConfig::default());
        let now = Utc::now();

        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fingerprint_bytes(b"x"), now)?;
                acquire_lease(conn, "/w/a.txt", "alive", now, Duration::from_secs(3600))?;
                Ok(())
            })
            .unwrap();

        run_sweep(&storage, &manager).unwrap();

        let record = storage
            .with_connection(|conn| get_record(conn, "/w/a.txt"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::InProgress);
        assert_eq!(record.lease_owner.as_deref(), Some("alive"));
    }
}
