//! Queue manager: the pipeline state machine and dispatcher
//!
//! Decides which pending records are eligible now, claims them with
//! atomic leases, and records worker outcomes. All durable transitions
//! live in `storage::records`; this module owns the policy (backoff,
//! attempt bounds, outcome handling).

pub mod sweep;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Notify;

use crate::error::Result;
use crate::storage::records;
use crate::storage::Storage;
use crate::types::{AttemptOutcome, Fingerprint, PipelineConfig, RecordOp, SettledIntent};

/// A record claimed for one upload attempt
#[derive(Debug, Clone)]
pub struct LeasedWork {
    pub path: PathBuf,
    pub op: RecordOp,
    /// Fingerprint recorded at lease time; workers re-validate against it
    pub fingerprint: Option<Fingerprint>,
    /// Attempt number this lease represents (1-based)
    pub attempt: i64,
    pub lease_owner: String,
}

/// Exponential backoff with optional uniform jitter, capped at the
/// configured maximum. `attempt` is 1-based.
pub fn backoff_delay(config: &PipelineConfig, attempt: i64) -> Duration {
    let exp = attempt.saturating_sub(1).min(32) as u32;
    let raw = config
        .backoff_base
        .saturating_mul(2u32.saturating_pow(exp))
        .min(config.backoff_max);

    if config.backoff_jitter > 0.0 {
        let jitter_max = raw.as_secs_f64() * config.backoff_jitter;
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_max);
        (raw + Duration::from_secs_f64(jitter)).min(config.backoff_max)
    } else {
        raw
    }
}

pub struct QueueManager {
    storage: Storage,
    config: PipelineConfig,
    dispatch_wake: Arc<Notify>,
}

impl QueueManager {
    pub fn new(storage: Storage, config: PipelineConfig) -> Self {
        Self {
            storage,
            config,
            dispatch_wake: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Wake the dispatcher (new settled work, ripened retries, ...)
    pub fn wake(&self) {
        self.dispatch_wake.notify_one();
    }

    /// Await the next dispatch wakeup
    pub async fn wakeup(&self) {
        self.dispatch_wake.notified().await;
    }

    /// Apply a settled intent to the store
    pub fn handle_settled(&self, intent: &SettledIntent) -> Result<()> {
        let now = Utc::now();
        match intent {
            SettledIntent::Upload { path, fingerprint } => {
                let path_s = path.display().to_string();
                self.storage.with_transaction(|conn| {
                    records::settle_upload(conn, &path_s, fingerprint, now)
                })?;
                tracing::debug!(path = %path_s, fingerprint = %fingerprint, "Settled change enqueued");
            }
            SettledIntent::Delete { path } => {
                let path_s = path.display().to_string();
                let disposition = self
                    .storage
                    .with_transaction(|conn| records::settle_delete(conn, &path_s, now))?;
                tracing::debug!(path = %path_s, ?disposition, "Settled deletion applied");
            }
        }
        self.wake();
        Ok(())
    }

    /// Claim up to `slots` eligible records, oldest backoff gate first.
    ///
    /// Selection and lease acquisition run in one transaction, and each
    /// lease is still a per-record compare-and-set, so concurrent dispatch
    /// attempts cannot double-claim a path.
    pub fn dispatch(&self, slots: usize) -> Result<Vec<LeasedWork>> {
        if slots == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let lease_duration = self.config.lease_duration;
        self.storage.with_transaction(|conn| {
            let eligible = records::select_eligible(conn, now, slots)?;
            let mut claimed = Vec::with_capacity(eligible.len());

            for record in eligible {
                let owner = uuid::Uuid::new_v4().to_string();
                if records::acquire_lease(conn, &record.path, &owner, now, lease_duration)? {
                    claimed.push(LeasedWork {
                        path: PathBuf::from(&record.path),
                        op: record.op,
                        fingerprint: record.fingerprint.clone(),
                        attempt: record.attempt_count + 1,
                        lease_owner: owner,
                    });
                }
            }

            Ok(claimed)
        })
    }

    /// Record the structural outcome of one attempt
    pub fn report(&self, work: &LeasedWork, outcome: AttemptOutcome) -> Result<()> {
        let now = Utc::now();
        let path = work.path.display().to_string();

        let fingerprint = work.fingerprint.as_ref();

        // Each transition is a compare-and-set against what this lease
        // shipped; `applied == false` means the record was superseded
        // mid-flight and got re-pended (or dropped), so the dispatcher
        // should look again.
        let applied = match outcome {
            AttemptOutcome::Success => {
                let applied = self.storage.with_connection(|conn| {
                    records::mark_uploaded(conn, &path, &work.lease_owner, work.op, fingerprint, now)
                })?;
                if applied {
                    tracing::info!(path = %path, attempt = work.attempt, op = work.op.as_str(), "Shipped");
                } else {
                    tracing::info!(path = %path, "Shipped superseded payload, newer work re-pended");
                }
                applied
            }
            AttemptOutcome::Stale => {
                let applied = self.storage.with_connection(|conn| {
                    records::mark_stale(conn, &path, &work.lease_owner, work.op, fingerprint, now)
                })?;
                tracing::debug!(path = %path, "Content changed under lease, re-pending");
                self.wake();
                applied
            }
            AttemptOutcome::Transient(error) => {
                if work.attempt >= self.config.max_attempts {
                    let applied = self.storage.with_connection(|conn| {
                        records::mark_failed(
                            conn,
                            &path,
                            &work.lease_owner,
                            work.op,
                            fingerprint,
                            &error,
                            now,
                        )
                    })?;
                    if applied {
                        tracing::error!(
                            path = %path,
                            attempts = work.attempt,
                            error = %error,
                            "Giving up after max attempts"
                        );
                    }
                    applied
                } else {
                    let delay = backoff_delay(&self.config, work.attempt);
                    let next = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    let applied = self.storage.with_connection(|conn| {
                        records::mark_retry(
                            conn,
                            &path,
                            &work.lease_owner,
                            work.op,
                            fingerprint,
                            &error,
                            next,
                            now,
                        )
                    })?;
                    tracing::warn!(
                        path = %path,
                        attempt = work.attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "Attempt failed, will retry"
                    );
                    applied
                }
            }
            AttemptOutcome::Permanent(error) => {
                let applied = self.storage.with_connection(|conn| {
                    records::mark_failed(
                        conn,
                        &path,
                        &work.lease_owner,
                        work.op,
                        fingerprint,
                        &error,
                        now,
                    )
                })?;
                if applied {
                    tracing::error!(path = %path, error = %error, "Remote rejected, not retrying");
                }
                applied
            }
        };

        if !applied {
            self.wake();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_bytes;
    use crate::storage::records::get_record;
    use crate::types::RecordStatus;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            backoff_jitter: 0.0,
            max_attempts: 5,
            ..PipelineConfig::default()
        }
    }

    fn manager() -> QueueManager {
        QueueManager::new(Storage::open_in_memory().unwrap(), test_config())
    }

    fn settle(m: &QueueManager, path: &str, content: &[u8]) {
        m.handle_settled(&SettledIntent::Upload {
            path: PathBuf::from(path),
            fingerprint: fingerprint_bytes(content),
        })
        .unwrap();
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = test_config();
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(&config, 10), Duration::from_secs(300));
        assert_eq!(backoff_delay(&config, 60), Duration::from_secs(300));
    }

    #[test]
    fn dispatch_claims_each_record_once() {
        let m = manager();
        settle(&m, "/w/a.txt", b"a");
        settle(&m, "/w/b.txt", b"b");

        let first = m.dispatch(10).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(m.dispatch(10).unwrap().len(), 0, "nothing left to claim");
    }

    #[test]
    fn dispatch_respects_slot_bound() {
        let m = manager();
        settle(&m, "/w/a.txt", b"a");
        settle(&m, "/w/b.txt", b"b");
        settle(&m, "/w/c.txt", b"c");

        assert_eq!(m.dispatch(2).unwrap().len(), 2);
        assert_eq!(m.dispatch(2).unwrap().len(), 1);
    }

    #[test]
    fn transient_failures_escalate_to_failed() {
        let m = manager();
        settle(&m, "/w/a.txt", b"a");

        for attempt in 1..=5 {
            // Ripen the backoff gate so the next dispatch sees the record
            m.storage
                .with_connection(|conn| {
                    conn.execute(
                        "UPDATE change_records SET next_eligible_at = ?",
                        rusqlite::params![Utc::now().to_rfc3339()],
                    )?;
                    Ok(())
                })
                .unwrap();

            let work = m.dispatch(1).unwrap().pop().expect("record claimable");
            assert_eq!(work.attempt, attempt);
            m.report(&work, AttemptOutcome::Transient("HTTP 500".into()))
                .unwrap();
        }

        let record = m
            .storage
            .with_connection(|conn| get_record(conn, "/w/a.txt"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.attempt_count, 5);
        assert_eq!(record.last_error.as_deref(), Some("HTTP 500"));

        // Terminal: never dispatched again
        assert!(m.dispatch(10).unwrap().is_empty());
    }

    #[test]
    fn permanent_failure_skips_retries() {
        let m = manager();
        settle(&m, "/w/a.txt", b"a");

        let work = m.dispatch(1).unwrap().pop().unwrap();
        m.report(&work, AttemptOutcome::Permanent("HTTP 400".into()))
            .unwrap();

        let record = m
            .storage
            .with_connection(|conn| get_record(conn, "/w/a.txt"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.attempt_count, 1);
    }

    #[test]
    fn success_is_terminal_with_attempts_counted() {
        let m = manager();
        settle(&m, "/w/a.txt", b"a");

        let work = m.dispatch(1).unwrap().pop().unwrap();
        m.report(&work, AttemptOutcome::Success).unwrap();

        let record = m
            .storage
            .with_connection(|conn| get_record(conn, "/w/a.txt"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::Uploaded);
        assert!(record.attempt_count >= 1);
        assert!(m.dispatch(10).unwrap().is_empty());
    }

    #[test]
    fn stale_repends_immediately_without_attempt() {
        let m = manager();
        settle(&m, "/w/a.txt", b"a");

        let work = m.dispatch(1).unwrap().pop().unwrap();
        m.report(&work, AttemptOutcome::Stale).unwrap();

        let record = m
            .storage
            .with_connection(|conn| get_record(conn, "/w/a.txt"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.attempt_count, 0);

        // Immediately claimable again
        assert_eq!(m.dispatch(1).unwrap().len(), 1);
    }

    #[test]
    fn success_on_superseded_lease_redispatches_new_content() {
        let m = manager();
        settle(&m, "/w/a.txt", b"hello");

        // Lease granted for "hello"; the file moves on while the upload
        // is on the wire
        let work = m.dispatch(1).unwrap().pop().unwrap();
        settle(&m, "/w/a.txt", b"hello world");
        m.report(&work, AttemptOutcome::Success).unwrap();

        // Not terminal: the uploaded payload is not what the record wants
        let record = m
            .storage
            .with_connection(|conn| get_record(conn, "/w/a.txt"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.fingerprint, Some(fingerprint_bytes(b"hello world")));

        // The superseding content dispatches and terminalizes normally
        let work = m.dispatch(1).unwrap().pop().expect("new content claimable");
        assert_eq!(work.fingerprint, Some(fingerprint_bytes(b"hello world")));
        m.report(&work, AttemptOutcome::Success).unwrap();

        let record = m
            .storage
            .with_connection(|conn| get_record(conn, "/w/a.txt"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::Uploaded);
        assert_eq!(record.fingerprint, Some(fingerprint_bytes(b"hello world")));
        assert!(m.dispatch(10).unwrap().is_empty());
    }

    #[test]
    fn delete_racing_failed_upload_leaves_no_junk_work() {
        let m = manager();
        settle(&m, "/w/a.txt", b"x");

        let work = m.dispatch(1).unwrap().pop().unwrap();
        // File deleted while the first (and only) upload attempt is out
        m.handle_settled(&SettledIntent::Delete {
            path: PathBuf::from("/w/a.txt"),
        })
        .unwrap();
        m.report(&work, AttemptOutcome::Transient("read failed".into()))
            .unwrap();

        // The remote never saw the file; no delete work survives
        let record = m
            .storage
            .with_connection(|conn| get_record(conn, "/w/a.txt"))
            .unwrap();
        assert!(record.is_none());
        assert!(m.dispatch(10).unwrap().is_empty());
    }

    #[test]
    fn retry_gate_blocks_immediate_redispatch() {
        let m = manager();
        settle(&m, "/w/a.txt", b"a");

        let work = m.dispatch(1).unwrap().pop().unwrap();
        m.report(&work, AttemptOutcome::Transient("HTTP 503".into()))
            .unwrap();

        // Backoff gate is ~1s out, so nothing is eligible right now
        assert!(m.dispatch(10).unwrap().is_empty());
    }
}
