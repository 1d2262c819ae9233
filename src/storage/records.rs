//! Queries and atomic transitions over change records
//!
//! Every mutation here is a single-statement conditional UPDATE (or runs
//! inside the caller's transaction), so the single-writer-per-record
//! discipline is enforced by the store rather than by in-process locks.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, Row};

use crate::error::{RelayError, Result};
use crate::types::{ChangeRecord, Fingerprint, QueueCounts, RecordOp, RecordStatus};

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Parse a change record from a database row
pub fn record_from_row(row: &Row) -> rusqlite::Result<ChangeRecord> {
    let path: String = row.get("path")?;
    let op_str: String = row.get("op")?;
    let content_hash: Option<String> = row.get("content_hash")?;
    let content_size: Option<i64> = row.get("content_size")?;
    let status_str: String = row.get("status")?;
    let attempt_count: i64 = row.get("attempt_count")?;
    let last_attempt_at: Option<String> = row.get("last_attempt_at")?;
    let last_success_at: Option<String> = row.get("last_success_at")?;
    let next_eligible_at: String = row.get("next_eligible_at")?;
    let last_error: Option<String> = row.get("last_error")?;
    let lease_owner: Option<String> = row.get("lease_owner")?;
    let lease_expires_at: Option<String> = row.get("lease_expires_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    let fingerprint = match (content_hash, content_size) {
        (Some(hash), Some(size)) => Some(Fingerprint {
            hash,
            size: size as u64,
        }),
        _ => None,
    };

    Ok(ChangeRecord {
        path,
        op: op_str.parse().unwrap_or(RecordOp::Upload),
        fingerprint,
        status: status_str.parse().unwrap_or(RecordStatus::Pending),
        attempt_count,
        last_attempt_at: parse_ts_opt(last_attempt_at),
        last_success_at: parse_ts_opt(last_success_at),
        next_eligible_at: parse_ts(&next_eligible_at),
        last_error,
        lease_owner,
        lease_expires_at: parse_ts_opt(lease_expires_at),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

const SELECT_COLS: &str = "path, op, content_hash, content_size, status, attempt_count, \
     last_attempt_at, last_success_at, next_eligible_at, last_error, \
     lease_owner, lease_expires_at, created_at, updated_at";

/// Fetch a record by path
pub fn get_record(conn: &Connection, path: &str) -> Result<Option<ChangeRecord>> {
    let sql = format!("SELECT {} FROM change_records WHERE path = ?", SELECT_COLS);
    match conn.query_row(&sql, params![path], record_from_row) {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(RelayError::Database(e)),
    }
}

/// Fingerprint last shipped successfully for this path, if the record is
/// currently `uploaded` with one. Used by the debouncer to suppress
/// settles for content that reverted to an already-uploaded state.
pub fn uploaded_fingerprint(conn: &Connection, path: &str) -> Result<Option<Fingerprint>> {
    let row = conn.query_row(
        "SELECT content_hash, content_size FROM change_records
         WHERE path = ? AND status = 'uploaded' AND op = 'upload'",
        params![path],
        |row| {
            let hash: Option<String> = row.get(0)?;
            let size: Option<i64> = row.get(1)?;
            Ok((hash, size))
        },
    );

    match row {
        Ok((Some(hash), Some(size))) => Ok(Some(Fingerprint {
            hash,
            size: size as u64,
        })),
        Ok(_) => Ok(None),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(RelayError::Database(e)),
    }
}

/// Upsert on a settled upload intent.
///
/// New content (fingerprint differs from the stored one) resets the
/// attempt counter: it is new work, not a retry of the old. Unchanged
/// content on a non-terminal record leaves the counter alone.
pub fn settle_upload(
    conn: &Connection,
    path: &str,
    fingerprint: &Fingerprint,
    now: DateTime<Utc>,
) -> Result<()> {
    let now_s = now.to_rfc3339();
    let existing = get_record(conn, path)?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO change_records
                    (path, op, content_hash, content_size, status, attempt_count,
                     next_eligible_at, created_at, updated_at)
                 VALUES (?, 'upload', ?, ?, 'pending', 0, ?, ?, ?)",
                params![
                    path,
                    fingerprint.hash,
                    fingerprint.size as i64,
                    now_s,
                    now_s,
                    now_s
                ],
            )?;
        }
        Some(record) => {
            let changed = record.fingerprint.as_ref() != Some(fingerprint)
                || record.op != RecordOp::Upload;
            let attempt_count = if changed { 0 } else { record.attempt_count };
            conn.execute(
                "UPDATE change_records SET
                    op = 'upload',
                    content_hash = ?,
                    content_size = ?,
                    status = 'pending',
                    attempt_count = ?,
                    next_eligible_at = ?,
                    last_error = NULL,
                    updated_at = ?
                 WHERE path = ? AND status != 'in_progress'",
                params![
                    fingerprint.hash,
                    fingerprint.size as i64,
                    attempt_count,
                    now_s,
                    now_s,
                    path
                ],
            )?;
            // An in-progress record keeps its lease; the fresh content is
            // recorded so the outcome report sees a superseded lease and
            // re-pends the record with the new fingerprint.
            if record.status == RecordStatus::InProgress {
                conn.execute(
                    "UPDATE change_records SET
                        op = 'upload', content_hash = ?, content_size = ?,
                        attempt_count = 0, updated_at = ?
                     WHERE path = ? AND status = 'in_progress'",
                    params![fingerprint.hash, fingerprint.size as i64, now_s, path],
                )?;
            }
        }
    }

    Ok(())
}

/// What a settled delete intent did to the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteDisposition {
    /// No record existed for the path
    NoRecord,
    /// Path never shipped successfully: record dropped outright
    Dropped,
    /// Remote was told about the file earlier: delete work item enqueued
    Enqueued,
}

/// Apply a settled delete intent per the data-model lifecycle: dropped if
/// never uploaded, otherwise converted into a `delete` work item that runs
/// through the normal dispatch/retry machinery.
pub fn settle_delete(
    conn: &Connection,
    path: &str,
    now: DateTime<Utc>,
) -> Result<DeleteDisposition> {
    let now_s = now.to_rfc3339();
    let existing = get_record(conn, path)?;

    match existing {
        None => Ok(DeleteDisposition::NoRecord),
        Some(record) if record.last_success_at.is_none() => {
            conn.execute(
                "DELETE FROM change_records WHERE path = ? AND status != 'in_progress'",
                params![path],
            )?;
            // An in-flight upload will finish or report stale; convert the
            // leftover record then so the outcome cannot resurrect it.
            if record.status == RecordStatus::InProgress {
                conn.execute(
                    "UPDATE change_records SET
                        op = 'delete', content_hash = NULL, content_size = NULL,
                        attempt_count = 0, next_eligible_at = ?, updated_at = ?
                     WHERE path = ?",
                    params![now_s, now_s, path],
                )?;
            }
            Ok(DeleteDisposition::Dropped)
        }
        Some(_) => {
            conn.execute(
                "UPDATE change_records SET
                    op = 'delete',
                    content_hash = NULL,
                    content_size = NULL,
                    status = CASE WHEN status = 'in_progress' THEN status ELSE 'pending' END,
                    attempt_count = 0,
                    next_eligible_at = ?,
                    last_error = NULL,
                    updated_at = ?
                 WHERE path = ?",
                params![now_s, now_s, path],
            )?;
            Ok(DeleteDisposition::Enqueued)
        }
    }
}

/// Select dispatch-eligible records: pending, past their backoff gate,
/// oldest gate first, bounded by free worker slots.
pub fn select_eligible(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<ChangeRecord>> {
    let sql = format!(
        "SELECT {} FROM change_records
         WHERE status = 'pending' AND next_eligible_at <= ?
         ORDER BY next_eligible_at ASC
         LIMIT ?",
        SELECT_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params![now.to_rfc3339(), limit as i64], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Atomically claim a pending record for a worker.
///
/// The status precondition makes this a compare-and-set: two callers
/// racing for the same path get exactly one winner. The attempt counter
/// increments at attempt start.
pub fn acquire_lease(
    conn: &Connection,
    path: &str,
    owner: &str,
    now: DateTime<Utc>,
    lease_duration: std::time::Duration,
) -> Result<bool> {
    let expires = now + ChronoDuration::from_std(lease_duration).unwrap_or(ChronoDuration::seconds(120));
    let rows = conn.execute(
        "UPDATE change_records SET
            status = 'in_progress',
            attempt_count = attempt_count + 1,
            last_attempt_at = ?,
            lease_owner = ?,
            lease_expires_at = ?,
            updated_at = ?
         WHERE path = ? AND status = 'pending' AND next_eligible_at <= ?",
        params![
            now.to_rfc3339(),
            owner,
            expires.to_rfc3339(),
            now.to_rfc3339(),
            path,
            now.to_rfc3339()
        ],
    )?;
    Ok(rows == 1)
}

/// Record a successful attempt: terminal `uploaded`, error and lease
/// cleared. Only the lease holder may do this, and only while the record
/// still describes what the worker shipped (`op` and fingerprint match
/// the lease). A record superseded mid-flight is re-pended eligible now
/// instead, so the newer work dispatches; returns false in that case.
pub fn mark_uploaded(
    conn: &Connection,
    path: &str,
    owner: &str,
    op: RecordOp,
    fingerprint: Option<&Fingerprint>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let now_s = now.to_rfc3339();
    let rows = conn.execute(
        "UPDATE change_records SET
            status = 'uploaded',
            last_success_at = ?,
            last_error = NULL,
            lease_owner = NULL,
            lease_expires_at = NULL,
            updated_at = ?
         WHERE path = ? AND status = 'in_progress' AND lease_owner = ?
           AND op = ? AND content_hash IS ?",
        params![
            now_s,
            now_s,
            path,
            owner,
            op.as_str(),
            fingerprint.map(|fp| fp.hash.as_str())
        ],
    )?;
    if rows == 1 {
        return Ok(true);
    }

    // Superseded under the lease: what shipped is not what the record
    // now wants. A successful upload still counts as a remote success
    // (the remote holds the old payload), so keep that fact before
    // re-pending the newer work.
    if op == RecordOp::Upload {
        conn.execute(
            "UPDATE change_records SET
                status = 'pending',
                next_eligible_at = ?,
                last_success_at = ?,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = ?
             WHERE path = ? AND status = 'in_progress' AND lease_owner = ?",
            params![now_s, now_s, now_s, path, owner],
        )?;
    } else {
        conn.execute(
            "UPDATE change_records SET
                status = 'pending',
                next_eligible_at = ?,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = ?
             WHERE path = ? AND status = 'in_progress' AND lease_owner = ?",
            params![now_s, now_s, path, owner],
        )?;
    }
    Ok(false)
}

/// Resolve a lease whose record was superseded while the attempt was in
/// flight and the attempt did not succeed. A `delete` work item for a
/// path the remote never received is junk: drop it. Anything else
/// re-pends eligible now so the newer work dispatches.
fn release_superseded_lease(
    conn: &Connection,
    path: &str,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let now_s = now.to_rfc3339();
    let dropped = conn.execute(
        "DELETE FROM change_records
         WHERE path = ? AND status = 'in_progress' AND lease_owner = ?
           AND op = 'delete' AND last_success_at IS NULL",
        params![path, owner],
    )?;
    if dropped == 0 {
        conn.execute(
            "UPDATE change_records SET
                status = 'pending',
                next_eligible_at = ?,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = ?
             WHERE path = ? AND status = 'in_progress' AND lease_owner = ?",
            params![now_s, now_s, path, owner],
        )?;
    }
    Ok(())
}

/// Record a transient failure: back to `pending` behind the backoff gate.
/// Superseded records skip the gate (the failure belonged to old work);
/// returns false in that case.
pub fn mark_retry(
    conn: &Connection,
    path: &str,
    owner: &str,
    op: RecordOp,
    fingerprint: Option<&Fingerprint>,
    error: &str,
    next_eligible_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE change_records SET
            status = 'pending',
            next_eligible_at = ?,
            last_error = ?,
            lease_owner = NULL,
            lease_expires_at = NULL,
            updated_at = ?
         WHERE path = ? AND status = 'in_progress' AND lease_owner = ?
           AND op = ? AND content_hash IS ?",
        params![
            next_eligible_at.to_rfc3339(),
            error,
            now.to_rfc3339(),
            path,
            owner,
            op.as_str(),
            fingerprint.map(|fp| fp.hash.as_str())
        ],
    )?;
    if rows == 1 {
        return Ok(true);
    }
    release_superseded_lease(conn, path, owner, now)?;
    Ok(false)
}

/// Record a terminal failure: excluded from automatic dispatch until an
/// operator re-enqueues it. A superseded record is not terminalized (the
/// failure belonged to old work); returns false in that case.
pub fn mark_failed(
    conn: &Connection,
    path: &str,
    owner: &str,
    op: RecordOp,
    fingerprint: Option<&Fingerprint>,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let now_s = now.to_rfc3339();
    let rows = conn.execute(
        "UPDATE change_records SET
            status = 'failed',
            last_error = ?,
            lease_owner = NULL,
            lease_expires_at = NULL,
            updated_at = ?
         WHERE path = ? AND status = 'in_progress' AND lease_owner = ?
           AND op = ? AND content_hash IS ?",
        params![
            error,
            now_s,
            path,
            owner,
            op.as_str(),
            fingerprint.map(|fp| fp.hash.as_str())
        ],
    )?;
    if rows == 1 {
        return Ok(true);
    }
    release_superseded_lease(conn, path, owner, now)?;
    Ok(false)
}

/// Stale content: immediate re-pend with the attempt-start increment
/// undone, since newer content is not a broken attempt.
pub fn mark_stale(
    conn: &Connection,
    path: &str,
    owner: &str,
    op: RecordOp,
    fingerprint: Option<&Fingerprint>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let now_s = now.to_rfc3339();
    let rows = conn.execute(
        "UPDATE change_records SET
            status = 'pending',
            attempt_count = CASE WHEN attempt_count > 0 THEN attempt_count - 1 ELSE 0 END,
            next_eligible_at = ?,
            lease_owner = NULL,
            lease_expires_at = NULL,
            updated_at = ?
         WHERE path = ? AND status = 'in_progress' AND lease_owner = ?
           AND op = ? AND content_hash IS ?",
        params![
            now_s,
            now_s,
            path,
            owner,
            op.as_str(),
            fingerprint.map(|fp| fp.hash.as_str())
        ],
    )?;
    if rows == 1 {
        return Ok(true);
    }
    release_superseded_lease(conn, path, owner, now)?;
    Ok(false)
}

/// Revert expired-lease `in_progress` records to `pending` so they retry
/// without waiting for a new filesystem event. The sweep is the sole
/// caller: only it may break a lease it does not hold.
pub fn revert_expired_leases(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<String>> {
    let now_s = now.to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT path FROM change_records
         WHERE status = 'in_progress' AND lease_expires_at <= ?",
    )?;
    let paths: Vec<String> = stmt
        .query_map(params![now_s], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if !paths.is_empty() {
        conn.execute(
            "UPDATE change_records SET
                status = 'pending',
                next_eligible_at = ?,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = ?
             WHERE status = 'in_progress' AND lease_expires_at <= ?",
            params![now_s, now_s, now_s],
        )?;
    }

    Ok(paths)
}

/// Count pending records past their backoff gate (used by the sweep to
/// wake the dispatcher for retries that ripened while it slept).
pub fn count_ripe_pending(conn: &Connection, now: DateTime<Utc>) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM change_records
         WHERE status = 'pending' AND next_eligible_at <= ?",
        params![now.to_rfc3339()],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Per-status record counts
pub fn queue_counts(conn: &Connection) -> Result<QueueCounts> {
    let mut counts = QueueCounts::default();
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM change_records GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        let status: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        Ok((status, count))
    })?;
    for row in rows {
        let (status, count) = row?;
        match status.parse::<RecordStatus>() {
            Ok(RecordStatus::Pending) => counts.pending = count,
            Ok(RecordStatus::InProgress) => counts.in_progress = count,
            Ok(RecordStatus::Uploaded) => counts.uploaded = count,
            Ok(RecordStatus::Failed) => counts.failed = count,
            Err(_) => {}
        }
    }
    Ok(counts)
}

/// List terminal failures, most recent first, for operator inspection
pub fn list_failed(conn: &Connection, limit: i64) -> Result<Vec<ChangeRecord>> {
    let sql = format!(
        "SELECT {} FROM change_records
         WHERE status = 'failed'
         ORDER BY updated_at DESC
         LIMIT ?",
        SELECT_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params![limit], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// List records by recency, for operator inspection
pub fn list_recent(conn: &Connection, limit: i64) -> Result<Vec<ChangeRecord>> {
    let sql = format!(
        "SELECT {} FROM change_records
         ORDER BY updated_at DESC
         LIMIT ?",
        SELECT_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params![limit], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Manually re-enqueue a failed record, resetting its attempt counter
pub fn requeue_failed(conn: &Connection, path: &str, now: DateTime<Utc>) -> Result<bool> {
    let now_s = now.to_rfc3339();
    let rows = conn.execute(
        "UPDATE change_records SET
            status = 'pending',
            attempt_count = 0,
            next_eligible_at = ?,
            last_error = NULL,
            updated_at = ?
         WHERE path = ? AND status = 'failed'",
        params![now_s, now_s, path],
    )?;
    Ok(rows == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use std::time::Duration;

    fn fp(content: &[u8]) -> Fingerprint {
        crate::fingerprint::fingerprint_bytes(content)
    }

    #[test]
    fn settle_creates_pending_record() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"hello"), now)?;
                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.status, RecordStatus::Pending);
                assert_eq!(record.attempt_count, 0);
                assert_eq!(record.fingerprint, Some(fp(b"hello")));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn lease_is_compare_and_set() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"x"), now)?;
                let first = acquire_lease(conn, "/w/a.txt", "w1", now, Duration::from_secs(60))?;
                let second = acquire_lease(conn, "/w/a.txt", "w2", now, Duration::from_secs(60))?;
                assert!(first);
                assert!(!second, "second acquirer must lose the race");

                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.status, RecordStatus::InProgress);
                assert_eq!(record.lease_owner.as_deref(), Some("w1"));
                assert_eq!(record.attempt_count, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn only_lease_holder_reports_outcomes() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"x"), now)?;
                acquire_lease(conn, "/w/a.txt", "w1", now, Duration::from_secs(60))?;

                assert!(!mark_uploaded(
                    conn,
                    "/w/a.txt",
                    "imposter",
                    RecordOp::Upload,
                    Some(&fp(b"x")),
                    now
                )?);
                assert!(mark_uploaded(
                    conn,
                    "/w/a.txt",
                    "w1",
                    RecordOp::Upload,
                    Some(&fp(b"x")),
                    now
                )?);

                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.status, RecordStatus::Uploaded);
                assert!(record.lease_owner.is_none());
                assert!(record.last_success_at.is_some());
                assert!(record.last_error.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn new_fingerprint_resets_attempts() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"v1"), now)?;
                acquire_lease(conn, "/w/a.txt", "w1", now, Duration::from_secs(60))?;
                mark_retry(
                    conn,
                    "/w/a.txt",
                    "w1",
                    RecordOp::Upload,
                    Some(&fp(b"v1")),
                    "timeout",
                    now,
                    now,
                )?;

                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.attempt_count, 1);

                settle_upload(conn, "/w/a.txt", &fp(b"v2"), now)?;
                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.attempt_count, 0);
                assert_eq!(record.fingerprint, Some(fp(b"v2")));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn stale_outcome_does_not_consume_attempt() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"v1"), now)?;
                acquire_lease(conn, "/w/a.txt", "w1", now, Duration::from_secs(60))?;
                mark_stale(conn, "/w/a.txt", "w1", RecordOp::Upload, Some(&fp(b"v1")), now)?;

                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.status, RecordStatus::Pending);
                assert_eq!(record.attempt_count, 0);
                assert!(record.next_eligible_at <= Utc::now());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn expired_lease_reverts_via_sweep_query() {
        let storage = Storage::open_in_memory().unwrap();
        let past = Utc::now() - ChronoDuration::seconds(600);
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"x"), past)?;
                acquire_lease(conn, "/w/a.txt", "dead-worker", past, Duration::from_secs(60))?;

                let reverted = revert_expired_leases(conn, Utc::now())?;
                assert_eq!(reverted, vec!["/w/a.txt".to_string()]);

                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.status, RecordStatus::Pending);
                assert!(record.lease_owner.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn unexpired_lease_survives_sweep_query() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"x"), now)?;
                acquire_lease(conn, "/w/a.txt", "alive", now, Duration::from_secs(3600))?;

                let reverted = revert_expired_leases(conn, now)?;
                assert!(reverted.is_empty());

                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.status, RecordStatus::InProgress);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_before_any_success_drops_record() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"x"), now)?;
                let disposition = settle_delete(conn, "/w/a.txt", now)?;
                assert_eq!(disposition, DeleteDisposition::Dropped);
                assert!(get_record(conn, "/w/a.txt")?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_after_success_enqueues_delete_work() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"x"), now)?;
                acquire_lease(conn, "/w/a.txt", "w1", now, Duration::from_secs(60))?;
                mark_uploaded(conn, "/w/a.txt", "w1", RecordOp::Upload, Some(&fp(b"x")), now)?;

                let disposition = settle_delete(conn, "/w/a.txt", now)?;
                assert_eq!(disposition, DeleteDisposition::Enqueued);

                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.op, RecordOp::Delete);
                assert_eq!(record.status, RecordStatus::Pending);
                assert!(record.fingerprint.is_none());
                assert_eq!(record.attempt_count, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn uploaded_fingerprint_ignores_pending_and_tombstones() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"x"), now)?;
                assert!(uploaded_fingerprint(conn, "/w/a.txt")?.is_none());

                acquire_lease(conn, "/w/a.txt", "w1", now, Duration::from_secs(60))?;
                mark_uploaded(conn, "/w/a.txt", "w1", RecordOp::Upload, Some(&fp(b"x")), now)?;
                assert_eq!(uploaded_fingerprint(conn, "/w/a.txt")?, Some(fp(b"x")));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn requeue_resets_failed_record() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"x"), now)?;
                acquire_lease(conn, "/w/a.txt", "w1", now, Duration::from_secs(60))?;
                mark_failed(
                    conn,
                    "/w/a.txt",
                    "w1",
                    RecordOp::Upload,
                    Some(&fp(b"x")),
                    "400 Bad Request",
                    now,
                )?;

                assert_eq!(queue_counts(conn)?.failed, 1);
                assert!(requeue_failed(conn, "/w/a.txt", now)?);

                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.status, RecordStatus::Pending);
                assert_eq!(record.attempt_count, 0);
                assert!(record.last_error.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn superseded_upload_success_repends_new_content() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"v1"), now)?;
                acquire_lease(conn, "/w/a.txt", "w1", now, Duration::from_secs(60))?;
                // Edit lands after the worker read the file, mid network call
                settle_upload(conn, "/w/a.txt", &fp(b"v2"), now)?;

                // The v1 upload succeeds, but the record wants v2 now
                let applied =
                    mark_uploaded(conn, "/w/a.txt", "w1", RecordOp::Upload, Some(&fp(b"v1")), now)?;
                assert!(!applied, "superseded lease must not terminalize");

                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.status, RecordStatus::Pending);
                assert_eq!(record.fingerprint, Some(fp(b"v2")));
                assert!(record.lease_owner.is_none());
                assert!(record.next_eligible_at <= Utc::now());
                // The v1 payload did reach the remote
                assert!(record.last_success_at.is_some());
                // And nothing suppresses re-observation of v2
                assert!(uploaded_fingerprint(conn, "/w/a.txt")?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn superseded_upload_failure_repends_without_terminalizing() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"v1"), now)?;
                acquire_lease(conn, "/w/a.txt", "w1", now, Duration::from_secs(60))?;
                settle_upload(conn, "/w/a.txt", &fp(b"v2"), now)?;

                let applied = mark_failed(
                    conn,
                    "/w/a.txt",
                    "w1",
                    RecordOp::Upload,
                    Some(&fp(b"v1")),
                    "HTTP 400",
                    now,
                )?;
                assert!(!applied);

                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.status, RecordStatus::Pending);
                assert_eq!(record.fingerprint, Some(fp(b"v2")));
                assert!(record.last_success_at.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_during_unshipped_upload_drops_on_failure() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"x"), now)?;
                acquire_lease(conn, "/w/a.txt", "w1", now, Duration::from_secs(60))?;
                // File removed while the first upload is in flight
                settle_delete(conn, "/w/a.txt", now)?;

                // The upload never made it; the remote has nothing to delete
                let applied = mark_retry(
                    conn,
                    "/w/a.txt",
                    "w1",
                    RecordOp::Upload,
                    Some(&fp(b"x")),
                    "read failed",
                    now,
                    now,
                )?;
                assert!(!applied);
                assert!(
                    get_record(conn, "/w/a.txt")?.is_none(),
                    "unshipped path must not enqueue a remote delete"
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_during_unshipped_upload_enqueues_on_success() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"x"), now)?;
                acquire_lease(conn, "/w/a.txt", "w1", now, Duration::from_secs(60))?;
                settle_delete(conn, "/w/a.txt", now)?;

                // The in-flight upload landed, so the remote holds the file
                let applied =
                    mark_uploaded(conn, "/w/a.txt", "w1", RecordOp::Upload, Some(&fp(b"x")), now)?;
                assert!(!applied);

                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.op, RecordOp::Delete);
                assert_eq!(record.status, RecordStatus::Pending);
                assert!(record.last_success_at.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn recreated_path_under_delete_lease_reverts_to_upload() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/a.txt", &fp(b"v1"), now)?;
                acquire_lease(conn, "/w/a.txt", "w1", now, Duration::from_secs(60))?;
                mark_uploaded(conn, "/w/a.txt", "w1", RecordOp::Upload, Some(&fp(b"v1")), now)?;
                settle_delete(conn, "/w/a.txt", now)?;
                acquire_lease(conn, "/w/a.txt", "w2", now, Duration::from_secs(60))?;

                // File recreated while the remote delete is in flight
                settle_upload(conn, "/w/a.txt", &fp(b"v2"), now)?;
                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.op, RecordOp::Upload);

                // The delete succeeded remotely; the new content must not
                // be tombstoned by it
                let applied = mark_uploaded(conn, "/w/a.txt", "w2", RecordOp::Delete, None, now)?;
                assert!(!applied);

                let record = get_record(conn, "/w/a.txt")?.unwrap();
                assert_eq!(record.status, RecordStatus::Pending);
                assert_eq!(record.op, RecordOp::Upload);
                assert_eq!(record.fingerprint, Some(fp(b"v2")));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn eligible_selection_respects_gate_and_order() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .with_connection(|conn| {
                settle_upload(conn, "/w/old.txt", &fp(b"a"), now - ChronoDuration::seconds(30))?;
                settle_upload(conn, "/w/new.txt", &fp(b"b"), now)?;
                // Push one behind the gate
                settle_upload(conn, "/w/later.txt", &fp(b"c"), now)?;
                conn.execute(
                    "UPDATE change_records SET next_eligible_at = ? WHERE path = '/w/later.txt'",
                    params![(now + ChronoDuration::seconds(60)).to_rfc3339()],
                )?;

                let eligible = select_eligible(conn, now, 10)?;
                let paths: Vec<&str> = eligible.iter().map(|r| r.path.as_str()).collect();
                assert_eq!(paths, vec!["/w/old.txt", "/w/new.txt"]);
                Ok(())
            })
            .unwrap();
    }
}
