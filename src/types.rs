//! Core types for the change-detection-to-upload pipeline

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content-derived identity of a file: SHA-256 of the bytes plus the size.
///
/// Two observations with equal fingerprints are the same unit of upload
/// work; a changed fingerprint is new work, not a retry of the old.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Hex-encoded SHA-256 of the file content
    pub hash: String,
    /// File size in bytes
    pub size: u64,
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hash, self.size)
    }
}

/// Lifecycle state of a change record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    InProgress,
    Uploaded,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::InProgress => "in_progress",
            RecordStatus::Uploaded => "uploaded",
            RecordStatus::Failed => "failed",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "in_progress" => Ok(RecordStatus::InProgress),
            "uploaded" => Ok(RecordStatus::Uploaded),
            "failed" => Ok(RecordStatus::Failed),
            _ => Err(format!("unknown record status: {}", s)),
        }
    }
}

/// Kind of remote work a record represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOp {
    /// Ship the file content to the remote endpoint
    Upload,
    /// Tell the remote endpoint the file is gone
    Delete,
}

impl RecordOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOp::Upload => "upload",
            RecordOp::Delete => "delete",
        }
    }
}

impl FromStr for RecordOp {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "upload" => Ok(RecordOp::Upload),
            "delete" => Ok(RecordOp::Delete),
            _ => Err(format!("unknown record op: {}", s)),
        }
    }
}

/// One row of durable pipeline state, keyed by canonical path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: String,
    pub op: RecordOp,
    /// None when the path was deleted (tombstone / delete work item)
    pub fingerprint: Option<Fingerprint>,
    pub status: RecordStatus,
    pub attempt_count: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Backoff gate: not dispatched before this time
    pub next_eligible_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Whether the lease on this record has expired as of `now`
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expires_at {
            Some(expires) => expires <= now,
            None => true,
        }
    }
}

/// Normalized change intent, post-filter, pre-debounce
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// A create/modify/rename-target observation
    Changed { path: PathBuf, observed_at: DateTime<Utc> },
    /// A delete/rename-source observation
    Removed { path: PathBuf },
}

impl Intent {
    pub fn path(&self) -> &PathBuf {
        match self {
            Intent::Changed { path, .. } => path,
            Intent::Removed { path } => path,
        }
    }
}

/// A change that survived the debounce window and represents the
/// believed-final state of a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettledIntent {
    Upload { path: PathBuf, fingerprint: Fingerprint },
    Delete { path: PathBuf },
}

impl SettledIntent {
    pub fn path(&self) -> &PathBuf {
        match self {
            SettledIntent::Upload { path, .. } => path,
            SettledIntent::Delete { path } => path,
        }
    }
}

/// Structural outcome of one upload attempt, reported by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Network error, timeout, 408/429/5xx: eligible for backoff retry
    Transient(String),
    /// 4xx other than rate-limit: retrying an unchanged request cannot succeed
    Permanent(String),
    /// Content changed between lease and upload: immediate re-pend,
    /// does not count as an attempt
    Stale,
}

/// Include/exclude filters applied by the event normalizer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchFilter {
    /// Lowercase extensions to include; empty means include all
    pub include_extensions: Vec<String>,
    /// Path prefixes to exclude (e.g. temp or build directories)
    pub exclude_prefixes: Vec<PathBuf>,
    /// Maximum file size in bytes; 0 means unlimited
    pub max_file_size: u64,
}

/// Tuning knobs for the pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Quiet window a path must hold before its change settles
    pub debounce_window: Duration,
    /// Number of concurrent upload workers
    pub concurrency: usize,
    /// First retry delay; doubles each attempt
    pub backoff_base: Duration,
    /// Ceiling on the computed backoff
    pub backoff_max: Duration,
    /// Uniform jitter added to backoff, as a fraction of it (0 disables)
    pub backoff_jitter: f64,
    /// Consecutive transient failures before a record goes terminal
    pub max_attempts: i64,
    /// How long a worker may hold a record before the sweep presumes it dead
    pub lease_duration: Duration,
    /// Period of the reconciliation sweep
    pub sweep_interval: Duration,
    /// Per-call timeout on the HTTP transport
    pub upload_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(2),
            concurrency: 4,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            backoff_jitter: 0.2,
            max_attempts: 5,
            lease_duration: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-status record counts for the operator surface
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub uploaded: i64,
    pub failed: i64,
}
