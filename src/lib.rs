//! Filerelay - reliable file-change-to-upload pipeline
//!
//! Watches a filesystem tree, coalesces noisy change notifications into a
//! durable SQLite-backed work queue, and drives each changed file to a
//! remote HTTP endpoint with bounded concurrency, retry/backoff, and
//! crash recovery.

pub mod error;
pub mod fingerprint;
pub mod queue;
pub mod storage;
pub mod transport;
pub mod types;
pub mod watch;

pub use error::{RelayError, Result};
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
