//! Per-path debounce/coalesce scheduler
//!
//! A burst of intents for one path becomes at most one settled intent:
//! every new intent aborts and restarts that path's timer, and only a
//! path that has been quiet for the full window settles. Timer state is
//! in-memory only; after a restart the initial scan re-observes anything
//! missed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::fingerprint::fingerprint_file;
use crate::storage::records::uploaded_fingerprint;
use crate::storage::Storage;
use crate::types::{Intent, SettledIntent};

pub struct Debouncer {
    storage: Storage,
    window: Duration,
    settled_tx: async_channel::Sender<SettledIntent>,
    timers: DashMap<PathBuf, (u64, JoinHandle<()>)>,
    generation: AtomicU64,
}

impl Debouncer {
    pub fn new(
        storage: Storage,
        window: Duration,
        settled_tx: async_channel::Sender<SettledIntent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            window,
            settled_tx,
            timers: DashMap::new(),
            generation: AtomicU64::new(0),
        })
    }

    /// Observe one intent: reset this path's quiet-window timer. Paths
    /// debounce independently; each has exactly one active timer.
    pub fn observe(self: &Arc<Self>, intent: Intent) {
        let path = intent.path().clone();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let this = self.clone();
        let task_path = path.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.window).await;
            // A timer that was replaced while (or after) its sleep ended
            // must not settle; only the current entry holder may.
            if this.claim_settle(&task_path, generation) {
                this.settle(&task_path).await;
            }
        });

        if let Some((_gen, old)) = self.timers.insert(path, (generation, handle)) {
            old.abort();
        }
    }

    /// Number of paths currently waiting out their quiet window
    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    /// Remove this timer's map entry if it is still the current one for
    /// the path. Returns false when a newer observation replaced it,
    /// which forfeits the right to settle.
    fn claim_settle(&self, path: &Path, generation: u64) -> bool {
        self.timers
            .remove_if(path, |_, entry| entry.0 == generation)
            .is_some()
    }

    /// The path went quiet: decide what, if anything, to hand the queue
    async fn settle(&self, path: &Path) {
        let settled = if path.exists() {
            match fingerprint_file(path) {
                Ok(fingerprint) => {
                    let already_uploaded = self
                        .storage
                        .with_connection(|conn| {
                            uploaded_fingerprint(conn, &path.display().to_string())
                        })
                        .unwrap_or(None);

                    if already_uploaded.as_ref() == Some(&fingerprint) {
                        // Content reverted to an already-shipped state
                        tracing::debug!(path = %path.display(), "Settled to uploaded content, no-op");
                        return;
                    }

                    SettledIntent::Upload {
                        path: path.to_path_buf(),
                        fingerprint,
                    }
                }
                Err(e) => {
                    // Component-local error: skip this item and log
                    tracing::warn!(path = %path.display(), "Fingerprint failed at settle: {}", e);
                    return;
                }
            }
        } else {
            SettledIntent::Delete {
                path: path.to_path_buf(),
            }
        };

        if self.settled_tx.send(settled).await.is_err() {
            tracing::debug!("Settled channel closed, dropping intent");
        }
    }
}
