//! Filesystem watching: raw notify events in, settled intents out
//!
//! The notify backend may redeliver or reorder; everything downstream of
//! the normalizer tolerates both.

pub mod debounce;
pub mod normalizer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::types::Intent;
use debounce::Debouncer;
use normalizer::Normalizer;

pub struct FileWatcher {
    // Dropping the watcher stops event delivery
    _watcher: RecommendedWatcher,
    listener: JoinHandle<()>,
}

impl FileWatcher {
    /// Start watching the given roots recursively. One dedicated listener
    /// task consumes raw events, normalizes them, and feeds the per-path
    /// debounce timers.
    pub fn start(
        roots: &[PathBuf],
        normalizer: Normalizer,
        debouncer: Arc<Debouncer>,
    ) -> Result<Self> {
        let (raw_tx, raw_rx) = async_channel::bounded::<notify::Result<notify::Event>>(1024);

        let mut watcher = RecommendedWatcher::new(
            move |result| {
                if raw_tx.send_blocking(result).is_err() {
                    tracing::debug!("Raw event channel closed");
                }
            },
            notify::Config::default(),
        )?;

        for root in roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            tracing::info!(root = %root.display(), "Watching recursively");
        }

        let listener = tokio::spawn(async move {
            while let Ok(result) = raw_rx.recv().await {
                match result {
                    Ok(event) => {
                        for intent in normalizer.normalize(&event) {
                            debouncer.observe(intent);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Watch backend error: {}", e);
                    }
                }
            }
            tracing::debug!("Event listener stopped");
        });

        Ok(Self {
            _watcher: watcher,
            listener,
        })
    }

    pub fn stop(self) {
        drop(self._watcher);
        self.listener.abort();
    }
}

/// Walk the watch roots and feed every filter-passing file through the
/// debounce path, so files that changed while the process was down are
/// picked up without a filesystem event.
pub fn scan_existing(
    roots: &[PathBuf],
    normalizer: &Normalizer,
    debouncer: &Arc<Debouncer>,
) -> Result<usize> {
    let mut observed = 0;
    for root in roots {
        observed += scan_dir(root, normalizer, debouncer)?;
    }
    tracing::info!(files = observed, "Initial scan complete");
    Ok(observed)
}

fn scan_dir(dir: &Path, normalizer: &Normalizer, debouncer: &Arc<Debouncer>) -> Result<usize> {
    let mut observed = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), "Scan skipping unreadable directory: {}", e);
            return Ok(0);
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Scan skipping entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            observed += scan_dir(&path, normalizer, debouncer)?;
        } else {
            let canonical = normalizer::canonicalize_lenient(&path);
            if normalizer.passes_filter(&canonical) {
                debouncer.observe(Intent::Changed {
                    path: canonical,
                    observed_at: Utc::now(),
                });
                observed += 1;
            }
        }
    }

    Ok(observed)
}
