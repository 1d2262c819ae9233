//! Event normalization and filtering
//!
//! Turns raw `notify` events into change/removal intents: canonical
//! absolute paths, include/exclude filters applied, event kinds resolved
//! exhaustively. Duplicate notifications pass through unchanged; the
//! debouncer owns dedup.

use std::path::{Path, PathBuf};

use chrono::Utc;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};

use crate::types::{Intent, WatchFilter};

pub struct Normalizer {
    filter: WatchFilter,
}

impl Normalizer {
    pub fn new(filter: WatchFilter) -> Self {
        Self { filter }
    }

    /// Whether a path passes the configured include/exclude filters.
    /// The size ceiling is only checked when the file is statable; a
    /// missing file passes (the debouncer resolves its fate at settle
    /// time).
    pub fn passes_filter(&self, path: &Path) -> bool {
        if !self.filter.include_extensions.is_empty() {
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !self.filter.include_extensions.contains(&ext) {
                return false;
            }
        }

        for prefix in &self.filter.exclude_prefixes {
            if path.starts_with(prefix) {
                return false;
            }
        }

        if self.filter.max_file_size > 0 {
            if let Ok(meta) = std::fs::metadata(path) {
                if meta.len() > self.filter.max_file_size {
                    return false;
                }
            }
        }

        true
    }

    /// Normalize one raw notification into zero or more intents
    pub fn normalize(&self, event: &Event) -> Vec<Intent> {
        let mut intents = Vec::new();

        match &event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.push_changed(&mut intents, path);
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => {
                    for path in &event.paths {
                        self.push_removed(&mut intents, path);
                    }
                }
                RenameMode::To => {
                    for path in &event.paths {
                        self.push_changed(&mut intents, path);
                    }
                }
                RenameMode::Both => {
                    // paths[0] is the rename source, paths[1] the target
                    if let Some(source) = event.paths.first() {
                        self.push_removed(&mut intents, source);
                    }
                    if let Some(target) = event.paths.get(1) {
                        self.push_changed(&mut intents, target);
                    }
                }
                RenameMode::Any | RenameMode::Other => {
                    for path in &event.paths {
                        self.push_by_existence(&mut intents, path);
                    }
                }
            },
            EventKind::Modify(_) => {
                for path in &event.paths {
                    self.push_changed(&mut intents, path);
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.push_removed(&mut intents, path);
                }
            }
            // Reads are not changes
            EventKind::Access(_) => {}
            // Backend could not say; the path's existence decides
            EventKind::Any | EventKind::Other => {
                for path in &event.paths {
                    self.push_by_existence(&mut intents, path);
                }
            }
        }

        intents
    }

    fn push_changed(&self, intents: &mut Vec<Intent>, path: &Path) {
        let canonical = canonicalize_lenient(path);
        if canonical.is_dir() {
            return;
        }
        if !self.passes_filter(&canonical) {
            tracing::trace!(path = %canonical.display(), "Filtered out");
            return;
        }
        intents.push(Intent::Changed {
            path: canonical,
            observed_at: Utc::now(),
        });
    }

    fn push_removed(&self, intents: &mut Vec<Intent>, path: &Path) {
        let canonical = canonicalize_lenient(path);
        if !self.passes_filter(&canonical) {
            return;
        }
        intents.push(Intent::Removed { path: canonical });
    }

    fn push_by_existence(&self, intents: &mut Vec<Intent>, path: &Path) {
        if path.exists() {
            self.push_changed(intents, path);
        } else {
            self.push_removed(intents, path);
        }
    }
}

/// Resolve a path to canonical absolute form. Deleted paths cannot be
/// canonicalized directly, so fall back to resolving the parent and
/// re-attaching the file name.
pub fn canonicalize_lenient(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}
