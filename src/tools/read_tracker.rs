//! Tracks which files the model has observed during the session
//!
//! Edit tools consult this to refuse blind writes. Undo resets it so the
//! model must re-read restored files before touching them again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Shared set of files read by tools
#[derive(Debug, Clone, Default)]
pub struct ReadTracker {
    inner: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ReadTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `path` was read
    pub fn mark_read(&self, path: impl Into<PathBuf>) {
        let mut set = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        set.insert(path.into());
    }

    /// Whether `path` was read since the last reset
    pub fn has_read(&self, path: &Path) -> bool {
        let set = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        set.contains(path)
    }

    /// Number of tracked files
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything
    pub fn reset(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
