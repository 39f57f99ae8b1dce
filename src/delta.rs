//! File deltas recorded per turn, for undo
//!
//! A turn is tagged with the durable id of its user message. While the turn
//! runs, the directory is snapshotted before and after; the difference is
//! stored as before-images (or "did not exist") so the turn's filesystem
//! effects can be reversed later.

use crate::error::{KestrelError, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

/// Files larger than this are hashed but their contents are not kept
pub const MAX_SNAPSHOT_FILE_BYTES: u64 = 4 * 1024 * 1024;

const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules", ".kestrel"];

/// State of one file at snapshot time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    /// SHA-256 of the contents
    pub digest: [u8; 32],
    /// Contents, absent when the file exceeded [`MAX_SNAPSHOT_FILE_BYTES`]
    pub contents: Option<Vec<u8>>,
}

/// Point-in-time view of every regular file under a root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: BTreeMap<PathBuf, FileState>,
}

impl Snapshot {
    /// State of `path`, if it existed
    pub fn get(&self, path: &Path) -> Option<&FileState> {
        self.files.get(path)
    }

    /// Number of files captured
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether no files were captured
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Result of reversing one turn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Files put back to their pre-turn state (rewritten or removed)
    pub restored: Vec<PathBuf>,
    /// Files that could not be restored, with the reason
    pub failed: Vec<(PathBuf, String)>,
}

impl RestoreReport {
    /// Whether every recorded file was restored
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Filesystem snapshot/restore collaborator used by undo
pub trait DeltaTracker: Send + Sync {
    /// Tag subsequent [`record_deltas`](Self::record_deltas) calls with a turn
    fn begin_turn(&self, session_id: &str, message_id: i64);

    /// Capture every file under `root`
    fn snapshot_dir(&self, root: &Path) -> Result<Snapshot>;

    /// Record the difference between two snapshots against the current turn
    fn record_deltas(&self, root: &Path, before: &Snapshot, after: &Snapshot) -> Result<()>;

    /// Reverse a turn's recorded changes
    fn undo(&self, session_id: &str, message_id: i64) -> Result<RestoreReport>;

    /// Forget a turn's recorded changes
    fn delete_turn(&self, session_id: &str, message_id: i64);
}

type TurnKey = (String, i64);

#[derive(Debug, Clone)]
struct Change {
    before: Option<FileState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    current: Option<TurnKey>,
    turns: HashMap<TurnKey, BTreeMap<PathBuf, Change>>,
}

/// In-memory [`DeltaTracker`] built on content snapshots
#[derive(Debug, Default)]
pub struct SnapshotDeltaTracker {
    state: Mutex<TrackerState>,
}

impl SnapshotDeltaTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Files recorded as changed by a turn
    pub fn changed_files(&self, session_id: &str, message_id: i64) -> Vec<PathBuf> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .turns
            .get(&(session_id.to_string(), message_id))
            .map(|changes| changes.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl DeltaTracker for SnapshotDeltaTracker {
    fn begin_turn(&self, session_id: &str, message_id: i64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let key = (session_id.to_string(), message_id);
        state.turns.entry(key.clone()).or_default();
        state.current = Some(key);
        tracing::debug!(session_id, message_id, "Began delta tracking");
    }

    fn snapshot_dir(&self, root: &Path) -> Result<Snapshot> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(root).follow_links(false).into_iter();
        for entry in walker.filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.depth() > 0
                && e.file_name()
                    .to_str()
                    .is_some_and(|name| SKIPPED_DIRS.contains(&name)))
        }) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path().to_path_buf();
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable file");
                    continue;
                }
            };
            let digest: [u8; 32] = Sha256::digest(&bytes).into();
            let contents = (size <= MAX_SNAPSHOT_FILE_BYTES).then_some(bytes);
            files.insert(path, FileState { digest, contents });
        }

        tracing::trace!(root = %root.display(), files = files.len(), "Snapshot taken");
        Ok(Snapshot { files })
    }

    fn record_deltas(&self, root: &Path, before: &Snapshot, after: &Snapshot) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(key) = state.current.clone() else {
            return Err(KestrelError::Delta("No turn has begun".to_string()).into());
        };
        let changes = state.turns.entry(key).or_default();

        let mut recorded = 0usize;
        for (path, after_state) in &after.files {
            let before_state = before.files.get(path);
            if before_state.map(|b| b.digest) != Some(after_state.digest) {
                // the earliest before-image of a path wins
                changes.entry(path.clone()).or_insert_with(|| Change {
                    before: before_state.cloned(),
                });
                recorded += 1;
            }
        }
        for (path, before_state) in &before.files {
            if !after.files.contains_key(path) {
                changes.entry(path.clone()).or_insert_with(|| Change {
                    before: Some(before_state.clone()),
                });
                recorded += 1;
            }
        }

        tracing::debug!(root = %root.display(), recorded, "Recorded file deltas");
        Ok(())
    }

    fn undo(&self, session_id: &str, message_id: i64) -> Result<RestoreReport> {
        let changes = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .turns
                .get(&(session_id.to_string(), message_id))
                .cloned()
                .unwrap_or_default()
        };

        let mut report = RestoreReport::default();
        for (path, change) in changes {
            match restore_file(&path, change.before.as_ref()) {
                Ok(()) => report.restored.push(path),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to restore file");
                    report.failed.push((path, e.to_string()));
                }
            }
        }

        tracing::info!(
            session_id,
            message_id,
            restored = report.restored.len(),
            failed = report.failed.len(),
            "Undid file deltas"
        );
        Ok(report)
    }

    fn delete_turn(&self, session_id: &str, message_id: i64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let key = (session_id.to_string(), message_id);
        state.turns.remove(&key);
        if state.current.as_ref() == Some(&key) {
            state.current = None;
        }
    }
}

fn restore_file(path: &Path, before: Option<&FileState>) -> Result<()> {
    match before {
        None => match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        },
        Some(FileState {
            contents: Some(contents),
            ..
        }) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, contents)?;
            Ok(())
        }
        Some(FileState { contents: None, .. }) => Err(KestrelError::Delta(format!(
            "No stored contents for {} (larger than {} bytes)",
            path.display(),
            MAX_SNAPSHOT_FILE_BYTES
        ))
        .into()),
    }
}
