//! Durable storage for conversations and the web result cache
//!
//! Both logical stores share one embedded SQLite engine. Every handle holds
//! a single connection behind a coarse mutex so statements on one handle
//! never interleave; cross-handle and cross-process contention is absorbed by
//! SQLite's busy timeout plus [`with_busy_retry`].

use crate::config::StorageConfig;
use crate::error::{KestrelError, Result};
use anyhow::Context;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub mod cache;
pub mod retry;
pub mod sessions;
pub mod types;
pub mod write_behind;

pub use cache::{CacheHandle, CacheStore, CachedContent};
pub use retry::{is_busy, with_busy_retry, RetryPolicy};
pub use sessions::SessionStore;
pub use types::{StoreBatch, StoredMessage, StoredSession};
pub use write_behind::{BatchWriter, WriteBehindQueue};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    created INTEGER NOT NULL,
    updated INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    reasoning TEXT NOT NULL DEFAULT '',
    tool_calls TEXT NOT NULL DEFAULT '[]',
    tool_call_id TEXT,
    created INTEGER NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_messages_session_id ON messages(session_id, id);
CREATE TABLE IF NOT EXISTS fetch_cache (
    url TEXT PRIMARY KEY,
    result TEXT NOT NULL,
    created INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS search_cache (
    query TEXT PRIMARY KEY,
    result TEXT NOT NULL,
    created INTEGER NOT NULL
);
";

/// Current time as Unix seconds
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Shared handle to one SQLite connection
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open (or create) the database file and apply engine tuning
    ///
    /// Creates the parent directory when needed, switches the journal to
    /// WAL, relaxes `synchronous` to NORMAL, enables foreign keys, sets the
    /// busy timeout and creates any missing tables.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::Storage` if the file cannot be opened or the
    /// schema cannot be created.
    ///
    /// # Examples
    ///
    /// ```
    /// use kestrel::config::StorageConfig;
    /// use kestrel::storage::Database;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let db = Database::open(dir.path().join("k.db"), &StorageConfig::default()).unwrap();
    /// assert!(db.path().is_some());
    /// ```
    pub fn open(path: impl Into<PathBuf>, config: &StorageConfig) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create parent directory for database")
                    .map_err(|e| KestrelError::Storage(format!("{:#}", e)))?;
            }
        }

        let conn = Connection::open(&path)
            .map_err(|e| KestrelError::Storage(format!("Failed to open database: {}", e)))?;
        Self::configure(&conn, config.busy_timeout())?;

        tracing::debug!(path = %path.display(), "Opened database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open a private in-memory database (tests and throwaway sessions)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| KestrelError::Storage(format!("Failed to open database: {}", e)))?;
        Self::configure(&conn, Duration::from_millis(0))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|e| KestrelError::Storage(format!("Failed to set journal mode: {}", e)))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            tracing::debug!(journal_mode = %journal_mode, "WAL journal not available");
        }

        conn.pragma_update(None, "synchronous", "NORMAL")
            .and_then(|_| conn.pragma_update(None, "foreign_keys", "ON"))
            .and_then(|_| conn.busy_timeout(busy_timeout))
            .map_err(|e| KestrelError::Storage(format!("Failed to tune database: {}", e)))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| KestrelError::Storage(format!("Failed to create tables: {}", e)))?;

        Ok(())
    }

    /// Path of the database file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with exclusive access to the connection
    ///
    /// A poisoned lock is recovered: the connection holds no Rust-side
    /// invariants a panic could break, and SQLite rolls back open
    /// transactions on its own.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}
