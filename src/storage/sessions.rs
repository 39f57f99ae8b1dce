//! Conversation history keyed by session id
//!
//! Messages are append-only rows ordered by an autoincrement id. The only
//! mutation after insert is bulk deletion from an id onward, which is how a
//! turn is undone.

use super::retry::{is_busy, with_busy_retry, RetryPolicy};
use super::types::{timestamp_to_datetime, StoredMessage, StoredSession};
use super::{now_unix, Database};
use crate::config::StorageConfig;
use crate::error::{KestrelError, Result};
use crate::providers::{Message, Role, ToolCall};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

/// Durable session/message store with busy-retry on every write
#[derive(Debug, Clone)]
pub struct SessionStore {
    db: Database,
    retry: RetryPolicy,
}

impl SessionStore {
    /// Wrap an open database
    pub fn new(db: Database, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    /// Open the database described by `config`
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::Storage` if the database cannot be opened
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let db = Database::open(&config.db_path, config)?;
        Ok(Self::new(db, config.retry_policy()))
    }

    /// Underlying database handle
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Retry policy applied to writes
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn classify(&self, op: &str, session_id: &str, err: rusqlite::Error) -> anyhow::Error {
        match err {
            rusqlite::Error::QueryReturnedNoRows => {
                KestrelError::SessionNotFound(session_id.to_string()).into()
            }
            e if is_busy(&e) => KestrelError::StorageBusy {
                attempts: self.retry.max_attempts,
                message: e.to_string(),
            }
            .into(),
            e => KestrelError::Storage(format!("{}: {}", op, e)).into(),
        }
    }

    /// Create a new session with a random UUID
    pub fn create_session(&self, title: &str) -> Result<StoredSession> {
        let id = Uuid::new_v4().to_string();
        let now = now_unix();

        with_busy_retry(&self.retry, "create_session", || {
            self.db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO sessions (id, title, created, updated) VALUES (?1, ?2, ?3, ?3)",
                    params![id, title, now],
                )
            })
        })
        .map_err(|e| self.classify("Failed to create session", &id, e))?;

        tracing::info!(session_id = %id, "Created session");

        Ok(StoredSession {
            id,
            title: title.to_string(),
            created_at: timestamp_to_datetime(now),
            updated_at: timestamp_to_datetime(now),
            message_count: 0,
        })
    }

    /// Fetch one session by exact id
    pub fn get_session(&self, id: &str) -> Result<Option<StoredSession>> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT s.id, s.title, s.created, s.updated,
                            (SELECT count(*) FROM messages m WHERE m.session_id = s.id)
                     FROM sessions s WHERE s.id = ?1",
                    params![id],
                    session_from_row,
                )
                .optional()
            })
            .map_err(|e| self.classify("Failed to query session", id, e))
    }

    /// Resolve a full id or a unique prefix (e.g. the 8-char short form)
    ///
    /// # Errors
    ///
    /// `KestrelError::SessionNotFound` when nothing matches, and
    /// `KestrelError::Storage` when a prefix is ambiguous.
    pub fn resolve_session_id(&self, id_or_prefix: &str) -> Result<String> {
        let pattern = format!("{}%", id_or_prefix.replace(['%', '_'], ""));
        let matches: Vec<String> = self
            .db
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id FROM sessions WHERE id = ?1 OR id LIKE ?2 LIMIT 2")?;
                let rows = stmt.query_map(params![id_or_prefix, pattern], |row| row.get(0))?;
                rows.collect()
            })
            .map_err(|e| self.classify("Failed to resolve session", id_or_prefix, e))?;

        if let Some(exact) = matches.iter().find(|id| id.as_str() == id_or_prefix) {
            return Ok(exact.clone());
        }
        match matches.as_slice() {
            [only] => Ok(only.clone()),
            [] => Err(KestrelError::SessionNotFound(id_or_prefix.to_string()).into()),
            _ => Err(KestrelError::Storage(format!(
                "Session prefix '{}' is ambiguous",
                id_or_prefix
            ))
            .into()),
        }
    }

    /// List all sessions, most recently updated first
    pub fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.id, s.title, s.created, s.updated,
                            (SELECT count(*) FROM messages m WHERE m.session_id = s.id)
                     FROM sessions s
                     ORDER BY s.updated DESC, s.created DESC, s.rowid DESC",
                )?;
                let rows = stmt.query_map([], session_from_row)?;
                rows.collect()
            })
            .map_err(|e| self.classify("Failed to list sessions", "", e))
    }

    /// Change a session title
    pub fn rename_session(&self, id: &str, title: &str) -> Result<()> {
        let changed = with_busy_retry(&self.retry, "rename_session", || {
            self.db.with_conn(|conn| {
                conn.execute(
                    "UPDATE sessions SET title = ?1 WHERE id = ?2",
                    params![title, id],
                )
            })
        })
        .map_err(|e| self.classify("Failed to rename session", id, e))?;

        if changed == 0 {
            return Err(KestrelError::SessionNotFound(id.to_string()).into());
        }
        Ok(())
    }

    /// Delete a session and, by cascade, all of its messages
    ///
    /// Deleting an unknown session is not an error.
    pub fn delete_session(&self, id: &str) -> Result<()> {
        with_busy_retry(&self.retry, "delete_session", || {
            self.db.with_conn(|conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
                tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
                tx.commit()
            })
        })
        .map_err(|e| self.classify("Failed to delete session", id, e))?;

        tracing::info!(session_id = %id, "Deleted session");
        Ok(())
    }

    /// Store one message and return its row id immediately
    ///
    /// Used for the user message that opens a turn: the returned id becomes
    /// the turn's undo anchor.
    pub fn save_message_sync(&self, session_id: &str, message: &Message) -> Result<i64> {
        let ids = self.append(session_id, std::slice::from_ref(message))?;
        let id = ids.first().copied().ok_or_else(|| {
            KestrelError::Storage("Insert returned no row id".to_string())
        })?;
        tracing::debug!(session_id, message_id = id, "Saved message");
        Ok(id)
    }

    /// Append a batch atomically and bump the session's `updated` time
    ///
    /// Either every message is stored or none is.
    pub fn save_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let ids = self.append(session_id, messages)?;
        tracing::debug!(
            session_id,
            count = ids.len(),
            first_id = ids.first().copied().unwrap_or_default(),
            "Saved message batch"
        );
        Ok(())
    }

    fn append(&self, session_id: &str, messages: &[Message]) -> Result<Vec<i64>> {
        let encoded = messages
            .iter()
            .map(|m| serde_json::to_string(&m.tool_calls))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        with_busy_retry(&self.retry, "save_messages", || {
            self.db
                .with_conn(|conn| insert_batch(conn, session_id, messages, &encoded))
        })
        .map_err(|e| self.classify("Failed to save messages", session_id, e))
    }

    /// Load every message of a session in row-id order
    pub fn load_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, role, content, reasoning, tool_calls, tool_call_id,
                            created, input_tokens, output_tokens
                     FROM messages WHERE session_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(params![session_id], message_from_row)?;
                rows.collect()
            })
            .map_err(|e| self.classify("Failed to load messages", session_id, e))
    }

    /// Delete every message of the session with `id >= min_id`
    ///
    /// Returns the number of deleted rows. Remaining ids are untouched;
    /// deleted ids are never reused.
    pub fn delete_messages_from(&self, session_id: &str, min_id: i64) -> Result<usize> {
        let now = now_unix();
        let deleted = with_busy_retry(&self.retry, "delete_messages_from", || {
            self.db.with_conn(|conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let deleted = tx.execute(
                    "DELETE FROM messages WHERE session_id = ?1 AND id >= ?2",
                    params![session_id, min_id],
                )?;
                tx.execute(
                    "UPDATE sessions SET updated = ?1 WHERE id = ?2",
                    params![now, session_id],
                )?;
                tx.commit()?;
                Ok(deleted)
            })
        })
        .map_err(|e| self.classify("Failed to delete messages", session_id, e))?;

        tracing::info!(session_id, min_id, deleted, "Deleted messages");
        Ok(deleted)
    }
}

fn insert_batch(
    conn: &mut Connection,
    session_id: &str,
    messages: &[Message],
    tool_calls_json: &[String],
) -> rusqlite::Result<Vec<i64>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    tx.query_row(
        "SELECT 1 FROM sessions WHERE id = ?1",
        params![session_id],
        |_| Ok(()),
    )?;

    let mut ids = Vec::with_capacity(messages.len());
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO messages (session_id, role, content, reasoning, tool_calls,
                                   tool_call_id, created, input_tokens, output_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for (message, tool_calls) in messages.iter().zip(tool_calls_json) {
            stmt.execute(params![
                session_id,
                message.role.as_str(),
                message.content,
                message.reasoning,
                tool_calls,
                message.tool_call_id,
                message.created_at,
                message.input_tokens as i64,
                message.output_tokens as i64,
            ])?;
            ids.push(tx.last_insert_rowid());
        }
    }

    tx.execute(
        "UPDATE sessions SET updated = ?1 WHERE id = ?2",
        params![now_unix(), session_id],
    )?;
    tx.commit()?;
    Ok(ids)
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSession> {
    let count: i64 = row.get(4)?;
    Ok(StoredSession {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: timestamp_to_datetime(row.get(2)?),
        updated_at: timestamp_to_datetime(row.get(3)?),
        message_count: count.max(0) as usize,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(2)?;
    let role: Role = role
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    let tool_calls: String = row.get(5)?;
    let tool_calls: Vec<ToolCall> = serde_json::from_str(&tool_calls)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    let input_tokens: i64 = row.get(8)?;
    let output_tokens: i64 = row.get(9)?;

    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        message: Message {
            role,
            content: row.get(3)?,
            reasoning: row.get(4)?,
            tool_calls,
            tool_call_id: row.get(6)?,
            created_at: row.get(7)?,
            input_tokens: input_tokens.max(0) as u64,
            output_tokens: output_tokens.max(0) as u64,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::TokenUsage;
    use rusqlite::ffi;
    use serde_json::json;
    use std::time::Duration;

    fn create_test_store() -> SessionStore {
        let db = Database::open_in_memory().expect("open in-memory db");
        SessionStore::new(
            db,
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    fn message_count(store: &SessionStore) -> i64 {
        store
            .database()
            .with_conn(|conn| conn.query_row("SELECT count(*) FROM messages", [], |r| r.get(0)))
            .expect("count")
    }

    #[test]
    fn test_save_message_sync_returns_increasing_ids() {
        let store = create_test_store();
        let session = store.create_session("ids").expect("create");
        let first = store
            .save_message_sync(&session.id, &Message::user("one"))
            .expect("save 1");
        let second = store
            .save_message_sync(&session.id, &Message::user("two"))
            .expect("save 2");
        assert!(first > 0);
        assert!(second > first);
    }

    #[test]
    fn test_messages_round_trip_all_fields() {
        let store = create_test_store();
        let session = store.create_session("fields").expect("create");
        let call = ToolCall::new("call_1", "read_file", json!({"path": "src/main.rs"}));
        let assistant = Message::assistant_with_tools("reading", vec![call])
            .with_reasoning("need the file")
            .with_usage(TokenUsage::new(120, 30));
        let tool = Message::tool_result("call_1", "fn main() {}");

        store
            .save_messages(&session.id, &[assistant.clone(), tool.clone()])
            .expect("save batch");

        let loaded = store.load_messages(&session.id).expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].message, assistant);
        assert_eq!(loaded[1].message, tool);
        assert!(loaded[0].id < loaded[1].id);
        assert_eq!(loaded[0].session_id, session.id);
    }

    #[test]
    fn test_empty_tool_calls_stored_as_empty_array() {
        let store = create_test_store();
        let session = store.create_session("json").expect("create");
        store
            .save_message_sync(&session.id, &Message::user("hi"))
            .expect("save");
        let raw: String = store
            .database()
            .with_conn(|conn| conn.query_row("SELECT tool_calls FROM messages", [], |r| r.get(0)))
            .expect("raw");
        assert_eq!(raw, "[]");
    }

    #[test]
    fn test_save_messages_bumps_updated() {
        let store = create_test_store();
        let session = store.create_session("bump").expect("create");
        store
            .database()
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE sessions SET updated = 1 WHERE id = ?1",
                    params![session.id],
                )
            })
            .expect("backdate");

        store
            .save_messages(&session.id, &[Message::user("a")])
            .expect("save");

        let reloaded = store.get_session(&session.id).expect("get").expect("exists");
        assert!(reloaded.updated_at.timestamp() > 1);
        assert_eq!(reloaded.message_count, 1);
    }

    #[test]
    fn test_save_messages_failure_mid_batch_rolls_back() {
        let store = create_test_store();
        let session = store.create_session("atomic").expect("create");
        store
            .save_messages(&session.id, &[Message::user("before")])
            .expect("seed");
        store
            .database()
            .with_conn(|conn| {
                conn.execute_batch(
                    "UPDATE sessions SET updated = 7;
                     CREATE TRIGGER reject_boom BEFORE INSERT ON messages
                     WHEN NEW.content = 'boom'
                     BEGIN SELECT RAISE(ABORT, 'boom rejected'); END;",
                )
            })
            .expect("install trigger");

        let result = store.save_messages(
            &session.id,
            &[
                Message::user("first"),
                Message::assistant("second"),
                Message::assistant("boom"),
                Message::assistant("fourth"),
            ],
        );
        assert!(result.is_err());

        let loaded = store.load_messages(&session.id).expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].message.content, "before");
        let updated: i64 = store
            .database()
            .with_conn(|conn| conn.query_row("SELECT updated FROM sessions", [], |r| r.get(0)))
            .expect("updated");
        assert_eq!(updated, 7);
    }

    #[test]
    fn test_save_messages_unknown_session_is_not_found() {
        let store = create_test_store();
        let err = store
            .save_messages("missing", &[Message::user("x"), Message::user("y")])
            .expect_err("should fail");
        assert!(matches!(
            err.downcast_ref::<KestrelError>(),
            Some(KestrelError::SessionNotFound(id)) if id == "missing"
        ));
        assert_eq!(message_count(&store), 0);
    }

    #[test]
    fn test_save_messages_empty_batch_is_noop() {
        let store = create_test_store();
        assert!(store.save_messages("missing", &[]).is_ok());
    }

    #[test]
    fn test_delete_messages_from_keeps_earlier_rows() {
        let store = create_test_store();
        let session = store.create_session("undo").expect("create");
        let other = store.create_session("other").expect("create other");
        store
            .save_messages(&session.id, &[Message::user("keep")])
            .expect("seed");
        let anchor = store
            .save_message_sync(&session.id, &Message::user("undo me"))
            .expect("anchor");
        store
            .save_messages(&session.id, &[Message::assistant("reply")])
            .expect("reply");
        store
            .save_messages(&other.id, &[Message::user("untouched")])
            .expect("other");

        let deleted = store
            .delete_messages_from(&session.id, anchor)
            .expect("delete");
        assert_eq!(deleted, 2);

        let remaining = store.load_messages(&session.id).expect("load");
        assert_eq!(remaining.len(), 1);
        assert!(remaining.iter().all(|m| m.id < anchor));
        assert_eq!(store.load_messages(&other.id).expect("other").len(), 1);

        let next = store
            .save_message_sync(&session.id, &Message::user("after"))
            .expect("after");
        assert!(next > anchor, "row ids must never be reused");
    }

    #[test]
    fn test_list_sessions_ordered_by_updated() {
        let store = create_test_store();
        let a = store.create_session("A").expect("a");
        let b = store.create_session("B").expect("b");
        store
            .database()
            .with_conn(|conn| {
                conn.execute("UPDATE sessions SET updated = 100 WHERE id = ?1", params![a.id])?;
                conn.execute("UPDATE sessions SET updated = 200 WHERE id = ?1", params![b.id])
            })
            .expect("set updated");

        let sessions = store.list_sessions().expect("list");
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, b.id);
        assert_eq!(sessions[1].id, a.id);
    }

    #[test]
    fn test_resolve_session_id_by_prefix() {
        let store = create_test_store();
        let session = store.create_session("prefix").expect("create");
        let prefix = &session.id[..8];
        assert_eq!(store.resolve_session_id(prefix).expect("resolve"), session.id);
        assert_eq!(
            store.resolve_session_id(&session.id).expect("resolve full"),
            session.id
        );
        assert!(store.resolve_session_id("zzzzzzzz").is_err());
    }

    #[test]
    fn test_rename_and_delete_session() {
        let store = create_test_store();
        let session = store.create_session("old").expect("create");
        store
            .save_messages(&session.id, &[Message::user("x")])
            .expect("save");

        store.rename_session(&session.id, "new").expect("rename");
        assert_eq!(
            store.get_session(&session.id).unwrap().unwrap().title,
            "new"
        );
        assert!(store.rename_session("missing", "t").is_err());

        store.delete_session(&session.id).expect("delete");
        assert!(store.get_session(&session.id).unwrap().is_none());
        assert_eq!(message_count(&store), 0);
        store.delete_session(&session.id).expect("idempotent delete");
    }

    #[test]
    fn test_busy_error_maps_to_storage_busy() {
        let store = create_test_store();
        let err = store.classify(
            "op",
            "s",
            rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_BUSY), None),
        );
        assert!(matches!(
            err.downcast_ref::<KestrelError>(),
            Some(KestrelError::StorageBusy { attempts: 3, .. })
        ));
    }
}
