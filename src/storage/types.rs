use crate::providers::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata for a stored conversation session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    /// Unique identifier for the session
    pub id: String,
    /// User-friendly title (or summary)
    pub title: String,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// When a message was last written or deleted
    pub updated_at: DateTime<Utc>,
    /// Number of messages in the session
    pub message_count: usize,
}

/// A message together with the row id the store assigned to it
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Monotonic row id; the authoritative order and the undo anchor
    pub id: i64,
    /// Owning session
    pub session_id: String,
    /// The message itself
    pub message: Message,
}

/// Unit of work for the write-behind queue
#[derive(Debug, Clone, PartialEq)]
pub struct StoreBatch {
    /// Target session
    pub session_id: String,
    /// Messages appended atomically, in order
    pub messages: Vec<Message>,
}

impl StoreBatch {
    /// Create a batch
    pub fn new(session_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            session_id: session_id.into(),
            messages,
        }
    }
}

pub(crate) fn timestamp_to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default()
}
