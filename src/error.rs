//! Error types for Kestrel
//!
//! This module defines the error taxonomy used throughout the engine,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for Kestrel operations
///
/// Storage contention, turn failures, undo problems and configuration
/// mistakes are all expressed through this enum. Public APIs return
/// [`Result`], so variants are usually wrapped into `anyhow::Error` with
/// `.into()` and can be recovered with `downcast_ref`.
#[derive(Error, Debug)]
pub enum KestrelError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider-related errors (API calls, authentication, etc.)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Tool execution errors
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Conversation storage errors (database operations)
    #[error("Storage error: {0}")]
    Storage(String),

    /// The database stayed locked for every retry attempt
    #[error("Storage busy after {attempts} attempts: {message}")]
    StorageBusy {
        /// Number of attempts made before giving up
        attempts: u32,
        /// Underlying database error text
        message: String,
    },

    /// A session id did not resolve to a stored session
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A user submission or undo was refused by the turn gate
    #[error("Turn rejected: {0}")]
    TurnRejected(String),

    /// File snapshot or restore failures
    #[error("Delta tracking error: {0}")]
    Delta(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Raw SQLite errors that were not classified further
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type alias for Kestrel operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
