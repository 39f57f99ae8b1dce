//! Busy-retry for writes against a contended database
//!
//! SQLite reports `SQLITE_BUSY`/`SQLITE_LOCKED` when another writer holds
//! the lock longer than the connection's busy timeout. Those failures are
//! retried with linearly increasing, capped backoff; anything else is
//! returned immediately.

use rusqlite::ErrorCode;
use std::time::Duration;

/// Bounded linear backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay added per failed attempt
    pub step: Duration,
    /// Upper bound for a single delay
    pub cap: Duration,
}

impl RetryPolicy {
    /// Create a policy; `max_attempts` is clamped to at least one
    pub fn new(max_attempts: u32, step: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            step,
            cap,
        }
    }

    /// Delay after the `attempt`-th failure (1-based): `min(step * attempt, cap)`
    pub fn delay(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(50), Duration::from_millis(500))
    }
}

/// Whether an error means another writer holds the database lock
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Run `op`, retrying while it fails with a busy/locked error
///
/// Blocks the calling thread while sleeping, so call it from a blocking
/// context (`spawn_blocking` or a dedicated worker).
///
/// # Errors
///
/// Returns the last underlying error once `policy.max_attempts` attempts
/// have all been busy, or the first non-busy error.
pub fn with_busy_retry<T>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: impl FnMut() -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if is_busy(&e) && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                tracing::debug!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Database busy, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                if is_busy(&e) {
                    tracing::warn!(op = op_name, attempts = attempt, "Database busy, giving up");
                }
                return Err(e);
            }
            Ok(value) => return Ok(value),
        }
    }
}
