use async_trait::async_trait;
use kestrel::agent::{TurnCallbacks, TurnProcessor};
use kestrel::config::StorageConfig;
use kestrel::error::Result;
use kestrel::providers::{Message, StreamDelta, TokenUsage};
use kestrel::storage::{Database, RetryPolicy, SessionStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[allow(dead_code)]
pub fn storage_config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        db_path: dir.path().join("kestrel.db"),
        busy_timeout_ms: 0,
        retry_attempts: 5,
        retry_step_ms: 5,
        retry_cap_ms: 20,
        ..StorageConfig::default()
    }
}

#[allow(dead_code)]
pub fn create_temp_store() -> (SessionStore, TempDir) {
    let tmp = TempDir::new().expect("failed to create tempdir");
    let store = SessionStore::open(&storage_config(&tmp)).expect("failed to open store");
    (store, tmp)
}

#[allow(dead_code)]
pub fn open_second_handle(store: &SessionStore, policy: RetryPolicy) -> SessionStore {
    let path = store.database().path().expect("file-backed store").to_path_buf();
    let config = StorageConfig {
        db_path: path.clone(),
        busy_timeout_ms: 0,
        ..StorageConfig::default()
    };
    let db = Database::open(path, &config).expect("failed to open second handle");
    SessionStore::new(db, policy)
}

/// Replies with a fixed text, streamed in pieces
#[allow(dead_code)]
pub struct EchoProcessor;

#[async_trait]
impl TurnProcessor for EchoProcessor {
    async fn process_turn(
        &self,
        _cancel: CancellationToken,
        history: Vec<Message>,
        callbacks: TurnCallbacks,
    ) -> Result<()> {
        let last = history.last().map(|m| m.content.clone()).unwrap_or_default();
        for word in last.split_whitespace() {
            callbacks.on_delta(StreamDelta::content(format!("{} ", word))).await;
        }
        callbacks.on_usage(TokenUsage::new(50, 5)).await;
        callbacks
            .on_message(Message::assistant(format!("ack: {}", last)))
            .await;
        Ok(())
    }
}

/// Edits files under `root` the way a tool would, then replies
#[allow(dead_code)]
pub struct FileEditingProcessor {
    pub root: PathBuf,
}

#[async_trait]
impl TurnProcessor for FileEditingProcessor {
    async fn process_turn(
        &self,
        _cancel: CancellationToken,
        history: Vec<Message>,
        callbacks: TurnCallbacks,
    ) -> Result<()> {
        let turn = history.iter().filter(|m| m.content.starts_with("turn")).count();
        std::fs::write(self.root.join("shared.txt"), format!("edited by turn {}", turn))?;
        std::fs::write(self.root.join(format!("created_{}.txt", turn)), "new file")?;
        callbacks.on_usage(TokenUsage::new(200, 20)).await;
        callbacks
            .on_message(Message::assistant(format!("edited for turn {}", turn)))
            .await;
        Ok(())
    }
}

/// Blocks until released or cancelled
#[allow(dead_code)]
pub struct GatedProcessor {
    pub release: Arc<Notify>,
}

#[async_trait]
impl TurnProcessor for GatedProcessor {
    async fn process_turn(
        &self,
        cancel: CancellationToken,
        _history: Vec<Message>,
        callbacks: TurnCallbacks,
    ) -> Result<()> {
        callbacks.on_delta(StreamDelta::content("thinking")).await;
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = self.release.notified() => {}
        }
        callbacks.on_message(Message::assistant("released")).await;
        Ok(())
    }
}

#[allow(dead_code)]
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
