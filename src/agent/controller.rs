//! Turn lifecycle and undo
//!
//! [`TurnController`] is the single owner of conversation state: history,
//! display entries, token counters and the undo stack. Background work
//! (the user-message store write, the turn worker, undo) never touches that
//! state; it reports back through the controller's inbox or the turn's event
//! queue, and [`TurnController::next_update`] applies the result.
//!
//! Per turn the phases are `Idle -> PendingStore -> Streaming -> Idle`.
//! Undo runs `Idle -> Undoing -> Idle`. Only one non-idle phase exists at a
//! time, which is what gates new submissions and undo.

use super::engine::{spawn_turn, TurnHandle};
use super::events::{TurnEvent, TurnOutcome};
use super::processor::{DeltaRecordingProcessor, TurnProcessor};
use crate::config::TurnConfig;
use crate::delta::{DeltaTracker, RestoreReport};
use crate::error::{KestrelError, Result};
use crate::providers::{unanswered_tool_calls, DeltaKind, Message, Role, StreamDelta, TokenUsage};
use crate::storage::{SessionStore, StoreBatch, WriteBehindQueue};
use crate::tools::ReadTracker;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Content of the tool result written for a call a stopped turn never ran
pub const INTERRUPTED_TOOL_RESULT: &str = "Tool call was interrupted before it completed";

/// Content of the assistant message closing a stopped turn
pub const INTERRUPTED_MESSAGE: &str = "[interrupted]";

/// Re-indexes files after undo restored them
pub trait FileIndexer: Send + Sync {
    /// Refresh index entries for exactly these paths
    fn reindex(&self, paths: &[PathBuf]);
}

/// Indexer that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndexer;

impl FileIndexer for NoopIndexer {
    fn reindex(&self, _paths: &[PathBuf]) {}
}

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// Nothing in flight
    Idle,
    /// The user message is being written to the store
    PendingStore,
    /// A turn worker is running
    Streaming,
    /// An undo is in flight
    Undoing,
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnPhase::Idle => "idle",
            TurnPhase::PendingStore => "saving the previous message",
            TurnPhase::Streaming => "streaming",
            TurnPhase::Undoing => "undoing",
        };
        f.write_str(s)
    }
}

/// Undo anchor for one submitted turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnBoundary {
    /// Length of the display list before the turn's user entry
    pub display_index: usize,
    /// Length of the history before the turn's user message
    pub history_len: usize,
    /// Store row id of the user message; 0 until the write completes
    pub message_id: i64,
    /// Session input tokens when the turn was submitted
    pub input_tokens_at_start: u64,
    /// Session output tokens when the turn was submitted
    pub output_tokens_at_start: u64,
}

/// One rendered conversation entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayEntry {
    /// A user submission
    User(String),
    /// An assistant reply
    Assistant {
        /// Reply text
        content: String,
        /// Reasoning text, possibly empty
        reasoning: String,
        /// Number of tool calls requested
        tool_calls: usize,
    },
    /// A tool result
    ToolResult {
        /// Call this result answers
        tool_call_id: String,
        /// Result text
        output: String,
    },
    /// A turn failure shown inline
    Error(String),
    /// Informational line (e.g. undo linkage lost)
    Notice(String),
}

impl DisplayEntry {
    fn from_message(message: &Message) -> Self {
        match message.role {
            Role::User | Role::System => DisplayEntry::User(message.content.clone()),
            Role::Assistant => DisplayEntry::Assistant {
                content: message.content.clone(),
                reasoning: message.reasoning.clone(),
                tool_calls: message.tool_calls.len(),
            },
            Role::Tool => DisplayEntry::ToolResult {
                tool_call_id: message.tool_call_id.clone().unwrap_or_default(),
                output: message.content.clone(),
            },
        }
    }
}

/// Text streamed for the reply currently being generated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingText {
    /// Content deltas in arrival order
    pub content: String,
    /// Reasoning deltas in arrival order
    pub reasoning: String,
}

impl StreamingText {
    fn push(&mut self, delta: StreamDelta) {
        match delta.kind {
            DeltaKind::Content => self.content.push_str(&delta.text),
            DeltaKind::Reasoning => self.reasoning.push_str(&delta.text),
        }
    }

    fn clear(&mut self) {
        self.content.clear();
        self.reasoning.clear();
    }
}

/// Result of a finished undo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoSummary {
    /// Durable id the turn was anchored at
    pub message_id: i64,
    /// Files put back to their pre-turn state
    pub restored_files: Vec<PathBuf>,
    /// Filesystem restore problem, if any
    pub file_error: Option<String>,
    /// Messages deleted from the store
    pub deleted_messages: usize,
    /// Store deletion problem, if any
    pub store_error: Option<String>,
}

/// What [`TurnController::next_update`] applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The user message was stored (or failed to store) and the turn began
    TurnStarted {
        /// Undo anchor, `None` when the store write failed
        message_id: Option<i64>,
    },
    /// A batch of turn events was applied
    Progress,
    /// The turn reached a terminal state
    TurnFinished(TurnOutcome),
    /// An undo completed
    UndoFinished(UndoSummary),
}

#[derive(Debug)]
struct UndoJob {
    boundary: TurnBoundary,
    files: std::result::Result<RestoreReport, String>,
    deleted: std::result::Result<usize, String>,
}

#[derive(Debug)]
enum ControllerMsg {
    UserStored(std::result::Result<i64, String>),
    UndoFinished(UndoJob),
}

enum Next {
    Msg(ControllerMsg),
    Events(Vec<TurnEvent>),
}

/// Owner of one session's in-memory conversation
pub struct TurnController {
    session_id: String,
    store: SessionStore,
    write_queue: Arc<WriteBehindQueue>,
    processor: Arc<dyn TurnProcessor>,
    delta: Option<(Arc<dyn DeltaTracker>, PathBuf)>,
    indexer: Arc<dyn FileIndexer>,
    read_tracker: ReadTracker,
    config: TurnConfig,

    phase: TurnPhase,
    history: Vec<Message>,
    display: Vec<DisplayEntry>,
    boundaries: Vec<TurnBoundary>,
    pending: Option<TurnBoundary>,
    turn_history_start: usize,
    unsaved_user: Option<Message>,
    unattributed_usage: TokenUsage,
    cancel_requested: bool,
    input_tokens: u64,
    output_tokens: u64,
    streaming: StreamingText,
    turn: Option<TurnHandle>,
    inbox_tx: mpsc::UnboundedSender<ControllerMsg>,
    inbox_rx: mpsc::UnboundedReceiver<ControllerMsg>,
}

impl fmt::Debug for TurnController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnController")
            .field("session_id", &self.session_id)
            .field("phase", &self.phase)
            .field("history", &self.history.len())
            .field("boundaries", &self.boundaries.len())
            .finish()
    }
}

impl TurnController {
    /// Create a controller for an existing session with empty history
    ///
    /// # Arguments
    ///
    /// * `session_id` - Session messages are written to
    /// * `store` - Synchronous path for user messages and undo deletion
    /// * `write_queue` - Write-behind path for everything else
    /// * `processor` - Work performed by each turn
    /// * `config` - Queue capacity and display retention
    pub fn new(
        session_id: impl Into<String>,
        store: SessionStore,
        write_queue: Arc<WriteBehindQueue>,
        processor: Arc<dyn TurnProcessor>,
        config: TurnConfig,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            session_id: session_id.into(),
            store,
            write_queue,
            processor,
            delta: None,
            indexer: Arc::new(NoopIndexer),
            read_tracker: ReadTracker::new(),
            config,
            phase: TurnPhase::Idle,
            history: Vec::new(),
            display: Vec::new(),
            boundaries: Vec::new(),
            pending: None,
            turn_history_start: 0,
            unsaved_user: None,
            unattributed_usage: TokenUsage::default(),
            cancel_requested: false,
            input_tokens: 0,
            output_tokens: 0,
            streaming: StreamingText::default(),
            turn: None,
            inbox_tx,
            inbox_rx,
        }
    }

    /// Record file changes under `root` for every linked turn
    pub fn with_delta_tracker(mut self, tracker: Arc<dyn DeltaTracker>, root: PathBuf) -> Self {
        self.delta = Some((tracker, root));
        self
    }

    /// Re-index restored files after undo
    pub fn with_indexer(mut self, indexer: Arc<dyn FileIndexer>) -> Self {
        self.indexer = indexer;
        self
    }

    /// Share a read tracker with the tools; undo resets it
    pub fn with_read_tracker(mut self, tracker: ReadTracker) -> Self {
        self.read_tracker = tracker;
        self
    }

    /// Current session id
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Whether nothing is in flight
    pub fn is_idle(&self) -> bool {
        self.phase == TurnPhase::Idle
    }

    /// History sent to the model
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Entries currently on screen
    pub fn display(&self) -> &[DisplayEntry] {
        &self.display
    }

    /// Undo stack, oldest first
    pub fn boundaries(&self) -> &[TurnBoundary] {
        &self.boundaries
    }

    /// Session-wide token totals
    pub fn token_usage(&self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens)
    }

    /// Partial reply of the running turn
    pub fn streaming_text(&self) -> &StreamingText {
        &self.streaming
    }

    /// Read tracker shared with the tools
    pub fn read_tracker(&self) -> &ReadTracker {
        &self.read_tracker
    }

    /// Submit a user message and start a turn
    ///
    /// The message is shown and added to history immediately; the store
    /// write runs in the background and the turn launches once it returns.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::TurnRejected` if a store write, turn or undo
    /// is already in flight, or the message is blank
    pub fn submit(&mut self, text: impl Into<String>) -> Result<()> {
        if self.phase != TurnPhase::Idle {
            return Err(KestrelError::TurnRejected(format!("busy: {}", self.phase)).into());
        }
        let text = text.into();
        if text.trim().is_empty() {
            return Err(KestrelError::TurnRejected("message is empty".to_string()).into());
        }

        let message = Message::user(text.clone());
        self.pending = Some(TurnBoundary {
            display_index: self.display.len(),
            history_len: self.history.len(),
            message_id: 0,
            input_tokens_at_start: self.input_tokens,
            output_tokens_at_start: self.output_tokens,
        });
        self.turn_history_start = self.history.len();
        self.display.push(DisplayEntry::User(text));
        self.history.push(message.clone());
        self.unsaved_user = None;
        self.unattributed_usage = TokenUsage::default();
        self.cancel_requested = false;
        self.phase = TurnPhase::PendingStore;

        let store = self.store.clone();
        let queue = Arc::clone(&self.write_queue);
        let session_id = self.session_id.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            // earlier turns' queued rows must get lower ids than this anchor
            queue.flush().await;
            let saved = tokio::task::spawn_blocking(move || {
                store.save_message_sync(&session_id, &message)
            })
            .await;
            let result = match saved {
                Ok(Ok(id)) => Ok(id),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(e) => Err(format!("store task failed: {}", e)),
            };
            let _ = inbox.send(ControllerMsg::UserStored(result));
        });

        tracing::info!(session_id = %self.session_id, "Submitted user message");
        Ok(())
    }

    /// Request cancellation of the pending or running turn
    ///
    /// Returns `false` when there is nothing to cancel.
    pub fn cancel(&mut self) -> bool {
        match self.phase {
            TurnPhase::Streaming => {
                if let Some(turn) = &self.turn {
                    turn.cancel();
                }
                self.streaming.clear();
                tracing::info!("Cancelling turn");
                true
            }
            TurnPhase::PendingStore => {
                self.cancel_requested = true;
                tracing::info!("Cancelling turn before launch");
                true
            }
            TurnPhase::Idle | TurnPhase::Undoing => false,
        }
    }

    /// Start undoing the most recent undoable turn
    ///
    /// Returns `false` (and changes nothing) when there is no boundary or
    /// anything else is in flight. Completion arrives as
    /// [`ControllerEvent::UndoFinished`].
    pub fn undo(&mut self) -> bool {
        if self.phase != TurnPhase::Idle {
            tracing::debug!(phase = %self.phase, "Undo ignored");
            return false;
        }
        let Some(boundary) = self.boundaries.pop() else {
            tracing::debug!("Nothing to undo");
            return false;
        };

        self.phase = TurnPhase::Undoing;
        tracing::info!(message_id = boundary.message_id, "Undoing turn");

        let tracker = self.delta.as_ref().map(|(tracker, _)| Arc::clone(tracker));
        let store = self.store.clone();
        let queue = Arc::clone(&self.write_queue);
        let session_id = self.session_id.clone();
        let inbox = self.inbox_tx.clone();

        tokio::spawn(async move {
            let message_id = boundary.message_id;

            let files = match tracker {
                Some(tracker) => {
                    let session = session_id.clone();
                    let restored = tokio::task::spawn_blocking(move || {
                        let report = tracker.undo(&session, message_id);
                        tracker.delete_turn(&session, message_id);
                        report
                    })
                    .await;
                    match restored {
                        Ok(Ok(report)) => Ok(report),
                        Ok(Err(e)) => Err(format!("{:#}", e)),
                        Err(e) => Err(format!("file restore task failed: {}", e)),
                    }
                }
                None => Ok(RestoreReport::default()),
            };

            // batches queued before the undo must land before the delete
            queue.flush().await;

            let session = session_id.clone();
            let deleted = tokio::task::spawn_blocking(move || {
                store.delete_messages_from(&session, message_id)
            })
            .await;
            let deleted = match deleted {
                Ok(Ok(count)) => Ok(count),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(e) => Err(format!("delete task failed: {}", e)),
            };

            let _ = inbox.send(ControllerMsg::UndoFinished(UndoJob {
                boundary,
                files,
                deleted,
            }));
        });

        true
    }

    /// Replace in-memory state with a stored session
    ///
    /// Accepts a full id or unique prefix. Resumed history has no undo
    /// boundaries. Returns the number of messages loaded.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::TurnRejected` when not idle, or the store
    /// error when the session cannot be loaded
    pub async fn resume(&mut self, session_id: &str) -> Result<usize> {
        if self.phase != TurnPhase::Idle {
            return Err(KestrelError::TurnRejected(format!("busy: {}", self.phase)).into());
        }

        // replies from the last turn may still be queued
        self.write_queue.flush().await;

        let store = self.store.clone();
        let requested = session_id.to_string();
        let (resolved, stored) = tokio::task::spawn_blocking(move || -> Result<_> {
            let resolved = store.resolve_session_id(&requested)?;
            let messages = store.load_messages(&resolved)?;
            Ok((resolved, messages))
        })
        .await
        .map_err(|e| KestrelError::Storage(format!("Resume task failed: {}", e)))??;

        self.history = stored.into_iter().map(|m| m.message).collect();
        self.display = self.history.iter().map(DisplayEntry::from_message).collect();
        self.boundaries.clear();
        self.input_tokens = self.history.iter().map(|m| m.input_tokens).sum();
        self.output_tokens = self.history.iter().map(|m| m.output_tokens).sum();
        self.streaming.clear();
        self.read_tracker.reset();
        self.session_id = resolved;

        tracing::info!(
            session_id = %self.session_id,
            messages = self.history.len(),
            "Resumed session"
        );
        Ok(self.history.len())
    }

    /// Wait for the next piece of background work and apply it
    ///
    /// Returns `None` immediately when idle.
    pub async fn next_update(&mut self) -> Option<ControllerEvent> {
        if self.phase == TurnPhase::Idle {
            return None;
        }

        let next = {
            let inbox = &mut self.inbox_rx;
            let turn = &mut self.turn;
            tokio::select! {
                Some(msg) = inbox.recv() => Next::Msg(msg),
                events = wait_turn(turn) => Next::Events(events),
                else => return None,
            }
        };

        Some(match next {
            Next::Msg(ControllerMsg::UserStored(result)) => self.on_user_stored(result),
            Next::Msg(ControllerMsg::UndoFinished(job)) => self.on_undo_finished(job),
            Next::Events(events) => self.apply_events(events),
        })
    }

    /// Apply updates until nothing is in flight
    pub async fn run_until_idle(&mut self) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_update().await {
            events.push(event);
        }
        events
    }

    /// Cancel any turn, let in-flight work settle, then drain the write queue
    ///
    /// Each wait is bounded by `drain_timeout`. Returns `true` when the
    /// write queue drained completely.
    pub async fn shutdown(mut self, drain_timeout: Duration) -> bool {
        self.cancel();
        let settled = tokio::time::timeout(drain_timeout, self.run_until_idle()).await;
        if settled.is_err() {
            tracing::warn!("Turn did not stop before shutdown timeout");
            if let Some(turn) = &self.turn {
                turn.abort();
            }
        }
        self.write_queue.shutdown(drain_timeout).await
    }

    fn on_user_stored(&mut self, result: std::result::Result<i64, String>) -> ControllerEvent {
        let boundary = self.pending.take();
        let linked = match (result, boundary) {
            (Ok(id), Some(mut boundary)) => {
                boundary.message_id = id;
                self.boundaries.push(boundary);
                tracing::debug!(message_id = id, "User message stored");
                Some(id)
            }
            (Ok(id), None) => Some(id),
            (Err(e), _) => {
                tracing::warn!(error = %e, "Failed to store user message; turn cannot be undone");
                self.display.push(DisplayEntry::Notice(format!(
                    "Message was not saved, this turn cannot be undone: {}",
                    e
                )));
                // retried ahead of the turn's replies so stored history keeps its shape
                self.unsaved_user = self.history.get(self.turn_history_start).cloned();
                None
            }
        };

        if self.cancel_requested {
            self.finish_turn(&TurnOutcome::Cancelled);
            return ControllerEvent::TurnFinished(TurnOutcome::Cancelled);
        }

        self.launch(linked);
        ControllerEvent::TurnStarted { message_id: linked }
    }

    fn launch(&mut self, linked: Option<i64>) {
        let processor: Arc<dyn TurnProcessor> = match (&self.delta, linked) {
            (Some((tracker, root)), Some(id)) => {
                tracker.begin_turn(&self.session_id, id);
                Arc::new(DeltaRecordingProcessor::new(
                    Arc::clone(&self.processor),
                    Arc::clone(tracker),
                    root.clone(),
                ))
            }
            _ => Arc::clone(&self.processor),
        };

        self.streaming.clear();
        self.turn = Some(spawn_turn(
            processor,
            self.history.clone(),
            CancellationToken::new(),
            self.config.event_queue_capacity,
        ));
        self.phase = TurnPhase::Streaming;
        tracing::debug!(history = self.history.len(), "Turn launched");
    }

    fn apply_events(&mut self, events: Vec<TurnEvent>) -> ControllerEvent {
        let cancelled = self.turn.as_ref().is_some_and(|t| t.is_cancelled());
        let mut to_persist = Vec::new();
        let mut outcome = None;

        for event in events {
            match event {
                TurnEvent::Delta(delta) => {
                    if !cancelled {
                        self.streaming.push(delta);
                    }
                }
                TurnEvent::Usage(usage) => {
                    self.input_tokens += usage.input_tokens;
                    self.output_tokens += usage.output_tokens;
                    self.unattributed_usage.input_tokens += usage.input_tokens;
                    self.unattributed_usage.output_tokens += usage.output_tokens;
                }
                TurnEvent::Message(mut message) => {
                    if message.role == Role::Assistant {
                        self.attribute_usage(&mut message);
                    }
                    self.streaming.clear();
                    self.display.push(DisplayEntry::from_message(&message));
                    self.history.push(message.clone());
                    to_persist.push(message);
                }
                terminal => outcome = TurnOutcome::from_event(&terminal),
            }
        }

        if let Some(outcome) = &outcome {
            if *outcome != TurnOutcome::Completed {
                to_persist.extend(self.close_dangling_tool_calls());
            }
        }
        self.persist(to_persist);

        match outcome {
            Some(outcome) => {
                self.finish_turn(&outcome);
                ControllerEvent::TurnFinished(outcome)
            }
            None => ControllerEvent::Progress,
        }
    }

    /// Answer tool calls the stopped turn never ran, keeping history valid
    fn close_dangling_tool_calls(&mut self) -> Vec<Message> {
        let start = self.turn_history_start.min(self.history.len());
        let dangling = unanswered_tool_calls(&self.history[start..]);
        if dangling.is_empty() {
            return Vec::new();
        }

        tracing::debug!(count = dangling.len(), "Closing interrupted tool calls");
        let mut synthetic: Vec<Message> = dangling
            .iter()
            .map(|call| Message::tool_result(call.id.clone(), INTERRUPTED_TOOL_RESULT))
            .collect();
        let mut closing = Message::assistant(INTERRUPTED_MESSAGE);
        self.attribute_usage(&mut closing);
        synthetic.push(closing);

        for message in &synthetic {
            self.display.push(DisplayEntry::from_message(message));
            self.history.push(message.clone());
        }
        synthetic
    }

    /// Stamp usage reported since the last assistant message onto `message`
    ///
    /// Resume rebuilds token counters from these per-message values.
    fn attribute_usage(&mut self, message: &mut Message) {
        let usage = std::mem::take(&mut self.unattributed_usage);
        if usage != TokenUsage::default() {
            message.input_tokens = usage.input_tokens;
            message.output_tokens = usage.output_tokens;
        }
    }

    fn persist(&mut self, mut messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        if let Some(user) = self.unsaved_user.take() {
            messages.insert(0, user);
        }
        let count = messages.len();
        if !self
            .write_queue
            .enqueue(StoreBatch::new(self.session_id.clone(), messages))
        {
            tracing::debug!(count, "Message batch not queued");
        }
    }

    fn finish_turn(&mut self, outcome: &TurnOutcome) {
        if let TurnOutcome::Failed(reason) = outcome {
            self.display.push(DisplayEntry::Error(reason.clone()));
        }
        // a turn that produced nothing still owes the store its user message
        if let Some(user) = self.unsaved_user.take() {
            self.persist(vec![user]);
        }
        self.turn = None;
        self.pending = None;
        self.cancel_requested = false;
        self.streaming.clear();
        self.phase = TurnPhase::Idle;
        self.trim_display();
        tracing::info!(outcome = ?outcome, "Turn finished");
    }

    /// Drop the oldest turns from display beyond the retention limit
    ///
    /// A turn starts at its user entry, linked or not. Trimmed turns keep
    /// their messages in history and in the store, but leave the undo stack.
    fn trim_display(&mut self) {
        let retention = self.config.display_retention.max(1);
        let starts: Vec<usize> = self
            .display
            .iter()
            .enumerate()
            .filter(|(_, entry)| matches!(entry, DisplayEntry::User(_)))
            .map(|(index, _)| index)
            .collect();
        if starts.len() <= retention {
            return;
        }

        let cut = starts[starts.len() - retention];
        self.display.drain(..cut);
        let before = self.boundaries.len();
        self.boundaries.retain(|b| b.display_index >= cut);
        for boundary in &mut self.boundaries {
            boundary.display_index -= cut;
        }
        tracing::debug!(
            turns = starts.len() - retention,
            boundaries = before - self.boundaries.len(),
            "Trimmed oldest turns from display"
        );
    }

    fn on_undo_finished(&mut self, job: UndoJob) -> ControllerEvent {
        let UndoJob {
            boundary,
            files,
            deleted,
        } = job;

        self.display.truncate(boundary.display_index);
        self.history.truncate(boundary.history_len);
        self.input_tokens = boundary.input_tokens_at_start;
        self.output_tokens = boundary.output_tokens_at_start;
        self.streaming.clear();
        self.read_tracker.reset();

        let (restored_files, file_error) = match files {
            Ok(report) => {
                let error = (!report.failed.is_empty()).then(|| {
                    report
                        .failed
                        .iter()
                        .map(|(path, reason)| format!("{}: {}", path.display(), reason))
                        .collect::<Vec<_>>()
                        .join("; ")
                });
                (report.restored, error)
            }
            Err(e) => (Vec::new(), Some(e)),
        };
        if !restored_files.is_empty() {
            self.indexer.reindex(&restored_files);
        }

        let (deleted_messages, store_error) = match deleted {
            Ok(count) => (count, None),
            Err(e) => (0, Some(e)),
        };

        if let Some(e) = &file_error {
            tracing::warn!(error = %e, "Undo could not restore every file");
        }
        if let Some(e) = &store_error {
            tracing::error!(error = %e, "Undo could not delete stored messages");
        }

        self.phase = TurnPhase::Idle;
        tracing::info!(
            message_id = boundary.message_id,
            restored = restored_files.len(),
            deleted_messages,
            "Undo finished"
        );

        ControllerEvent::UndoFinished(UndoSummary {
            message_id: boundary.message_id,
            restored_files,
            file_error,
            deleted_messages,
            store_error,
        })
    }
}

async fn wait_turn(turn: &mut Option<TurnHandle>) -> Vec<TurnEvent> {
    match turn {
        Some(handle) if !handle.is_finished() => handle.wait_for_events().await,
        _ => std::future::pending().await,
    }
}
