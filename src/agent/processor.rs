//! Turn processors: the work a turn performs
//!
//! [`TurnProcessor`] is the seam the engine runs. [`AgentLoop`] is the
//! standard implementation: ask the provider, run the requested tools, feed
//! the results back, repeat until the model answers without tool calls.

use super::engine::TurnCallbacks;
use crate::delta::DeltaTracker;
use crate::error::{KestrelError, Result};
use crate::providers::{
    validate_message_sequence, CompletionResponse, Message, Provider, StreamChunk,
};
use crate::tools::ToolRegistry;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One turn's worth of work
///
/// Implementations report through `callbacks` and must check `cancel` at
/// every model round-trip and tool boundary. Returning after cancellation
/// is enough; the engine reports the turn as cancelled.
#[async_trait]
pub trait TurnProcessor: Send + Sync {
    /// Process the turn ending with the last message of `history`
    ///
    /// # Errors
    ///
    /// Returns error if the turn cannot complete (provider failure, step
    /// limit reached)
    async fn process_turn(
        &self,
        cancel: CancellationToken,
        history: Vec<Message>,
        callbacks: TurnCallbacks,
    ) -> Result<()>;
}

/// Source of free-form notes injected as a system message before each call
pub trait Scratchpad: Send + Sync {
    /// Current notes, `None` when there is nothing to inject
    fn read(&self) -> Option<String>;
}

/// Provider/tool loop
///
/// # Examples
///
/// ```
/// use kestrel::agent::AgentLoop;
/// use kestrel::tools::ToolRegistry;
/// # use kestrel::providers::{CompletionResponse, Message, Provider};
/// # use std::sync::Arc;
/// # struct Echo;
/// # #[async_trait::async_trait]
/// # impl Provider for Echo {
/// #     async fn complete(&self, _m: &[Message], _t: &[serde_json::Value])
/// #         -> kestrel::error::Result<CompletionResponse> {
/// #         Ok(CompletionResponse::new(Message::assistant("hi")))
/// #     }
/// # }
///
/// let agent = AgentLoop::new(Arc::new(Echo), ToolRegistry::new(), 10);
/// assert_eq!(agent.max_steps(), 10);
/// ```
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
    max_steps: usize,
    max_tool_output: usize,
    scratchpad: Option<Arc<dyn Scratchpad>>,
}

impl AgentLoop {
    /// Default cap on one tool result, in bytes
    pub const DEFAULT_MAX_TOOL_OUTPUT: usize = 64 * 1024;

    /// Create a loop over `provider` and `tools`
    ///
    /// # Arguments
    ///
    /// * `provider` - Model backend
    /// * `tools` - Tools the model may call
    /// * `max_steps` - Model round-trips allowed per turn
    pub fn new(provider: Arc<dyn Provider>, tools: ToolRegistry, max_steps: usize) -> Self {
        Self {
            provider,
            tools,
            max_steps: max_steps.max(1),
            max_tool_output: Self::DEFAULT_MAX_TOOL_OUTPUT,
            scratchpad: None,
        }
    }

    /// Inject scratchpad notes before every model call
    pub fn with_scratchpad(mut self, scratchpad: Arc<dyn Scratchpad>) -> Self {
        self.scratchpad = Some(scratchpad);
        self
    }

    /// Override the tool output cap
    pub fn with_max_tool_output(mut self, bytes: usize) -> Self {
        self.max_tool_output = bytes;
        self
    }

    /// Model round-trips allowed per turn
    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    fn request_messages(&self, conversation: &[Message]) -> Vec<Message> {
        let notes = self.scratchpad.as_ref().and_then(|s| s.read());
        match notes {
            Some(notes) if !notes.trim().is_empty() => {
                let mut messages = Vec::with_capacity(conversation.len() + 1);
                messages.push(Message::system(format!("Scratchpad:\n{}", notes)));
                messages.extend_from_slice(conversation);
                messages
            }
            _ => conversation.to_vec(),
        }
    }

    /// Stream one model response, forwarding deltas
    ///
    /// Returns `None` if cancelled before the response finished.
    async fn model_call(
        &self,
        cancel: &CancellationToken,
        conversation: &[Message],
        callbacks: &TurnCallbacks,
    ) -> Result<Option<CompletionResponse>> {
        let request = self.request_messages(conversation);
        let definitions = self.tools.all_definitions();

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            stream = self.provider.stream(&request, &definitions) => stream?,
        };

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(StreamChunk::Delta(delta))) => callbacks.on_delta(delta).await,
                Some(Ok(StreamChunk::Done(response))) => return Ok(Some(response)),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(KestrelError::Provider(
                        "Stream ended without a final response".to_string(),
                    )
                    .into())
                }
            }
        }
    }
}

#[async_trait]
impl TurnProcessor for AgentLoop {
    async fn process_turn(
        &self,
        cancel: CancellationToken,
        history: Vec<Message>,
        callbacks: TurnCallbacks,
    ) -> Result<()> {
        let mut conversation = validate_message_sequence(&history);

        for step in 1..=self.max_steps {
            if cancel.is_cancelled() {
                tracing::debug!(step, "Turn cancelled before model call");
                return Ok(());
            }

            tracing::debug!(step, max_steps = self.max_steps, "Calling provider");
            let Some(response) = self.model_call(&cancel, &conversation, &callbacks).await? else {
                tracing::debug!(step, "Turn cancelled during model call");
                return Ok(());
            };

            let mut message = response.message;
            if let Some(usage) = response.usage {
                callbacks.on_usage(usage).await;
                message = message.with_usage(usage);
            }

            if message.content.is_empty() && !message.has_tool_calls() {
                tracing::warn!("Provider returned neither content nor tool calls");
                return Err(KestrelError::Provider(
                    "Provider returned invalid response (no content or tool calls)".to_string(),
                )
                .into());
            }

            let tool_calls = message.tool_calls.clone();
            callbacks.on_message(message.clone()).await;
            conversation.push(message);

            if tool_calls.is_empty() {
                tracing::debug!(step, "Provider returned final response");
                return Ok(());
            }

            tracing::debug!(count = tool_calls.len(), "Executing tool calls");
            for call in &tool_calls {
                if cancel.is_cancelled() {
                    tracing::debug!(tool = %call.name, "Turn cancelled before tool call");
                    return Ok(());
                }
                let result = self
                    .tools
                    .dispatch(call)
                    .await
                    .truncate_if_needed(self.max_tool_output);
                let reply = Message::tool_result(&call.id, result.to_message());
                callbacks.on_message(reply.clone()).await;
                conversation.push(reply);
            }
        }

        tracing::warn!(max_steps = self.max_steps, "Maximum steps exceeded");
        Err(KestrelError::Provider(format!(
            "Turn exceeded maximum of {} model steps",
            self.max_steps
        ))
        .into())
    }
}

/// Wraps a processor with before/after directory snapshots
///
/// The difference is recorded against the turn most recently passed to
/// [`DeltaTracker::begin_turn`], so the turn can be undone later. Snapshots
/// run on the blocking pool. Deltas are recorded even when the inner
/// processor fails or panics.
pub struct DeltaRecordingProcessor {
    inner: Arc<dyn TurnProcessor>,
    tracker: Arc<dyn DeltaTracker>,
    root: PathBuf,
}

impl DeltaRecordingProcessor {
    /// Wrap `inner`, snapshotting `root`
    pub fn new(inner: Arc<dyn TurnProcessor>, tracker: Arc<dyn DeltaTracker>, root: PathBuf) -> Self {
        Self {
            inner,
            tracker,
            root,
        }
    }

    async fn snapshot(&self) -> Option<crate::delta::Snapshot> {
        let tracker = Arc::clone(&self.tracker);
        let root = self.root.clone();
        match tokio::task::spawn_blocking(move || tracker.snapshot_dir(&root)).await {
            Ok(Ok(snapshot)) => Some(snapshot),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Snapshot failed, turn changes will not be undoable");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Snapshot task failed");
                None
            }
        }
    }
}

#[async_trait]
impl TurnProcessor for DeltaRecordingProcessor {
    async fn process_turn(
        &self,
        cancel: CancellationToken,
        history: Vec<Message>,
        callbacks: TurnCallbacks,
    ) -> Result<()> {
        let before = self.snapshot().await;

        let outcome = AssertUnwindSafe(self.inner.process_turn(cancel, history, callbacks))
            .catch_unwind()
            .await;

        if let Some(before) = before {
            if let Some(after) = self.snapshot().await {
                let tracker = Arc::clone(&self.tracker);
                let root = self.root.clone();
                let recorded = tokio::task::spawn_blocking(move || {
                    tracker.record_deltas(&root, &before, &after)
                })
                .await;
                match recorded {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "Failed to record deltas"),
                    Err(e) => tracing::warn!(error = %e, "Delta recording task failed"),
                }
            }
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
