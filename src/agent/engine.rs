//! Runs one turn as background work feeding an event queue
//!
//! The worker owns nothing but the history it was given and the producer
//! half of the queue. Whatever happens inside the processor (success, error,
//! cancellation, panic) the worker emits exactly one terminal event.

use super::events::TurnEvent;
use super::processor::TurnProcessor;
use super::queue::{event_channel, EventReceiver, EventSender};
use crate::providers::{Message, StreamDelta, TokenUsage};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Callbacks handed to a [`TurnProcessor`]
///
/// Each call pushes one event onto the turn's queue, waiting for space if
/// the consumer is behind.
#[derive(Debug, Clone)]
pub struct TurnCallbacks {
    events: EventSender,
}

impl TurnCallbacks {
    pub(crate) fn new(events: EventSender) -> Self {
        Self { events }
    }

    /// Partial reasoning/content text
    pub async fn on_delta(&self, delta: StreamDelta) {
        self.events.send(TurnEvent::Delta(delta)).await;
    }

    /// Usage of one model call
    pub async fn on_usage(&self, usage: TokenUsage) {
        self.events.send(TurnEvent::Usage(usage)).await;
    }

    /// A finalized history entry
    pub async fn on_message(&self, message: Message) {
        self.events.send(TurnEvent::Message(message)).await;
    }
}

/// A launched turn
#[derive(Debug)]
pub struct TurnHandle {
    receiver: EventReceiver,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TurnHandle {
    /// See [`EventReceiver::wait_for_events`]
    pub async fn wait_for_events(&mut self) -> Vec<TurnEvent> {
        self.receiver.wait_for_events().await
    }

    /// Ask the worker to stop at its next safe point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the terminal event has been delivered
    pub fn is_finished(&self) -> bool {
        self.receiver.is_finished()
    }

    /// Abort the worker outright (used only when shutdown gives up waiting)
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Launch `processor` on `history` as a background task
///
/// # Arguments
///
/// * `processor` - The turn implementation
/// * `history` - Full conversation history, ending with the new user message
/// * `cancel` - Cooperative cancellation signal
/// * `capacity` - Event queue capacity
///
/// # Returns
///
/// A handle whose [`TurnHandle::wait_for_events`] yields the turn's events
pub fn spawn_turn(
    processor: Arc<dyn TurnProcessor>,
    history: Vec<Message>,
    cancel: CancellationToken,
    capacity: usize,
) -> TurnHandle {
    let (tx, receiver) = event_channel(capacity);
    let worker_cancel = cancel.clone();

    let task = tokio::spawn(async move {
        let callbacks = TurnCallbacks::new(tx.clone());
        let outcome = AssertUnwindSafe(processor.process_turn(
            worker_cancel.clone(),
            history,
            callbacks,
        ))
        .catch_unwind()
        .await;

        let terminal = match outcome {
            Ok(_) if worker_cancel.is_cancelled() => TurnEvent::Cancelled,
            Ok(Ok(())) => TurnEvent::Completed,
            Ok(Err(e)) => {
                tracing::warn!(error = %format!("{:#}", e), "Turn failed");
                TurnEvent::Failed(format!("{:#}", e))
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(reason = %reason, "Turn worker panicked");
                TurnEvent::Failed(format!("turn worker panicked: {}", reason))
            }
        };

        tracing::debug!(terminal = ?terminal, "Turn finished");
        tx.send(terminal).await;
    });

    TurnHandle {
        receiver,
        cancel,
        task,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
