//! Events produced by a running turn

use crate::providers::{Message, StreamDelta, TokenUsage};

/// One item on a turn's event queue
///
/// Every turn ends with exactly one terminal event: [`TurnEvent::Completed`],
/// [`TurnEvent::Failed`] or [`TurnEvent::Cancelled`].
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Partial reasoning or content text
    Delta(StreamDelta),
    /// Token usage of one model call
    Usage(TokenUsage),
    /// A finalized history entry (assistant reply or tool result)
    Message(Message),
    /// The turn finished normally
    Completed,
    /// The turn stopped on an error
    Failed(String),
    /// The turn observed cancellation and stopped
    Cancelled,
}

impl TurnEvent {
    /// Whether this event ends the turn
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEvent::Completed | TurnEvent::Failed(_) | TurnEvent::Cancelled
        )
    }
}

/// How a turn ended, as seen by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Finished normally
    Completed,
    /// Stopped on an error
    Failed(String),
    /// Stopped on request
    Cancelled,
}

impl TurnOutcome {
    /// Map a terminal event to an outcome; `None` for non-terminal events
    pub fn from_event(event: &TurnEvent) -> Option<Self> {
        match event {
            TurnEvent::Completed => Some(TurnOutcome::Completed),
            TurnEvent::Failed(reason) => Some(TurnOutcome::Failed(reason.clone())),
            TurnEvent::Cancelled => Some(TurnOutcome::Cancelled),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(TurnEvent::Completed.is_terminal());
        assert!(TurnEvent::Failed("x".into()).is_terminal());
        assert!(TurnEvent::Cancelled.is_terminal());
        assert!(!TurnEvent::Delta(StreamDelta::content("a")).is_terminal());
        assert!(!TurnEvent::Usage(TokenUsage::new(1, 2)).is_terminal());
        assert_eq!(
            TurnOutcome::from_event(&TurnEvent::Failed("boom".into())),
            Some(TurnOutcome::Failed("boom".into()))
        );
        assert_eq!(
            TurnOutcome::from_event(&TurnEvent::Message(Message::assistant("a"))),
            None
        );
    }
}
