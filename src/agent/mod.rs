//! Turn orchestration
//!
//! A turn runs as background work ([`engine`]) that reports through a
//! bounded event queue ([`queue`]). The [`controller`] owns all
//! conversation state, drains those events in batches, persists history and
//! implements undo.

pub mod controller;
pub mod engine;
pub mod events;
pub mod processor;
pub mod queue;

pub use controller::{
    ControllerEvent, DisplayEntry, FileIndexer, NoopIndexer, StreamingText, TurnBoundary,
    TurnController, TurnPhase, UndoSummary,
};
pub use engine::{spawn_turn, TurnCallbacks, TurnHandle};
pub use events::{TurnEvent, TurnOutcome};
pub use processor::{AgentLoop, DeltaRecordingProcessor, Scratchpad, TurnProcessor};
pub use queue::{event_channel, EventReceiver, EventSender};
