//! Bounded event queue between a turn worker and its single consumer

use super::events::TurnEvent;
use tokio::sync::mpsc;

/// Message used when a turn's producers vanish without a terminal event
pub const LOST_TURN_MESSAGE: &str = "turn worker exited without reporting a result";

/// Create a queue holding at most `capacity` undelivered events
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        EventSender { tx },
        EventReceiver {
            rx,
            max_batch: capacity,
            finished: false,
        },
    )
}

/// Producer half; cheap to clone
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<TurnEvent>,
}

impl EventSender {
    /// Queue an event, waiting for space when the queue is full
    ///
    /// Returns `false` if the consumer is gone.
    pub async fn send(&self, event: TurnEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// Consumer half
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<TurnEvent>,
    max_batch: usize,
    finished: bool,
}

impl EventReceiver {
    /// Wait for at least one event, then take everything already queued
    ///
    /// Events come back in emission order. A batch never extends past a
    /// terminal event. If every sender is dropped before a terminal event
    /// was seen, a synthetic [`TurnEvent::Failed`] ends the turn. After the
    /// terminal event this returns an empty batch.
    pub async fn wait_for_events(&mut self) -> Vec<TurnEvent> {
        if self.finished {
            return Vec::new();
        }

        let Some(first) = self.rx.recv().await else {
            self.finished = true;
            tracing::warn!("{}", LOST_TURN_MESSAGE);
            return vec![TurnEvent::Failed(LOST_TURN_MESSAGE.to_string())];
        };

        let mut batch = Vec::new();
        let mut event = first;
        loop {
            let terminal = event.is_terminal();
            batch.push(event);
            if terminal {
                self.finished = true;
                self.rx.close();
                break;
            }
            if batch.len() >= self.max_batch {
                break;
            }
            match self.rx.try_recv() {
                Ok(next) => event = next,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.finished = true;
                    tracing::warn!("{}", LOST_TURN_MESSAGE);
                    batch.push(TurnEvent::Failed(LOST_TURN_MESSAGE.to_string()));
                    break;
                }
            }
        }
        batch
    }

    /// Whether the terminal event has been delivered
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
