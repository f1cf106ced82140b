//! Control requests delivered to the coordinator.

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;

/// Requests that reach the coordinator from outside the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Re-read the configuration file into the live parameters.
    Reload,
    /// Restore automatic fan control, release everything and exit.
    Shutdown {
        /// Name of the request that triggered it, for logging.
        signal: String,
    },
    /// A request with no associated action.
    Unhandled(i32),
}

/// Sending half of the coordinator's event queue.
///
/// The queue is unbounded: a request is never dropped, however long the
/// coordinator takes to get to it.
///
/// # Example
///
/// ```no_run
/// use mbpfand::event::{Event, EventBus};
///
/// let (event_bus, mut receiver) = EventBus::channel();
/// event_bus.publish(Event::Reload).unwrap();
///
/// // In async context, receive events:
/// // let event = receiver.recv().await;
/// ```
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: mpsc::UnboundedSender<Event>,
}

/// Receiving half of the coordinator's event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

impl EventBus {
    /// Creates a connected bus and receiver.
    pub fn channel() -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queues an event.
    ///
    /// Returns an error if the receiver has been dropped.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|e| anyhow!("event receiver closed, dropped {:?}", e.0))
    }
}
