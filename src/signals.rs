//! Translation of OS signals into coordinator events.
//!
//! The listener thread never touches daemon state: it only queues an
//! [`Event`] for the coordinator to act on at its next check-in point.

use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use log::{debug, info};
use signal_hook::{
    consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2},
    iterator::{Handle, Signals},
    low_level::signal_name,
};

use crate::event::{Event, EventBus};

/// Signals the daemon takes over from their default disposition.
pub const LISTENED_SIGNALS: [i32; 6] = [SIGHUP, SIGTERM, SIGINT, SIGQUIT, SIGUSR1, SIGUSR2];

/// Maps a signal number to the request it stands for.
pub fn classify(signal: i32) -> Event {
    match signal {
        SIGHUP => Event::Reload,
        SIGTERM | SIGINT | SIGQUIT => Event::Shutdown {
            signal: describe(signal),
        },
        other => Event::Unhandled(other),
    }
}

/// Human readable signal name, e.g. `SIGTERM`.
pub fn describe(signal: i32) -> String {
    signal_name(signal)
        .map(str::to_string)
        .unwrap_or_else(|| format!("signal {signal}"))
}

/// Background thread forwarding [`LISTENED_SIGNALS`] to an [`EventBus`].
pub struct SignalListener {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalListener {
    /// Registers the handlers and starts forwarding.
    pub fn spawn(event_bus: EventBus) -> Result<Self> {
        let mut signals =
            Signals::new(LISTENED_SIGNALS).context("Failed to register signal handlers")?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name("signals".into())
            .spawn(move || {
                for signal in signals.forever() {
                    info!("Received {}", describe(signal));
                    if event_bus.publish(classify(signal)).is_err() {
                        debug!("Coordinator gone, signal listener exiting");
                        break;
                    }
                }
            })
            .context("Failed to spawn signal listener thread")?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Stops forwarding and joins the listener thread.
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.stop();
    }
}
