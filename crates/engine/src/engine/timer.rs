//! Delayed commands for timer events

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::dispatch::{Command, Dispatcher};

/// Fires commands once their delay elapsed
///
/// Pending timers are dropped on shutdown. The command itself re-checks the
/// state it acts on, so a timer outliving its activity is harmless.
#[derive(Clone)]
pub struct TimerService {
    dispatcher: Dispatcher,
    shutdown_rx: watch::Receiver<bool>,
}

impl TimerService {
    pub fn new(dispatcher: Dispatcher, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            dispatcher,
            shutdown_rx,
        }
    }

    pub fn schedule(&self, delay: Duration, command: Command) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        trace!(delay_ms = delay.as_millis() as u64, command = command.name(), "Timer armed");

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    trace!(command = command.name(), "Timer fired");
                    dispatcher.dispatch(command);
                }
                _ = shutdown_rx.changed() => {
                    debug!(command = command.name(), "Timer dropped on shutdown");
                }
            }
        })
    }
}
