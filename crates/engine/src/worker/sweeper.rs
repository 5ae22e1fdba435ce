//! Re-runs external tasks whose lock expired

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::dispatch::{Command, Dispatcher};
use crate::persistence::{ActivityStore, StoreError};

/// Periodic sweep over ACTIVE tasks with an expired lock
///
/// Each expired task is re-run, which releases its lock and makes it
/// available to the next poll.
pub struct TimeoutSweeper {
    activities: Arc<dyn ActivityStore>,
    dispatcher: Dispatcher,
    interval: Duration,
    batch_size: usize,
    shutdown_rx: watch::Receiver<bool>,
}

impl TimeoutSweeper {
    pub fn new(
        activities: Arc<dyn ActivityStore>,
        dispatcher: Dispatcher,
        interval: Duration,
        batch_size: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            activities,
            dispatcher,
            interval,
            batch_size: batch_size.max(1),
            shutdown_rx,
        }
    }

    /// Dispatch a re-run for every expired task, returning how many
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let expired = self
            .activities
            .find_timed_out(Utc::now(), self.batch_size)
            .await?;
        for execution in &expired {
            debug!(execution_id = %execution.id, topic = ?execution.topic, "Lock expired");
            self.dispatcher.dispatch(Command::ExecuteActivity {
                activity_id: execution.id,
            });
        }
        Ok(expired.len())
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut shutdown_rx = self.shutdown_rx.clone();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep().await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "Re-ran timed out tasks"),
                            Err(e) => error!(error = %e, "Timeout sweep failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Timeout sweeper: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}
