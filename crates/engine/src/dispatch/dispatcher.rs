//! Command dispatcher
//!
//! Commands either run synchronously with a reply ([`Dispatcher::execute`])
//! or are queued fire-and-forget ([`Dispatcher::dispatch`]). Both go through
//! one queue consumed by a pool bounded by a semaphore, so the process graph
//! is walked breadth-first instead of by recursion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Command, CommandOutcome};
use crate::engine::EngineError;

pub type CommandResult = Result<CommandOutcome, EngineError>;

/// Executes commands
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, command: Command) -> CommandResult;
}

struct Envelope {
    command: Command,
    reply: Option<oneshot::Sender<CommandResult>>,
}

struct DispatchState {
    pending: AtomicUsize,
    idle: Notify,
}

impl DispatchState {
    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Sending half of the command queue
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Envelope>,
    state: Arc<DispatchState>,
}

/// Receiving half of the command queue
pub struct DispatchQueue {
    rx: mpsc::UnboundedReceiver<Envelope>,
    state: Arc<DispatchState>,
}

impl Dispatcher {
    /// Create a dispatcher and the queue its loop will consume
    pub fn channel() -> (Dispatcher, DispatchQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(DispatchState {
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        (
            Dispatcher {
                tx,
                state: Arc::clone(&state),
            },
            DispatchQueue { rx, state },
        )
    }

    /// Queue a command without waiting for it
    pub fn dispatch(&self, command: Command) {
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        let name = command.name();
        if self
            .tx
            .send(Envelope {
                command,
                reply: None,
            })
            .is_err()
        {
            self.state.finish();
            warn!(command = name, "Dispatcher stopped, dropping command");
        }
    }

    /// Queue a command and wait for its result
    ///
    /// Must not be called from inside a command handler: the caller would
    /// hold a worker slot while waiting for another.
    pub async fn execute(&self, command: Command) -> CommandResult {
        let (reply, result) = oneshot::channel();
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        if self
            .tx
            .send(Envelope {
                command,
                reply: Some(reply),
            })
            .is_err()
        {
            self.state.finish();
            return Err(EngineError::Shutdown);
        }
        result.await.unwrap_or(Err(EngineError::Shutdown))
    }

    /// Commands queued or running
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Wait until no command is queued or running
    ///
    /// Timers that have not fired yet do not count as pending work.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl DispatchQueue {
    /// Consume the queue with at most `max_workers` concurrent commands
    pub fn spawn(
        self,
        handler: Arc<dyn CommandHandler>,
        max_workers: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(handler, max_workers.max(1), shutdown_rx))
    }

    async fn run(
        mut self,
        handler: Arc<dyn CommandHandler>,
        max_workers: usize,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let workers = Arc::new(Semaphore::new(max_workers));
        info!(max_workers, "Dispatch loop started");

        loop {
            let envelope = tokio::select! {
                envelope = self.rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
                _ = shutdown_rx.changed() => {
                    debug!("Dispatch loop: shutdown requested");
                    break;
                }
            };

            let permit = match Arc::clone(&workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let handler = Arc::clone(&handler);
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let Envelope { command, reply } = envelope;
                let name = command.name();
                let result = handler.handle(command).await;

                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            error!(command = name, error = %e, "Command failed");
                        }
                    }
                }

                drop(permit);
                state.finish();
            });
        }

        // Reject whatever is still queued so waiters are released
        self.rx.close();
        while let Ok(Envelope { reply, .. }) = self.rx.try_recv() {
            if let Some(reply) = reply {
                let _ = reply.send(Err(EngineError::Shutdown));
            }
            self.state.finish();
        }
        info!("Dispatch loop stopped");
    }
}

/// Outcome of a fan-out batch
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failures: Vec<(&'static str, EngineError)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run commands concurrently and wait for all of them
///
/// Units run outside the worker pool so a handler can fan out without
/// waiting on its own pool. One failure neither cancels nor blocks the rest.
pub async fn run_batch(handler: Arc<dyn CommandHandler>, commands: Vec<Command>) -> BatchReport {
    let units = commands.into_iter().map(|command| {
        let handler = Arc::clone(&handler);
        let name = command.name();
        (name, tokio::spawn(async move { handler.handle(command).await }))
    });
    let (names, handles): (Vec<_>, Vec<_>) = units.unzip();

    let mut report = BatchReport::default();
    for (name, joined) in names.into_iter().zip(join_all(handles).await) {
        match joined {
            Ok(Ok(_)) => report.succeeded += 1,
            Ok(Err(e)) => {
                warn!(command = name, error = %e, "Batch unit failed");
                report.failures.push((name, e));
            }
            Err(e) => {
                error!(command = name, error = %e, "Batch unit panicked");
                report.failures.push((name, EngineError::Internal(e.to_string())));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    /// Handler that counts commands and fails CancelProcess
    struct Recording {
        handled: AtomicUsize,
        follow_up: Option<Dispatcher>,
    }

    #[async_trait]
    impl CommandHandler for Recording {
        async fn handle(&self, command: Command) -> CommandResult {
            self.handled.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            match command {
                Command::CancelProcess { process_id } => {
                    Err(EngineError::Internal(format!("cannot cancel {process_id}")))
                }
                Command::CompleteProcess { process_id } => {
                    if let Some(dispatcher) = &self.follow_up {
                        dispatcher.dispatch(Command::RecoverProcess { process_id });
                    }
                    Ok(CommandOutcome::Done)
                }
                _ => Ok(CommandOutcome::Done),
            }
        }
    }

    fn recording(follow_up: Option<Dispatcher>) -> Arc<Recording> {
        Arc::new(Recording {
            handled: AtomicUsize::new(0),
            follow_up,
        })
    }

    #[tokio::test]
    async fn test_execute_returns_handler_result() {
        let (dispatcher, queue) = Dispatcher::channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        queue.spawn(recording(None), 2, shutdown_rx);

        let ok = dispatcher
            .execute(Command::CompleteProcess {
                process_id: Uuid::nil(),
            })
            .await;
        assert_eq!(ok.unwrap(), CommandOutcome::Done);

        let err = dispatcher
            .execute(Command::CancelProcess {
                process_id: Uuid::nil(),
            })
            .await;
        assert!(matches!(err, Err(EngineError::Internal(_))));
    }

    #[tokio::test]
    async fn test_wait_idle_covers_follow_ups() {
        let (dispatcher, queue) = Dispatcher::channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handler = recording(Some(dispatcher.clone()));
        queue.spawn(handler.clone(), 4, shutdown_rx);

        for _ in 0..10 {
            dispatcher.dispatch(Command::CompleteProcess {
                process_id: Uuid::nil(),
            });
        }
        dispatcher.wait_idle().await;

        assert_eq!(handler.handled.load(Ordering::SeqCst), 20);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_execute_after_shutdown() {
        let (dispatcher, queue) = Dispatcher::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = queue.spawn(recording(None), 1, shutdown_rx);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let result = dispatcher
            .execute(Command::CompleteProcess {
                process_id: Uuid::nil(),
            })
            .await;
        assert!(matches!(result, Err(EngineError::Shutdown)));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_batch_reports_partial_failure() {
        let handler = recording(None);
        let commands = vec![
            Command::CompleteProcess {
                process_id: Uuid::nil(),
            },
            Command::CancelProcess {
                process_id: Uuid::nil(),
            },
            Command::RecoverProcess {
                process_id: Uuid::nil(),
            },
        ];

        let report = run_batch(handler.clone(), commands).await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "cancel_process");
        assert!(!report.is_success());
        assert_eq!(handler.handled.load(Ordering::SeqCst), 3);
    }
}
