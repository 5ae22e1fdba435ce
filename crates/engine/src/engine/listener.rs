//! Built-in event listeners
//!
//! Listeners never call lifecycle services directly; follow-up work is
//! dispatched as a command so it runs on the worker pool.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::dispatch::{Command, Dispatcher, EngineEvent, EventListener};
use crate::metrics::{MetricsSink, ProcessMetric};
use crate::persistence::ProcessStore;
use crate::runtime::ProcessState;

/// Re-checks an INCIDENT process whenever one of its activities completes
pub(crate) struct RecoveryListener {
    processes: Arc<dyn ProcessStore>,
    dispatcher: Dispatcher,
}

impl RecoveryListener {
    pub(crate) fn new(processes: Arc<dyn ProcessStore>, dispatcher: Dispatcher) -> Self {
        Self {
            processes,
            dispatcher,
        }
    }
}

#[async_trait]
impl EventListener for RecoveryListener {
    async fn on_event(&self, event: &EngineEvent) {
        let process_id = event.process_id();
        match self.processes.find_process(process_id).await {
            Ok(process) if process.state == ProcessState::Incident => {
                self.dispatcher.dispatch(Command::RecoverProcess { process_id });
            }
            Ok(_) => {}
            Err(e) => warn!(%process_id, error = %e, "Recovery check failed"),
        }
    }

    fn event_types(&self) -> Option<Vec<&'static str>> {
        Some(vec!["activity.completed"])
    }

    fn name(&self) -> &'static str {
        "RecoveryListener"
    }
}

/// Evaluates conditional events after variables change
pub(crate) struct ConditionalListener {
    dispatcher: Dispatcher,
}

impl ConditionalListener {
    pub(crate) fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl EventListener for ConditionalListener {
    async fn on_event(&self, event: &EngineEvent) {
        if let EngineEvent::VariablesSet { process_id, scopes } = event {
            self.dispatcher.dispatch(Command::CorrelateVariables {
                process_id: *process_id,
                scopes: scopes.clone(),
            });
        }
    }

    fn event_types(&self) -> Option<Vec<&'static str>> {
        Some(vec!["variables.set"])
    }

    fn name(&self) -> &'static str {
        "ConditionalListener"
    }
}

/// Feeds process lifecycle events into a [`MetricsSink`]
pub(crate) struct MetricsListener {
    sink: Arc<dyn MetricsSink>,
}

impl MetricsListener {
    pub(crate) fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl EventListener for MetricsListener {
    async fn on_event(&self, event: &EngineEvent) {
        let metric = match event {
            EngineEvent::ProcessStarted { .. } => ProcessMetric::Started,
            EngineEvent::ProcessCompleted { .. } => ProcessMetric::Completed,
            EngineEvent::ProcessCanceled { .. } => ProcessMetric::Canceled,
            EngineEvent::ProcessTerminated { .. } => ProcessMetric::Terminated,
            EngineEvent::ProcessIncident { .. } => ProcessMetric::Incident,
            EngineEvent::ProcessRecovered { .. } => ProcessMetric::Recovered,
            _ => return,
        };
        self.sink.record(metric);
    }

    fn name(&self) -> &'static str {
        "MetricsListener"
    }
}
