//! Shared helpers for scenario tests

#![allow(dead_code)]

use std::sync::Arc;

use procflow_engine::prelude::*;
use procflow_engine::InMemoryMetrics;
use uuid::Uuid;

/// Engine on a fresh in-memory store, without the background sweep
pub fn engine() -> Engine {
    Engine::builder()
        .with_timeout_sweeper(false)
        .build()
        .expect("engine builds")
}

pub fn engine_with_metrics() -> (Engine, Arc<InMemoryMetrics>) {
    let metrics = Arc::new(InMemoryMetrics::new());
    let engine = Engine::builder()
        .with_timeout_sweeper(false)
        .with_metrics(metrics.clone())
        .build()
        .expect("engine builds");
    (engine, metrics)
}

pub fn vars(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object literal")
}

/// Deploy and start, then let the engine settle
pub async fn run(
    engine: &Engine,
    definition: ProcessDefinition,
    variables: Value,
) -> Process {
    let key = definition.key.clone();
    engine.deploy(definition).await.expect("deploys");
    let process = engine
        .start_process(StartRequest::by_key(key).with_variables(vars(variables)))
        .await
        .expect("starts");
    engine.wait_idle().await;
    process
}

pub async fn state(engine: &Engine, process_id: Uuid) -> ProcessState {
    engine.process(process_id).await.expect("process exists").state
}

/// The only execution of `definition_id` in a process
pub async fn single(engine: &Engine, process_id: Uuid, definition_id: &str) -> ActivityExecution {
    let mut found = engine
        .activities_of(process_id, definition_id)
        .await
        .expect("query works");
    assert_eq!(found.len(), 1, "expected one execution of {definition_id}");
    found.remove(0)
}

pub async fn count(engine: &Engine, process_id: Uuid, definition_id: &str) -> usize {
    engine
        .activities_of(process_id, definition_id)
        .await
        .expect("query works")
        .len()
}

pub fn start(id: &str) -> ActivityDefinition {
    ActivityDefinition::new(id, ActivityType::StartEvent)
}

pub fn end(id: &str) -> ActivityDefinition {
    ActivityDefinition::new(id, ActivityType::EndEvent)
}

pub fn task(id: &str) -> ActivityDefinition {
    ActivityDefinition::new(id, ActivityType::Task)
}

pub fn user_task(id: &str) -> ActivityDefinition {
    ActivityDefinition::new(id, ActivityType::UserTask)
}

/// start -> user task `review` -> end
pub fn review_process(key: &str) -> ProcessDefinition {
    ProcessDefinition::builder(key)
        .activity(start("start"))
        .activity(user_task("review"))
        .activity(end("end"))
        .flow("start", "review")
        .flow("review", "end")
        .build()
        .expect("valid definition")
}
