//! Call activities, cancellation, migration, deployment and listeners

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::*;
use parking_lot::Mutex;
use procflow_engine::prelude::*;
use procflow_engine::MigrationError;

fn doubler() -> ProcessDefinition {
    review_process("doubler")
}

fn caller() -> ProcessDefinition {
    let spec = CallActivitySpec::new("doubler")
        .with_input(CallMapping::Copy {
            source: "amount".into(),
            target: "amount".into(),
        })
        .with_output(CallMapping::Expression {
            expression: "${amount * 2}".into(),
            target: "doubled".into(),
        });
    ProcessDefinition::builder("caller")
        .activity(start("start"))
        .activity(ActivityDefinition::call_activity("call", spec))
        .activity(end("end"))
        .flow("start", "call")
        .flow("call", "end")
        .build()
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_call_activity_maps_variables_both_ways() {
    let engine = engine();
    engine.deploy(doubler()).await.unwrap();
    let process = run(&engine, caller(), json!({ "amount": 21, "secret": "x" })).await;

    let call = single(&engine, process.id, "call").await;
    assert_eq!(call.state, ActivityState::Active);
    let child = engine.called_process(call.id).await.unwrap().unwrap();
    assert_eq!(child.parent_id, Some(process.id));
    assert_eq!(child.business_key, None);

    let child_vars = engine.variables(child.id).await.unwrap();
    assert_eq!(child_vars["amount"], json!(21));
    assert!(!child_vars.contains_key("secret"));

    let review = single(&engine, child.id, "review").await;
    engine.complete_activity(review.id, Map::new()).await.unwrap();
    engine.wait_idle().await;

    assert_eq!(state(&engine, child.id).await, ProcessState::Completed);
    assert_eq!(state(&engine, process.id).await, ProcessState::Completed);
    assert_eq!(engine.variables(process.id).await.unwrap()["doubled"], json!(42));
}

#[test_log::test(tokio::test)]
async fn test_cancel_terminates_open_activities() {
    let (engine, metrics) = engine_with_metrics();
    let process = run(&engine, review_process("cancelable"), json!({})).await;
    let review = single(&engine, process.id, "review").await;

    let outcome = engine.cancel_process(process.id).await.unwrap();
    assert!(!outcome.is_skipped());
    engine.wait_idle().await;

    assert_eq!(state(&engine, process.id).await, ProcessState::Canceled);
    assert_eq!(engine.activity(review.id).await.unwrap().state, ActivityState::Terminated);

    let late = engine.complete_activity(review.id, Map::new()).await.unwrap();
    assert!(late.is_skipped());
    assert!(engine.cancel_process(process.id).await.unwrap().is_skipped());

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.canceled, 1);
    assert_eq!(snapshot.active, 0);
}

#[test_log::test(tokio::test)]
async fn test_cancel_reaches_called_process() {
    let engine = engine();
    engine.deploy(doubler()).await.unwrap();
    let process = run(&engine, caller(), json!({ "amount": 1 })).await;
    let call = single(&engine, process.id, "call").await;
    let child = engine.called_process(call.id).await.unwrap().unwrap();

    engine.cancel_process(process.id).await.unwrap();
    engine.wait_idle().await;

    assert_eq!(state(&engine, process.id).await, ProcessState::Canceled);
    assert_eq!(state(&engine, child.id).await, ProcessState::Terminated);
    assert_eq!(single(&engine, child.id, "review").await.state, ActivityState::Terminated);
}

fn approval_v2() -> ProcessDefinition {
    ProcessDefinition::builder("approval")
        .activity(start("start"))
        .activity(user_task("approve"))
        .activity(task("archive"))
        .activity(end("end"))
        .flow("start", "approve")
        .flow("approve", "archive")
        .flow("archive", "end")
        .build()
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_migration_moves_waiting_activity() {
    let engine = engine();
    let process = run(&engine, review_process("approval"), json!({ "amount": 5 })).await;
    let v2 = engine.deploy(approval_v2()).await.unwrap();
    assert_eq!(v2.version, 2);

    let report = engine
        .migrate(&MigrationPlan::new(vec![process.id], v2.id).with_mapping("review", "approve"))
        .await
        .unwrap();
    assert_eq!(report.migrated, 1);
    assert_eq!(report.activities, 1);

    let migrated = engine.process(process.id).await.unwrap();
    assert_eq!(migrated.definition_id, v2.id);

    let approve = single(&engine, process.id, "approve").await;
    assert_eq!(approve.state, ActivityState::Active);
    engine.complete_activity(approve.id, Map::new()).await.unwrap();
    engine.wait_idle().await;

    assert_eq!(single(&engine, process.id, "archive").await.state, ActivityState::Completed);
    assert_eq!(state(&engine, process.id).await, ProcessState::Completed);
    assert_eq!(engine.variables(process.id).await.unwrap()["amount"], json!(5));
}

#[test_log::test(tokio::test)]
async fn test_migration_is_validated_up_front() {
    let engine = engine();
    let process = run(&engine, review_process("approval"), json!({})).await;
    let v2 = engine.deploy(approval_v2()).await.unwrap();
    let other = engine.deploy(review_process("other")).await.unwrap();

    let err = engine
        .migrate(&MigrationPlan::new(vec![process.id], v2.id))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::UnmappedActivity { ref activity_id, .. } if activity_id == "review"
    ));

    let err = engine
        .migrate(&MigrationPlan::new(vec![process.id], other.id))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::KeyMismatch { .. }));

    // Nothing moved
    let unchanged = engine.process(process.id).await.unwrap();
    assert_ne!(unchanged.definition_id, v2.id);
    assert_eq!(single(&engine, process.id, "review").await.state, ActivityState::Active);

    engine.cancel_process(process.id).await.unwrap();
    let err = engine
        .migrate(&MigrationPlan::new(vec![process.id], v2.id).with_mapping("review", "approve"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::InvalidProcessState {
            state: ProcessState::Canceled,
            ..
        }
    ));
}

#[test_log::test(tokio::test)]
async fn test_deploy_versions_and_pinned_start() {
    let engine = engine();
    let v1 = engine.deploy(review_process("doc")).await.unwrap();
    let v2 = engine.deploy(review_process("doc")).await.unwrap();
    assert_eq!((v1.version, v2.version), (1, 2));
    assert_ne!(v1.id, v2.id);
    assert_eq!(engine.latest_definition("doc").await.unwrap().id, v2.id);

    let latest = engine.start_process(StartRequest::by_key("doc")).await.unwrap();
    assert_eq!(latest.definition_id, v2.id);

    let pinned = engine
        .start_process(StartRequest::by_key("doc").with_version(1))
        .await
        .unwrap();
    assert_eq!(pinned.definition_id, v1.id);

    let missing = engine.start_process(StartRequest::by_key("nope")).await;
    assert!(missing.is_err());
}

#[test_log::test(tokio::test)]
async fn test_invalid_definition_is_rejected() {
    let engine = engine();
    let mut definition = review_process("broken");
    definition.activities.retain(|a| a.id != "start");

    let err = engine.deploy(definition).await.unwrap_err();
    assert!(matches!(err, EngineError::Model(_)));
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl EventListener for Recorder {
    async fn on_event(&self, event: &EngineEvent) {
        self.seen.lock().push(event.event_type());
    }

    fn event_types(&self) -> Option<Vec<&'static str>> {
        Some(vec!["process.started", "process.completed"])
    }
}

#[test_log::test(tokio::test)]
async fn test_custom_listener_receives_filtered_events() {
    let recorder = Arc::new(Recorder::default());
    let engine = Engine::builder()
        .with_timeout_sweeper(false)
        .with_listener(recorder.clone())
        .build()
        .unwrap();

    let definition = ProcessDefinition::builder("quick")
        .activity(start("start"))
        .activity(end("end"))
        .flow("start", "end")
        .build()
        .unwrap();
    run(&engine, definition, json!({})).await;

    assert_eq!(
        *recorder.seen.lock(),
        vec!["process.started", "process.completed"]
    );
}

#[test_log::test(tokio::test)]
async fn test_metrics_track_process_outcomes() {
    let (engine, metrics) = engine_with_metrics();
    let quick = ProcessDefinition::builder("quick")
        .activity(start("start"))
        .activity(end("end"))
        .flow("start", "end")
        .build()
        .unwrap();
    run(&engine, quick, json!({})).await;
    let waiting = run(&engine, review_process("waiting"), json!({})).await;
    engine.terminate_process(waiting.id).await.unwrap();
    run(&engine, review_process("waiting"), json!({})).await;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.started, 3);
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.terminated, 1);
    assert_eq!(snapshot.active, 1);
}
