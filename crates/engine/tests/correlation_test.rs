//! Message, error, escalation and conditional correlation

mod common;

use std::time::Duration;

use common::*;
use procflow_engine::prelude::*;

fn payment() -> ProcessDefinition {
    ProcessDefinition::builder("payment")
        .activity(start("start"))
        .activity(
            ActivityDefinition::new("wait_paid", ActivityType::MessageCatchEvent)
                .with_message("paid"),
        )
        .activity(end("end"))
        .flow("start", "wait_paid")
        .flow("wait_paid", "end")
        .build()
        .unwrap()
}

async fn start_payment(engine: &Engine, business_key: &str, order: i64) -> Process {
    let process = engine
        .start_process(
            StartRequest::by_key("payment")
                .with_business_key(business_key)
                .with_variable("order", json!(order)),
        )
        .await
        .unwrap();
    engine.wait_idle().await;
    process
}

#[test_log::test(tokio::test)]
async fn test_message_correlated_by_business_key() {
    let engine = engine();
    engine.deploy(payment()).await.unwrap();
    let process = start_payment(&engine, "order-1", 1).await;
    assert_eq!(single(&engine, process.id, "wait_paid").await.state, ActivityState::Active);

    let correlated = engine
        .correlate_message(
            MessageCorrelation::new("paid")
                .with_business_key("order-1")
                .with_variable("amount", json!(100)),
        )
        .await
        .unwrap();
    engine.wait_idle().await;

    assert_eq!(correlated.id, process.id);
    assert_eq!(state(&engine, process.id).await, ProcessState::Completed);
    assert_eq!(engine.variables(process.id).await.unwrap()["amount"], json!(100));
}

#[test_log::test(tokio::test)]
async fn test_message_correlated_by_variables() {
    let engine = engine();
    engine.deploy(payment()).await.unwrap();
    let first = start_payment(&engine, "order-1", 1).await;
    let second = start_payment(&engine, "order-2", 2).await;

    engine
        .correlate_message(MessageCorrelation::new("paid").with_correlation_key("order", json!(2)))
        .await
        .unwrap();
    engine.wait_idle().await;

    assert_eq!(state(&engine, first.id).await, ProcessState::Active);
    assert_eq!(state(&engine, second.id).await, ProcessState::Completed);
}

#[test_log::test(tokio::test)]
async fn test_message_correlation_errors() {
    let engine = engine();
    engine.deploy(payment()).await.unwrap();
    let first = start_payment(&engine, "shared", 1).await;
    start_payment(&engine, "shared", 2).await;

    let err = engine
        .correlate_message(MessageCorrelation::new("paid"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Correlation(CorrelationError::MissingCriteria { .. })
    ));

    let err = engine
        .correlate_message(MessageCorrelation::new("paid").with_business_key("unknown"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Correlation(CorrelationError::NoProcessCorrelated { .. })
    ));

    let err = engine
        .correlate_message(MessageCorrelation::new("refunded").with_business_key("shared"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Correlation(CorrelationError::NoProcessCorrelated { .. })
    ));

    let err = engine
        .correlate_message(MessageCorrelation::new("paid").with_business_key("shared"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Correlation(CorrelationError::MultipleProcessesCorrelated { count: 2, .. })
    ));

    engine.cancel_process(first.id).await.unwrap();
    let err = engine
        .correlate_message(
            MessageCorrelation::new("paid")
                .with_business_key("shared")
                .with_correlation_key("order", json!(1)),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Correlation(CorrelationError::InvalidProcessState {
            state: ProcessState::Canceled,
            ..
        })
    ));
}

#[test_log::test(tokio::test)]
async fn test_error_caught_by_boundary_on_sub_process() {
    let engine = engine();
    let definition = ProcessDefinition::builder("guarded")
        .activity(start("start"))
        .activity(ActivityDefinition::new("sub", ActivityType::SubProcess))
        .activity(start("inner_start").with_parent("sub"))
        .activity(
            ActivityDefinition::new("fail", ActivityType::ErrorEndEvent)
                .with_parent("sub")
                .with_error_code("E1"),
        )
        .activity(
            ActivityDefinition::boundary("catch", ActivityType::ErrorBoundaryEvent, "sub")
                .with_error_code("E1"),
        )
        .activity(task("recover"))
        .activity(end("end"))
        .activity(end("recovered_end"))
        .flow("start", "sub")
        .flow("inner_start", "fail")
        .flow("sub", "end")
        .flow("catch", "recover")
        .flow("recover", "recovered_end")
        .build()
        .unwrap();

    let process = run(&engine, definition, json!({})).await;

    assert_eq!(state(&engine, process.id).await, ProcessState::Completed);
    assert_eq!(single(&engine, process.id, "sub").await.state, ActivityState::Terminated);
    assert_eq!(single(&engine, process.id, "recover").await.state, ActivityState::Completed);
    assert_eq!(count(&engine, process.id, "end").await, 0);
}

#[test_log::test(tokio::test)]
async fn test_unhandled_error_fails_thrower() {
    let engine = engine();
    let definition = ProcessDefinition::builder("unguarded")
        .activity(start("start"))
        .activity(ActivityDefinition::new("fail", ActivityType::ErrorEndEvent).with_error_code("E9"))
        .flow("start", "fail")
        .build()
        .unwrap();

    let process = run(&engine, definition, json!({})).await;

    assert_eq!(state(&engine, process.id).await, ProcessState::Incident);
    let failed = engine.failed_activities(process.id).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].definition_id, "fail");
    let failure = failed[0].failure.as_ref().unwrap();
    assert_eq!(failure.error_code.as_deref(), Some("E9"));
}

fn call(id: &str, called: &str) -> ActivityDefinition {
    ActivityDefinition::call_activity(id, CallActivitySpec::new(called))
}

fn leaf() -> ProcessDefinition {
    ProcessDefinition::builder("leaf")
        .activity(start("start"))
        .activity(ActivityDefinition::new("fail", ActivityType::ErrorEndEvent).with_error_code("E1"))
        .flow("start", "fail")
        .build()
        .unwrap()
}

fn mid(with_handler: bool) -> ProcessDefinition {
    let mut builder = ProcessDefinition::builder("mid")
        .activity(start("start"))
        .activity(call("call_leaf", "leaf"))
        .activity(end("end"))
        .flow("start", "call_leaf")
        .flow("call_leaf", "end");
    if with_handler {
        builder = builder
            .activity(ActivityDefinition::new("handler", ActivityType::EventSubProcess))
            .activity(
                ActivityDefinition::new("on_error", ActivityType::ErrorStartEvent)
                    .with_parent("handler")
                    .with_error_code("E1"),
            )
            .activity(end("handled").with_parent("handler"))
            .flow("on_error", "handled");
    }
    builder.build().unwrap()
}

fn root() -> ProcessDefinition {
    ProcessDefinition::builder("root")
        .activity(start("start"))
        .activity(call("call_mid", "mid"))
        .activity(end("end"))
        .flow("start", "call_mid")
        .flow("call_mid", "end")
        .build()
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_unhandled_error_in_call_chain_raises_one_incident() {
    let (engine, metrics) = engine_with_metrics();
    engine.deploy_all(vec![leaf(), mid(false)]).await.unwrap();

    let process = run(&engine, root(), json!({})).await;

    assert_eq!(state(&engine, process.id).await, ProcessState::Incident);
    let call_mid = single(&engine, process.id, "call_mid").await;
    assert_eq!(call_mid.state, ActivityState::Terminated);

    let mid = engine.called_process(call_mid.id).await.unwrap().unwrap();
    assert_eq!(mid.state, ProcessState::Terminated);
    let call_leaf = single(&engine, mid.id, "call_leaf").await;
    let leaf = engine.called_process(call_leaf.id).await.unwrap().unwrap();
    assert_eq!(leaf.state, ProcessState::Terminated);
    assert_eq!(leaf.root(), process.id);

    assert_eq!(metrics.snapshot().incidents, 1);
}

#[test_log::test(tokio::test)]
async fn test_error_handled_by_event_sub_process_in_caller() {
    let engine = engine();
    engine.deploy_all(vec![leaf(), mid(true)]).await.unwrap();

    let process = run(&engine, root(), json!({})).await;

    let call_mid = single(&engine, process.id, "call_mid").await;
    let mid = engine.called_process(call_mid.id).await.unwrap().unwrap();
    assert_eq!(single(&engine, mid.id, "handled").await.state, ActivityState::Completed);
    assert_eq!(single(&engine, mid.id, "call_leaf").await.state, ActivityState::Terminated);
    assert_eq!(mid.state, ProcessState::Completed);
    assert_eq!(call_mid.state, ActivityState::Completed);
    assert_eq!(state(&engine, process.id).await, ProcessState::Completed);
}

#[test_log::test(tokio::test)]
async fn test_error_boundary_on_call_terminates_the_called_process() {
    let engine = engine();
    let mid = ProcessDefinition::builder("mid")
        .activity(start("start"))
        .activity(call("call_leaf", "leaf"))
        .activity(end("end"))
        .activity(
            ActivityDefinition::boundary("on_error", ActivityType::ErrorBoundaryEvent, "call_leaf")
                .with_error_code("E1")
                .non_interrupting(),
        )
        .activity(task("log"))
        .activity(end("logged"))
        .flow("start", "call_leaf")
        .flow("call_leaf", "end")
        .flow("on_error", "log")
        .flow("log", "logged")
        .build()
        .unwrap();
    engine.deploy(leaf()).await.unwrap();

    let process = run(&engine, mid, json!({})).await;

    let call_leaf = single(&engine, process.id, "call_leaf").await;
    assert_eq!(call_leaf.state, ActivityState::Terminated);
    let leaf = engine.called_process(call_leaf.id).await.unwrap().unwrap();
    assert_eq!(leaf.state, ProcessState::Terminated);
    assert_eq!(single(&engine, process.id, "logged").await.state, ActivityState::Completed);
    assert_eq!(count(&engine, process.id, "end").await, 0);
    assert_eq!(state(&engine, process.id).await, ProcessState::Completed);
}

#[test_log::test(tokio::test)]
async fn test_non_interrupting_escalation_boundary() {
    let engine = engine();
    let definition = ProcessDefinition::builder("escalating")
        .activity(start("start"))
        .activity(ActivityDefinition::new("sub", ActivityType::SubProcess))
        .activity(start("inner_start").with_parent("sub"))
        .activity(
            ActivityDefinition::new("late", ActivityType::EscalationThrowEvent)
                .with_parent("sub")
                .with_escalation_code("LATE"),
        )
        .activity(task("after_late").with_parent("sub"))
        .activity(end("inner_end").with_parent("sub"))
        .activity(
            ActivityDefinition::boundary("on_late", ActivityType::EscalationBoundaryEvent, "sub")
                .with_escalation_code("LATE")
                .non_interrupting(),
        )
        .activity(task("notify"))
        .activity(end("notified"))
        .activity(end("end"))
        .flow("start", "sub")
        .flow("inner_start", "late")
        .flow("late", "after_late")
        .flow("after_late", "inner_end")
        .flow("on_late", "notify")
        .flow("notify", "notified")
        .flow("sub", "end")
        .build()
        .unwrap();

    let process = run(&engine, definition, json!({})).await;

    assert_eq!(single(&engine, process.id, "late").await.state, ActivityState::Completed);
    assert_eq!(count(&engine, process.id, "after_late").await, 0);
    assert_eq!(count(&engine, process.id, "inner_end").await, 0);
    assert_eq!(single(&engine, process.id, "notify").await.state, ActivityState::Completed);
    assert_eq!(single(&engine, process.id, "sub").await.state, ActivityState::Completed);
    assert_eq!(count(&engine, process.id, "end").await, 1);
    assert_eq!(state(&engine, process.id).await, ProcessState::Completed);
}

#[test_log::test(tokio::test)]
async fn test_unhandled_escalation_continues_the_path() {
    let engine = engine();
    let definition = ProcessDefinition::builder("unheard")
        .activity(start("start"))
        .activity(
            ActivityDefinition::new("late", ActivityType::EscalationThrowEvent)
                .with_escalation_code("LATE"),
        )
        .activity(task("after_late"))
        .activity(end("end"))
        .flow("start", "late")
        .flow("late", "after_late")
        .flow("after_late", "end")
        .build()
        .unwrap();

    let process = run(&engine, definition, json!({})).await;

    assert_eq!(count(&engine, process.id, "after_late").await, 1);
    assert_eq!(state(&engine, process.id).await, ProcessState::Completed);
}

#[test_log::test(tokio::test)]
async fn test_conditional_catch_released_by_variable_change() {
    let engine = engine();
    let definition = ProcessDefinition::builder("approval")
        .activity(start("start"))
        .activity(
            ActivityDefinition::new("until_approved", ActivityType::ConditionalCatchEvent)
                .with_condition("${approved}"),
        )
        .activity(end("end"))
        .flow("start", "until_approved")
        .flow("until_approved", "end")
        .build()
        .unwrap();

    let process = run(&engine, definition, json!({ "approved": false })).await;
    assert_eq!(state(&engine, process.id).await, ProcessState::Active);

    engine
        .set_variables(process.id, vars(json!({ "approved": true })))
        .await
        .unwrap();
    engine.wait_idle().await;

    assert_eq!(state(&engine, process.id).await, ProcessState::Completed);
}

#[test_log::test(tokio::test)]
async fn test_event_based_gateway_message_wins() {
    let engine = engine();
    let definition = ProcessDefinition::builder("race")
        .activity(start("start"))
        .activity(ActivityDefinition::new("gw", ActivityType::EventBasedGateway))
        .activity(ActivityDefinition::new("reply", ActivityType::MessageCatchEvent).with_message("reply"))
        .activity(
            ActivityDefinition::new("deadline", ActivityType::TimerCatchEvent)
                .with_timer(Duration::from_secs(3600)),
        )
        .activity(end("answered"))
        .activity(end("expired"))
        .flow("start", "gw")
        .flow("gw", "reply")
        .flow("gw", "deadline")
        .flow("reply", "answered")
        .flow("deadline", "expired")
        .build()
        .unwrap();

    engine.deploy(definition).await.unwrap();
    let process = engine
        .start_process(StartRequest::by_key("race").with_business_key("ticket-7"))
        .await
        .unwrap();
    engine.wait_idle().await;

    engine
        .correlate_message(MessageCorrelation::new("reply").with_business_key("ticket-7"))
        .await
        .unwrap();
    engine.wait_idle().await;

    assert_eq!(single(&engine, process.id, "reply").await.state, ActivityState::Completed);
    assert_eq!(single(&engine, process.id, "deadline").await.state, ActivityState::Terminated);
    assert_eq!(count(&engine, process.id, "expired").await, 0);
    assert_eq!(state(&engine, process.id).await, ProcessState::Completed);
}
