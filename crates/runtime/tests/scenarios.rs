//! End-to-end runs of the reasoning loop against a scripted backend and an
//! in-process calculator server.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::{ScriptedBackend, calls, registry};
use runtime::{
    BackendError, Completion, DispatchLimits, FailureReason, History, Message, Role, Session,
    SessionConfig, SessionState, WindowPolicy,
};
use serde_json::json;

fn tool_messages(session: &Session<Arc<ScriptedBackend>>) -> Vec<Message> {
    session
        .history()
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .cloned()
        .collect()
}

#[tokio::test]
async fn structured_call_then_final_answer() {
    let (registry, hits) = registry().await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(calls(&[("c1", "add", json!({"a": 3, "b": 4}))])),
        Ok(Completion::text("3 + 4 = 7")),
    ]));
    let mut session = Session::new(backend.clone(), registry, SessionConfig::default()).unwrap();

    let outcome = session.run("add 3 and 4").await.unwrap();
    assert_eq!(outcome.state, SessionState::Done);
    assert!(outcome.message.content.contains('7'));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let second_turn = &backend.seen()[1];
    let observation = second_turn.last().unwrap();
    assert_eq!(observation.role, Role::Tool);
    assert_eq!(observation.tool_call_id.as_deref(), Some("c1"));
    assert_eq!(observation.content, "7.0");
}

#[tokio::test]
async fn prose_that_looks_like_a_call_is_not_executed() {
    let (registry, hits) = registry().await;
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(Completion::text(
        "calling add with a=3, b=4",
    ))]));
    let mut session = Session::new(backend.clone(), registry, SessionConfig::default()).unwrap();

    let outcome = session.run("add 3 and 4").await.unwrap();
    assert_eq!(outcome.state, SessionState::Done);
    assert_eq!(outcome.message.content, "calling add with a=3, b=4");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn tool_error_is_observed_not_fatal() {
    let (registry, _) = registry().await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(calls(&[("c1", "fail", json!({}))])),
        Ok(Completion::text("The tool failed, sorry.")),
    ]));
    let mut session = Session::new(backend.clone(), registry, SessionConfig::default()).unwrap();

    let outcome = session.run("divide by zero").await.unwrap();
    assert_eq!(outcome.state, SessionState::Done);
    assert_eq!(backend.calls(), 2);

    let observation = backend.seen()[1].last().cloned().unwrap();
    assert_eq!(observation.role, Role::Tool);
    assert!(observation.content.starts_with("error tool_execution_error"));
    assert!(observation.content.contains("division by zero"));
}

#[tokio::test]
async fn budget_stops_after_the_last_observation() {
    let (registry, hits) = registry().await;
    let backend = Arc::new(ScriptedBackend::repeating(calls(&[(
        "c",
        "add",
        json!({"a": 1, "b": 1}),
    )])));
    let config = SessionConfig {
        turn_budget: 3,
        ..SessionConfig::default()
    };
    let mut session = Session::new(backend.clone(), registry, config).unwrap();

    let outcome = session.run("keep adding").await.unwrap();
    assert_eq!(outcome.state, SessionState::Failed(FailureReason::BudgetExceeded));
    assert_eq!(session.turn_count(), 3);
    assert_eq!(backend.calls(), 3);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(outcome.message.content.starts_with("Stopped:"));
    assert_eq!(tool_messages(&session).len(), 3);
}

#[tokio::test]
async fn parallel_results_follow_call_order() {
    let (registry, _) = registry().await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(calls(&[
            ("slow", "add", json!({"a": 1, "b": 1, "delay_ms": 100})),
            ("fast", "add", json!({"a": 2, "b": 2})),
            ("missing", "mul", json!({"a": 2, "b": 2})),
        ])),
        Ok(Completion::text("done")),
    ]));
    let mut session = Session::new(backend, registry, SessionConfig::default()).unwrap();
    session.run("three things").await.unwrap();

    let ids: Vec<_> = tool_messages(&session)
        .into_iter()
        .filter_map(|m| m.tool_call_id)
        .collect();
    assert_eq!(ids, ["slow", "fast", "missing"]);
}

#[tokio::test]
async fn invalid_arguments_never_reach_the_server() {
    let (registry, hits) = registry().await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(calls(&[("c1", "add", json!({"a": "three"}))])),
        Ok(Completion::text("I need numbers.")),
    ]));
    let mut session = Session::new(backend, registry, SessionConfig::default()).unwrap();

    let outcome = session.run("add three").await.unwrap();
    assert_eq!(outcome.state, SessionState::Done);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let observation = &tool_messages(&session)[0];
    assert!(observation.content.starts_with("error argument_validation_error"));
    assert!(observation.content.contains("a: expected number, found string"));
    assert!(observation.content.contains("b: missing required field"));
}

#[tokio::test]
async fn cancellation_interrupts_running_tools() {
    let (registry, _) = registry().await;
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(calls(&[(
        "c1",
        "add",
        json!({"a": 1, "b": 1, "delay_ms": 5000}),
    )]))]));
    let mut session = Session::new(backend.clone(), registry, SessionConfig::default()).unwrap();

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let outcome = session.run("slow sum").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(outcome.state, SessionState::Failed(FailureReason::Cancelled));
    assert_eq!(backend.calls(), 1);

    let observation = &tool_messages(&session)[0];
    assert!(observation.content.contains("cancelled"));
}

#[tokio::test]
async fn phase_deadline_becomes_an_observation() {
    let (registry, _) = registry().await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(calls(&[("c1", "add", json!({"a": 1, "b": 1, "delay_ms": 2000}))])),
        Ok(Completion::text("That took too long.")),
    ]));
    let config = SessionConfig {
        dispatch: DispatchLimits {
            max_in_flight: 1,
            phase_deadline: Duration::from_millis(50),
        },
        ..SessionConfig::default()
    };
    let mut session = Session::new(backend, registry, config).unwrap();

    let outcome = session.run("slow sum").await.unwrap();
    assert_eq!(outcome.state, SessionState::Done);
    assert!(tool_messages(&session)[0].content.contains("dispatch deadline exceeded"));
}

#[tokio::test]
async fn unreachable_backend_fails_the_session() {
    let (registry, _) = registry().await;
    let backend = Arc::new(ScriptedBackend::new(vec![Err(BackendError::Api {
        status: 503,
        body: "overloaded".into(),
    })]));
    let mut session = Session::new(backend, registry, SessionConfig::default()).unwrap();

    let outcome = session.run("hello").await.unwrap();
    assert_eq!(outcome.state, SessionState::Failed(FailureReason::BackendUnreachable));
    assert!(!outcome.message.content.is_empty());
    assert_eq!(outcome.message.role, Role::Assistant);
}

#[tokio::test]
async fn several_calls_without_multi_call_is_ambiguous() {
    let (registry, hits) = registry().await;
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(calls(&[
        ("c1", "add", json!({"a": 1, "b": 1})),
        ("c2", "add", json!({"a": 2, "b": 2})),
    ]))]));
    let config = SessionConfig {
        allow_multi_call: false,
        ..SessionConfig::default()
    };
    let mut session = Session::new(backend, registry, config).unwrap();

    let outcome = session.run("two sums").await.unwrap();
    assert_eq!(outcome.state, SessionState::Failed(FailureReason::Ambiguity));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fenced_call_in_text_is_executed() {
    let (registry, hits) = registry().await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(Completion::text(
            "Let me add those.\n```json\n{\"name\": \"add\", \"arguments\": {\"a\": 1, \"b\": 2}}\n```",
        )),
        Ok(Completion::text("1 + 2 = 3")),
    ]));
    let mut session = Session::new(backend, registry, SessionConfig::default()).unwrap();

    let outcome = session.run("add 1 and 2").await.unwrap();
    assert_eq!(outcome.state, SessionState::Done);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(tool_messages(&session)[0].content, "3.0");
}

#[tokio::test]
async fn window_limits_what_the_backend_sees() {
    let (registry, _) = registry().await;
    let mut earlier = History::new();
    for i in 0..10 {
        earlier.append(Message::user(format!("question {i}"))).unwrap();
        earlier.append(Message::assistant(format!("answer {i}"))).unwrap();
    }

    let backend = Arc::new(ScriptedBackend::new(vec![Ok(Completion::text("ok"))]));
    let config = SessionConfig {
        window: WindowPolicy {
            max_messages: Some(5),
            max_tokens: None,
            tail_messages: 2,
        },
        ..SessionConfig::default()
    };
    let mut session = Session::new(backend.clone(), registry, config)
        .unwrap()
        .with_history(earlier);
    session.run("latest").await.unwrap();

    let seen = &backend.seen()[0];
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[0].content, "question 8");
    assert_eq!(seen.last().unwrap().content, "latest");
    // The full log is still there.
    assert_eq!(session.history().len(), 22);
}
