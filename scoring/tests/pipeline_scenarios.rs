//! End-to-end invocation tests against scripted in-process backends; no
//! inference endpoint required.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::*;
use scoring::error::FailureKind;
use scoring::{InvocationError, TaskOutput, TransportError};

// ── Aggregation scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_split_vote_blends_top_three_categories() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .member("m0", choice(0))
            .member("m1", choice(0))
            .member("m2", choice(2))
            .member("m3", choice(3))
            .member("m4", choice(0)),
    );
    let outcome = pipeline(backend.clone(), test_config())
        .invoke(&tone_function(), email_input())
        .await
        .unwrap();

    let TaskOutput::Single(result) = &outcome.tasks[0] else {
        panic!("expected a single task result, got {:?}", outcome.tasks[0]);
    };
    for (got, want) in result.scores.iter().zip([0.6, 0.0, 0.2, 0.2]) {
        assert!(approx(*got, want), "scores {:?}", result.scores);
    }
    assert!((outcome.score().unwrap() - 0.666).abs() < 1e-9);
    assert!(!outcome.is_degraded());
    assert_eq!(backend.total_calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_timed_out_member_is_excluded() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .member("m0", choice(0))
            .member("m1", choice(0))
            .member("m2", Behavior::Delay(Duration::from_secs(600), json!({ "choice": 3 })))
            .member("m3", choice(0))
            .member("m4", choice(0)),
    );
    let outcome = pipeline(backend.clone(), test_config())
        .invoke(&tone_function(), email_input())
        .await
        .unwrap();

    let TaskOutput::Single(result) = &outcome.tasks[0] else {
        panic!("expected a single task result");
    };
    assert_eq!(result.scores, vec![1.0, 0.0, 0.0, 0.0]);
    assert_eq!(result.members, vec!["m0", "m1", "m3", "m4"]);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].member, "m2");
    assert_eq!(result.failures[0].kind, FailureKind::Timeout);
    assert!(outcome.is_degraded());
    assert_eq!(outcome.score(), Some(1.0));
    // Timeouts are transport failures: retried once.
    assert_eq!(backend.calls("m2"), 2);
}

#[tokio::test]
async fn scenario_c_all_members_fail_exhausts_ensemble() {
    let mut backend = ScriptedBackend::new();
    for i in 0..5 {
        backend = backend.member(
            &format!("m{i}"),
            Behavior::Fail(TransportError::Connection("connection refused".into())),
        );
    }
    let backend = Arc::new(backend);

    let err = pipeline(backend.clone(), test_config())
        .invoke(&tone_function(), email_input())
        .await
        .unwrap_err();

    match &err {
        InvocationError::EnsembleExhausted { task, failures } => {
            assert_eq!(*task, 0);
            assert_eq!(failures.len(), 5);
            assert!(failures.iter().all(|f| f.kind == FailureKind::Transport && f.attempts == 2));
        }
        other => panic!("expected EnsembleExhausted, got {other}"),
    }
    assert_eq!(err.failures().len(), 5);
    assert_eq!(backend.total_calls(), 10);
}

// ── Retry policy ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn transient_transport_failure_recovers_on_retry() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .member("m0", Behavior::FlakyThen(json!({ "choice": 1 })))
            .member("m1", choice(1))
            .member("m2", choice(1))
            .member("m3", choice(1))
            .member("m4", choice(1)),
    );
    let outcome = pipeline(backend.clone(), test_config())
        .invoke(&tone_function(), email_input())
        .await
        .unwrap();

    assert!(!outcome.is_degraded());
    assert!(approx(outcome.score().unwrap(), 0.66));
    assert_eq!(backend.calls("m0"), 2);
}

#[tokio::test]
async fn malformed_reply_is_excluded_without_retry() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .member("m0", Behavior::Reply(json!({ "choice": 9 })))
            .member("m1", choice(0))
            .member("m2", choice(0))
            .member("m3", choice(0))
            .member("m4", Behavior::Reply(json!("The tone is fine."))),
    );
    let outcome = pipeline(backend.clone(), test_config())
        .invoke(&tone_function(), email_input())
        .await
        .unwrap();

    let TaskOutput::Single(result) = &outcome.tasks[0] else {
        panic!("expected a single task result");
    };
    assert_eq!(result.failures.len(), 2);
    assert!(result
        .failures
        .iter()
        .all(|f| f.kind == FailureKind::MalformedReply && f.attempts == 1));
    assert_eq!(backend.calls("m0"), 1);
    assert_eq!(backend.calls("m4"), 1);
}

// ── Deadlines and cancellation ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn invocation_deadline_fails_whole_call() {
    let mut backend = ScriptedBackend::new();
    for i in 0..5 {
        backend = backend.member(
            &format!("m{i}"),
            Behavior::Delay(Duration::from_secs(120), json!({ "choice": 0 })),
        );
    }
    let mut config = test_config();
    config.member_timeout_secs = 300;
    config.invocation_timeout_secs = 30;

    let err = pipeline(Arc::new(backend), config)
        .invoke(&tone_function(), email_input())
        .await
        .unwrap_err();
    assert!(matches!(err, InvocationError::InvocationTimeout(d) if d == Duration::from_secs(30)));
}

#[tokio::test(start_paused = true)]
async fn cancelled_invocation_reports_cancelled() {
    let mut backend = ScriptedBackend::new();
    for i in 0..5 {
        backend = backend.member(
            &format!("m{i}"),
            Behavior::Delay(Duration::from_secs(3), json!({ "choice": 0 })),
        );
    }
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = pipeline(Arc::new(backend), test_config())
        .invoke_with_cancel(&tone_function(), email_input(), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, InvocationError::Cancelled));
}

// ── Input validation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn schema_violation_rejected_before_dispatch() {
    let backend = Arc::new(ScriptedBackend::new().member("m0", choice(0)));
    let err = pipeline(backend.clone(), test_config())
        .invoke(&tone_function(), json!({ "email": "hello" }))
        .await
        .unwrap_err();

    match err {
        InvocationError::SchemaViolation(v) => assert!(v.message.contains("context")),
        other => panic!("expected SchemaViolation, got {other}"),
    }
    assert_eq!(backend.total_calls(), 0);
}

// ── Rendering ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn prompt_is_rendered_from_input() {
    let mut backend = ScriptedBackend::new();
    for i in 0..5 {
        backend = backend.member(&format!("m{i}"), choice(0));
    }
    let backend = Arc::new(backend);
    pipeline(backend.clone(), test_config())
        .invoke(&tone_function(), email_input())
        .await
        .unwrap();

    let prompts = backend.prompts();
    assert_eq!(prompts.len(), 5);
    assert_eq!(
        prompts[0],
        "Context: Checking in with a teammate\n\nEmail:\nHi Mike, are we still on track for Wednesday?"
    );
}

#[tokio::test]
async fn repeated_invocations_are_deterministic() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .member("m0", Behavior::Reply(json!({ "probabilities": [0.5, 0.3, 0.1, 0.1] })))
            .member("m1", choice(1))
            .member("m2", choice(2))
            .member("m3", Behavior::Reply(json!({ "probabilities": [0.25, 0.25, 0.25, 0.25] })))
            .member("m4", choice(0)),
    );
    let engine = pipeline(backend, test_config());
    let function = tone_function();

    let first = engine.invoke(&function, email_input()).await.unwrap();
    let second = engine.invoke(&function, email_input()).await.unwrap();
    assert_eq!(first.output, second.output);
    assert_eq!(first.tasks, second.tasks);
    assert_ne!(first.id, second.id);
}

// ── Skip, map and dependent tasks ────────────────────────────────────────────

#[tokio::test]
async fn skipped_task_is_omitted_and_never_dispatched() {
    let function = compile(
        json!({
            "name": "two-step",
            "input_schema": email_schema(),
            "tasks": [
                {
                    "messages": [{ "role": "user", "content": "input.email" }],
                    "responses": ["good", "bad"]
                },
                {
                    "skip": "length(input.email) < 100",
                    "messages": [{ "role": "user", "content": "input.context" }],
                    "responses": ["good", "bad"]
                }
            ],
            "output": "tasks[0].scores[0] * 100"
        }),
        json!({ "tasks": [ensemble("a", 2), ensemble("b", 2)] }),
    );
    let backend = Arc::new(
        ScriptedBackend::new()
            .member("a0", choice(0))
            .member("a1", choice(1))
            .member("b0", choice(0))
            .member("b1", choice(0)),
    );

    let outcome = pipeline(backend.clone(), test_config())
        .invoke(&function, email_input())
        .await
        .unwrap();
    assert_eq!(outcome.tasks[1], TaskOutput::Skipped);
    assert!(approx(outcome.score().unwrap(), 50.0));
    assert_eq!(backend.calls("b0"), 0);
    assert_eq!(backend.calls("b1"), 0);
}

#[tokio::test]
async fn dependent_task_waits_for_and_reads_prior_result() {
    let function = compile(
        json!({
            "name": "gated",
            "input_schema": email_schema(),
            "tasks": [
                {
                    "messages": [{ "role": "user", "content": "input.email" }],
                    "responses": ["formal", "casual"]
                },
                {
                    "skip": "tasks[0].scores[0] > 0.5",
                    "messages": [{ "role": "user", "content": "input.email" }],
                    "responses": ["friendly", "rude"]
                }
            ],
            "output": "tasks[0].scores[1]"
        }),
        json!({ "tasks": [ensemble("first", 1), ensemble("second", 1)] }),
    );
    assert_eq!(function.waves, vec![vec![0], vec![1]]);

    let formal = Arc::new(
        ScriptedBackend::new()
            .member("first0", choice(0))
            .member("second0", choice(1)),
    );
    let outcome = pipeline(formal.clone(), test_config())
        .invoke(&function, email_input())
        .await
        .unwrap();
    assert_eq!(outcome.tasks[1], TaskOutput::Skipped);
    assert_eq!(formal.calls("second0"), 0);

    let casual = Arc::new(
        ScriptedBackend::new()
            .member("first0", choice(1))
            .member("second0", choice(1)),
    );
    let outcome = pipeline(casual.clone(), test_config())
        .invoke(&function, email_input())
        .await
        .unwrap();
    assert!(matches!(outcome.tasks[1], TaskOutput::Single(_)));
    assert_eq!(outcome.score(), Some(1.0));
}

#[tokio::test]
async fn mapped_task_fans_out_per_item() {
    let function = compile(
        json!({
            "name": "batch",
            "input_schema": {
                "type": "object",
                "properties": {
                    "emails": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["emails"]
            },
            "tasks": [{
                "map": "input.emails",
                "messages": [{ "role": "user", "content": "join('', ['Email: ', item])" }],
                "responses": ["appropriate", "inappropriate"]
            }],
            "output": "length(tasks[0])"
        }),
        json!({ "tasks": [ensemble("m", 2)] }),
    );
    let backend = Arc::new(ScriptedBackend::new().member("m0", choice(0)).member("m1", choice(1)));

    let outcome = pipeline(backend.clone(), test_config())
        .invoke(&function, json!({ "emails": ["one", "two", "three"] }))
        .await
        .unwrap();

    let TaskOutput::Mapped(results) = &outcome.tasks[0] else {
        panic!("expected mapped results");
    };
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.scores == vec![0.5, 0.5]));
    assert_eq!(outcome.score(), Some(3.0));
    assert_eq!(backend.total_calls(), 6);

    let mut prompts = backend.prompts();
    prompts.sort();
    prompts.dedup();
    assert_eq!(prompts, vec!["Email: one", "Email: three", "Email: two"]);
}

#[tokio::test]
async fn runtime_index_past_mapped_output_is_an_error() {
    let function = compile(
        json!({
            "name": "batch",
            "input_schema": {
                "type": "object",
                "properties": { "items": { "type": "array" } },
                "required": ["items"]
            },
            "tasks": [{
                "map": "input.items",
                "messages": [{ "role": "user", "content": "'rate'" }],
                "responses": ["a", "b"]
            }],
            "output": "tasks[0][2].scores[0]"
        }),
        json!({ "tasks": [ensemble("m", 1)] }),
    );
    let backend = Arc::new(ScriptedBackend::new().member("m0", choice(0)));

    let err = pipeline(backend, test_config())
        .invoke(&function, json!({ "items": [1] }))
        .await
        .unwrap_err();
    assert!(matches!(err, InvocationError::OutputEval(_)));
}

#[tokio::test]
async fn zero_weight_member_does_not_move_the_score() {
    let function = compile(
        json!({
            "name": "weighted",
            "tasks": [{
                "messages": [{ "role": "user", "content": "'rate'" }],
                "responses": ["yes", "no"]
            }],
            "output": "tasks[0].scores[0]"
        }),
        json!({ "tasks": [{
            "members": [
                { "id": "heavy", "model": "a", "mode": "single_choice" },
                { "id": "light", "model": "b", "mode": "single_choice" },
                { "id": "muted", "model": "c", "mode": "single_choice" }
            ],
            "weights": [3.0, 1.0, 0.0]
        }] }),
    );
    let backend = Arc::new(
        ScriptedBackend::new()
            .member("heavy", choice(0))
            .member("light", choice(1))
            .member("muted", choice(1)),
    );

    let outcome = pipeline(backend, test_config())
        .invoke(&function, json!({}))
        .await
        .unwrap();
    assert!(approx(outcome.score().unwrap(), 0.75));
}

#[tokio::test]
async fn categorical_drift_is_rescaled_for_one_or_many_survivors() {
    let function = compile(
        json!({
            "name": "drift",
            "tasks": [{
                "messages": [{ "role": "user", "content": "'rate'" }],
                "responses": ["low", "mid", "high"]
            }],
            "output": "tasks[0].scores[0] + tasks[0].scores[1] + tasks[0].scores[2]"
        }),
        json!({ "tasks": [{
            "members": [
                { "id": "p0", "model": "a", "mode": "categorical_probabilities" },
                { "id": "p1", "model": "b", "mode": "categorical_probabilities" },
                { "id": "p2", "model": "c", "mode": "categorical_probabilities" }
            ],
            "weights": [1.0, 2.0, 0.5]
        }] }),
    );
    let reply = |p: [f64; 3]| Behavior::Reply(json!({ "probabilities": p }));
    let refused = || {
        Behavior::Fail(TransportError::Status {
            status: 400,
            body: "bad request".into(),
        })
    };

    let lone = Arc::new(
        ScriptedBackend::new()
            .member("p0", reply([0.5, 0.3, 0.1995]))
            .member("p1", refused())
            .member("p2", refused()),
    );
    let all = Arc::new(
        ScriptedBackend::new()
            .member("p0", reply([0.5, 0.3, 0.1995]))
            .member("p1", reply([0.1, 0.1, 0.8007]))
            .member("p2", reply([0.3333, 0.3333, 0.3333])),
    );

    for backend in [lone, all] {
        let outcome = pipeline(backend, test_config())
            .invoke(&function, json!({}))
            .await
            .unwrap();
        let TaskOutput::Single(result) = &outcome.tasks[0] else {
            panic!("expected a single task result");
        };
        let sum: f64 = result.scores.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9, "{:?}", result.scores);
        assert!((outcome.score().unwrap() - 1.0).abs() < 1e-9);
    }
}
