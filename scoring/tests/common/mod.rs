//! Shared helpers: a scripted in-process backend and function builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use scoring::backend::{Backend, BackendRequest, BackendSet};
use scoring::function::{compile_str, Format};
use scoring::{EngineConfig, ScalarFunction, TaskPipeline, TransportError};

/// What a scripted member does on each call.
#[derive(Clone)]
pub enum Behavior {
    Reply(Value),
    Fail(TransportError),
    /// Fail on the first call, then reply.
    FlakyThen(Value),
    Delay(Duration, Value),
}

/// Backend whose replies are scripted per member id.
#[derive(Default)]
pub struct ScriptedBackend {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<HashMap<String, u32>>,
    total: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member(mut self, id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(id.to_string(), behavior);
        self
    }

    pub fn calls(&self, member: &str) -> u32 {
        self.calls.lock().unwrap().get(member).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    /// Rendered content of every first message seen, in arrival order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &BackendRequest) -> Result<Value, TransportError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(request.member.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if let Some(first) = request.messages.first() {
            self.prompts.lock().unwrap().push(first.content.clone());
        }

        match self.behaviors.get(&request.member) {
            Some(Behavior::Reply(reply)) => Ok(reply.clone()),
            Some(Behavior::Fail(err)) => Err(err.clone()),
            Some(Behavior::FlakyThen(reply)) if call > 1 => Ok(reply.clone()),
            Some(Behavior::FlakyThen(_)) => Err(TransportError::Connection("reset by peer".into())),
            Some(Behavior::Delay(delay, reply)) => {
                tokio::time::sleep(*delay).await;
                Ok(reply.clone())
            }
            None => Err(TransportError::Status {
                status: 404,
                body: format!("no script for {}", request.member),
            }),
        }
    }
}

pub fn choice(index: usize) -> Behavior {
    Behavior::Reply(json!({ "choice": index }))
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        member_timeout_secs: 5,
        member_retries: 1,
        retry_backoff_ms: 10,
        invocation_timeout_secs: 60,
        max_concurrency: 8,
        renormalize_tolerance: 1e-3,
    }
}

pub fn pipeline(backend: Arc<ScriptedBackend>, config: EngineConfig) -> TaskPipeline {
    TaskPipeline::new(BackendSet::single(backend), config).expect("valid engine config")
}

pub fn email_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "email": { "type": "string" },
            "context": { "type": "string" }
        },
        "required": ["email", "context"]
    })
}

pub fn tone_responses() -> Vec<&'static str> {
    vec![
        "The tone is perfectly appropriate for this context",
        "The tone is mostly appropriate with minor issues",
        "The tone is somewhat inappropriate for this context",
        "The tone is highly inappropriate for this context",
    ]
}

/// `count` single-choice members named `prefix0..`, equal weights.
pub fn ensemble(prefix: &str, count: usize) -> Value {
    let members: Vec<Value> = (0..count)
        .map(|i| json!({ "id": format!("{prefix}{i}"), "model": "test/model", "mode": "single_choice" }))
        .collect();
    json!({ "members": members, "weights": vec![1.0; count] })
}

/// Compile a function from its `function` and `profile` sections.
pub fn compile(function: Value, profile: Value) -> Arc<ScalarFunction> {
    let file = json!({ "function": function, "profile": profile });
    compile_str(&file.to_string(), Format::Json).expect("function should compile")
}

/// The single-task email tone function with a five-member ensemble `m0..m4`.
pub fn tone_function() -> Arc<ScalarFunction> {
    compile(
        json!({
            "name": "email-tone",
            "input_schema": email_schema(),
            "tasks": [{
                "kind": "vector.completion",
                "messages": [{
                    "role": "user",
                    "content": "join('', ['Context: ', input.context, '\n\nEmail:\n', input.email])"
                }],
                "responses": tone_responses()
            }],
            "output": "tasks[0].scores[0] + 0.66 * tasks[0].scores[1] + 0.33 * tasks[0].scores[2]"
        }),
        json!({ "tasks": [ensemble("m", 5)] }),
    )
}

pub fn email_input() -> Value {
    json!({
        "email": "Hi Mike, are we still on track for Wednesday?",
        "context": "Checking in with a teammate"
    })
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
