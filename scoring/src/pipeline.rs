//! Task pipeline. Runs one invocation of a compiled function.
//!
//! ```text
//! input ─schema─▶ wave 0 ─▶ wave 1 ─▶ … ─▶ output formula ─▶ scalar
//!                  │
//!                  └─ per task: skip? ─▶ map? ─▶ render ─▶ dispatch ─▶ aggregate
//! ```
//!
//! Tasks inside a wave run concurrently; a wave starts once every task of
//! the previous wave settled. Mapped tasks fan out once per element. The
//! whole invocation runs under one deadline; when it fires, the dispatch
//! futures are dropped and their JoinSets abort the in-flight calls.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregator::{ScoreAggregator, TaskResult};
use crate::backend::{BackendSet, Message};
use crate::config::EngineConfig;
use crate::dispatcher::{EnsembleDispatcher, Prompt};
use crate::error::{AggregationError, ConfigError, ConfigResult, InvocationError, InvocationResult};
use crate::expr::eval::type_name;
use crate::expr::{EvalError, Scope};
use crate::function::{CompiledTask, ScalarFunction};

/// What one task contributed to an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum TaskOutput {
    /// `skip` evaluated to true; absent from the `tasks` array.
    Skipped,
    Single(TaskResult),
    /// One result per element of the `map` array, in order.
    Mapped(Vec<TaskResult>),
}

impl TaskOutput {
    /// Entry in the `tasks` array seen by expressions, `None` if skipped.
    pub fn expr_value(&self) -> Option<Value> {
        match self {
            Self::Skipped => None,
            Self::Single(result) => Some(result.expr_value()),
            Self::Mapped(results) => Some(Value::Array(
                results.iter().map(TaskResult::expr_value).collect(),
            )),
        }
    }

    pub fn is_degraded(&self) -> bool {
        match self {
            Self::Skipped => false,
            Self::Single(result) => result.is_degraded(),
            Self::Mapped(results) => results.iter().any(TaskResult::is_degraded),
        }
    }
}

/// Successful result of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationOutcome {
    pub id: Uuid,
    pub function: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Value of the output formula.
    pub output: Value,
    /// One entry per function task, in definition order.
    pub tasks: Vec<TaskOutput>,
}

impl InvocationOutcome {
    /// Some member was excluded somewhere in the invocation.
    pub fn is_degraded(&self) -> bool {
        self.tasks.iter().any(TaskOutput::is_degraded)
    }

    /// The output as a number, if the formula produced one.
    pub fn score(&self) -> Option<f64> {
        self.output.as_f64()
    }
}

/// Executes compiled functions against inputs.
///
/// Holds only shared, immutable state; every invocation builds its own
/// dispatcher and owns its results.
#[derive(Debug, Clone)]
pub struct TaskPipeline {
    backends: Arc<BackendSet>,
    config: EngineConfig,
    aggregator: ScoreAggregator,
}

impl TaskPipeline {
    pub fn new(backends: BackendSet, config: EngineConfig) -> ConfigResult<Self> {
        config.validate().map_err(ConfigError::Engine)?;
        Ok(Self {
            backends: Arc::new(backends),
            config,
            aggregator: ScoreAggregator::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Backend names referenced by `function` that are not configured.
    pub fn missing_backends(&self, function: &ScalarFunction) -> Vec<String> {
        let mut missing: Vec<String> = function
            .tasks
            .iter()
            .flat_map(|t| t.profile.members())
            .filter(|m| self.backends.resolve(m.backend.as_deref()).is_err())
            .map(|m| {
                m.backend
                    .clone()
                    .unwrap_or_else(|| crate::backend::DEFAULT_BACKEND.to_string())
            })
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    pub async fn invoke(
        &self,
        function: &ScalarFunction,
        input: Value,
    ) -> InvocationResult<InvocationOutcome> {
        self.invoke_with_cancel(function, input, CancellationToken::new())
            .await
    }

    /// Run one invocation; cancelling `cancel` aborts it with `Cancelled`.
    pub async fn invoke_with_cancel(
        &self,
        function: &ScalarFunction,
        input: Value,
        cancel: CancellationToken,
    ) -> InvocationResult<InvocationOutcome> {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("invocation", invocation = %id, function = %function.name);

        async move {
            let start = Instant::now();
            function.schema.validate(&input)?;
            info!(tasks = function.tasks.len(), waves = function.waves.len(), "invocation started");

            let deadline = self.config.invocation_timeout();
            let token = cancel.child_token();
            let run = self.run(function, &input, &token);
            let (output, tasks) = match tokio::time::timeout(deadline, run).await {
                Ok(result) => result?,
                Err(_) => {
                    token.cancel();
                    warn!(deadline_secs = deadline.as_secs(), "invocation deadline exceeded");
                    return Err(InvocationError::InvocationTimeout(deadline));
                }
            };

            let outcome = InvocationOutcome {
                id,
                function: function.name.clone(),
                started_at,
                elapsed_ms: start.elapsed().as_millis() as u64,
                output,
                tasks,
            };
            info!(
                output = %outcome.output,
                degraded = outcome.is_degraded(),
                elapsed_ms = outcome.elapsed_ms,
                "invocation finished"
            );
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        function: &ScalarFunction,
        input: &Value,
        cancel: &CancellationToken,
    ) -> InvocationResult<(Value, Vec<TaskOutput>)> {
        let dispatcher = EnsembleDispatcher::new(Arc::clone(&self.backends), &self.config);
        let mut outputs: Vec<Option<TaskOutput>> = vec![None; function.tasks.len()];

        for (wave_no, wave) in function.waves.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(InvocationError::Cancelled);
            }
            debug!(wave = wave_no, tasks = ?wave, "starting wave");

            let runs = wave.iter().map(|&i| {
                let task = &function.tasks[i];
                let view = tasks_view(&outputs[..task.upstream]);
                self.run_task(task, input, view, &dispatcher, cancel)
            });
            let settled = try_join_all(runs).await?;
            for (&i, output) in wave.iter().zip(settled) {
                outputs[i] = Some(output);
            }
        }

        let tasks: Vec<TaskOutput> = outputs
            .into_iter()
            .map(|o| o.unwrap_or(TaskOutput::Skipped))
            .collect();
        let view = tasks_view_settled(&tasks);
        let output = function
            .output
            .evaluate(&Scope::new(input, &view))
            .map_err(InvocationError::OutputEval)?;
        Ok((output, tasks))
    }

    async fn run_task(
        &self,
        task: &CompiledTask,
        input: &Value,
        view: Value,
        dispatcher: &EnsembleDispatcher,
        cancel: &CancellationToken,
    ) -> InvocationResult<TaskOutput> {
        let scope = Scope::new(input, &view);
        let eval_err = |source| InvocationError::TaskEval {
            task: task.index,
            source,
        };

        if let Some(skip) = &task.skip {
            let verdict = skip.evaluate(&scope).map_err(eval_err)?;
            match verdict {
                Value::Bool(true) => {
                    info!(task = task.index, "task skipped");
                    return Ok(TaskOutput::Skipped);
                }
                Value::Bool(false) => {}
                other => return Err(eval_err(mismatch("skip", "boolean", &other))),
            }
        }

        let Some(map) = &task.map else {
            let prompt = render(task, &scope).map_err(eval_err)?;
            let result = self.dispatch_and_aggregate(task, prompt, dispatcher, cancel).await?;
            return Ok(TaskOutput::Single(result));
        };

        let items = match map.evaluate(&scope).map_err(eval_err)? {
            Value::Array(items) => items,
            other => return Err(eval_err(mismatch("map", "array", &other))),
        };
        debug!(task = task.index, items = items.len(), "mapped task fan-out");
        let prompts = items
            .iter()
            .map(|item| render(task, &scope.with_item(item)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(eval_err)?;
        let results = try_join_all(
            prompts
                .into_iter()
                .map(|prompt| self.dispatch_and_aggregate(task, prompt, dispatcher, cancel)),
        )
        .await?;
        Ok(TaskOutput::Mapped(results))
    }

    async fn dispatch_and_aggregate(
        &self,
        task: &CompiledTask,
        prompt: Prompt,
        dispatcher: &EnsembleDispatcher,
        cancel: &CancellationToken,
    ) -> InvocationResult<TaskResult> {
        let outcome = dispatcher
            .dispatch(task.index, &task.profile, Arc::new(prompt), cancel)
            .await
            .map_err(|_| InvocationError::Cancelled)?;

        let result = self
            .aggregator
            .aggregate(task.responses.len(), &outcome.votes, outcome.failures)
            .map_err(|AggregationError::EnsembleExhausted { failures }| {
                warn!(task = task.index, failed = failures.len(), "ensemble exhausted");
                InvocationError::EnsembleExhausted {
                    task: task.index,
                    failures,
                }
            })?;

        info!(
            task = task.index,
            scores = ?result.scores,
            contributing = result.members.len(),
            degraded = result.is_degraded(),
            "task aggregated"
        );
        Ok(result)
    }
}

fn render(task: &CompiledTask, scope: &Scope<'_>) -> Result<Prompt, EvalError> {
    let messages = task
        .messages
        .iter()
        .map(|message| match message.content.evaluate(scope)? {
            Value::String(content) => Ok(Message {
                role: message.role,
                content,
            }),
            other => Err(mismatch("message content", "string", &other)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Prompt::new(messages, task.responses.clone()))
}

fn mismatch(operation: &str, expected: &'static str, found: &Value) -> EvalError {
    EvalError::TypeMismatch {
        operation: operation.to_string(),
        expected,
        found: type_name(found),
    }
}

/// The `tasks` array over settled outputs; skipped tasks are omitted.
fn tasks_view(outputs: &[Option<TaskOutput>]) -> Value {
    Value::Array(
        outputs
            .iter()
            .flatten()
            .filter_map(TaskOutput::expr_value)
            .collect(),
    )
}

fn tasks_view_settled(outputs: &[TaskOutput]) -> Value {
    Value::Array(outputs.iter().filter_map(TaskOutput::expr_value).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(scores: &[f64]) -> TaskResult {
        TaskResult {
            scores: scores.to_vec(),
            members: vec!["m".into()],
            failures: Vec::new(),
        }
    }

    #[test]
    fn skipped_tasks_are_omitted_from_view() {
        let outputs = vec![
            Some(TaskOutput::Single(result(&[1.0, 0.0]))),
            Some(TaskOutput::Skipped),
            Some(TaskOutput::Mapped(vec![result(&[0.5, 0.5])])),
        ];
        assert_eq!(
            tasks_view(&outputs),
            json!([{ "scores": [1.0, 0.0] }, [{ "scores": [0.5, 0.5] }]])
        );
    }

    #[test]
    fn task_output_serializes_with_status() {
        let json = serde_json::to_value(TaskOutput::Skipped).unwrap();
        assert_eq!(json, json!({ "status": "skipped" }));
        let json = serde_json::to_value(TaskOutput::Single(result(&[1.0]))).unwrap();
        assert_eq!(json["status"], "single");
        assert_eq!(json["result"]["scores"], json!([1.0]));
    }

    #[test]
    fn invalid_engine_config_rejected() {
        let config = EngineConfig {
            max_concurrency: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            TaskPipeline::new(BackendSet::new(), config),
            Err(ConfigError::Engine(_))
        ));
    }
}
