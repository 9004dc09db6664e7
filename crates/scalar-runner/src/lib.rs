//! Command implementations for the `scalar-runner` binary.
//!
//! Kept in the library so tests can drive them with in-process backends.

pub mod config;

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use scoring::adapter::category_key;
use scoring::error::MemberFailure;
use scoring::{InvocationError, ScalarFunction, TaskPipeline};

use crate::config::RunnerConfig;

/// Summary printed by `validate`.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionSummary {
    pub name: String,
    pub fingerprint: String,
    pub tasks: usize,
    pub members: usize,
    pub waves: usize,
    /// Backends referenced by members but not configured.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_backends: Vec<String>,
}

impl FunctionSummary {
    pub fn new(function: &ScalarFunction, pipeline: Option<&TaskPipeline>) -> Self {
        Self {
            name: function.name.clone(),
            fingerprint: function.fingerprint.clone(),
            tasks: function.tasks.len(),
            members: function.tasks.iter().map(|t| t.profile.members().len()).sum(),
            waves: function.waves.len(),
            missing_backends: pipeline
                .map(|p| p.missing_backends(function))
                .unwrap_or_default(),
        }
    }
}

/// One line of `score` output.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ScoreRecord {
    Scored {
        index: usize,
        id: String,
        output: Value,
        degraded: bool,
        elapsed_ms: u64,
    },
    Failed {
        index: usize,
        error: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        failures: Vec<MemberFailure>,
    },
}

impl ScoreRecord {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    fn from_result(
        index: usize,
        result: Result<scoring::InvocationOutcome, InvocationError>,
    ) -> Self {
        match result {
            Ok(outcome) => Self::Scored {
                index,
                id: outcome.id.to_string(),
                degraded: outcome.is_degraded(),
                elapsed_ms: outcome.elapsed_ms,
                output: outcome.output,
            },
            Err(e) => Self::Failed {
                index,
                failures: e.failures().to_vec(),
                error: e.to_string(),
            },
        }
    }
}

/// Pipeline used by `validate` to report unconfigured backends.
///
/// An explicit config file must load and build. Without one, backends are
/// optional and `None` is returned when the environment names none.
pub fn validation_pipeline(config: Option<&Path>) -> Result<Option<TaskPipeline>> {
    let config = match config {
        Some(path) => RunnerConfig::resolve(Some(path))?,
        None => {
            let config = RunnerConfig::resolve(None)?;
            if config.backends.is_empty() {
                return Ok(None);
            }
            config
        }
    };
    let pipeline = TaskPipeline::new(config.build_backends()?, config.engine.clone())?;
    Ok(Some(pipeline))
}

/// Read inputs: a JSON array, a single JSON object, or JSON lines.
pub fn read_inputs(path: &Path) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read inputs {}", path.display()))?;
    parse_inputs(&text).with_context(|| format!("in {}", path.display()))
}

pub fn parse_inputs(text: &str) -> Result<Vec<Value>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        bail!("no inputs");
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(match value {
            Value::Array(items) => items,
            other => vec![other],
        });
    }
    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}: invalid JSON", n + 1))
        })
        .collect()
}

/// Score every input in order; failures are recorded, not fatal.
pub async fn score_inputs(
    pipeline: &TaskPipeline,
    function: &ScalarFunction,
    inputs: Vec<Value>,
) -> Vec<ScoreRecord> {
    let mut records = Vec::with_capacity(inputs.len());
    for (index, input) in inputs.into_iter().enumerate() {
        let record = ScoreRecord::from_result(index, pipeline.invoke(function, input).await);
        if let ScoreRecord::Failed { error, .. } = &record {
            warn!(index, error = %error, "input failed");
        }
        records.push(record);
    }
    info!(
        inputs = records.len(),
        failed = records.iter().filter(|r| r.is_failed()).count(),
        "scoring complete"
    );
    records
}

/// Human-readable description of a compiled function.
pub fn describe(function: &ScalarFunction) -> String {
    let mut out = String::new();
    out.push_str(&format!("function {}\n", function.name));
    if let Some(description) = &function.description {
        out.push_str(&format!("  {description}\n"));
    }
    out.push_str(&format!("  fingerprint {}\n", function.fingerprint));
    for task in &function.tasks {
        out.push_str(&format!(
            "task {} ({:?}) total_weight={}\n",
            task.index,
            task.kind,
            task.profile.total_weight()
        ));
        if let Some(skip) = &task.skip {
            out.push_str(&format!("  skip: {skip}\n"));
        }
        if let Some(map) = &task.map {
            out.push_str(&format!("  map: {map}\n"));
        }
        for message in &task.messages {
            out.push_str(&format!("  {:?}: {}\n", message.role, message.content));
        }
        for (i, response) in task.responses.iter().enumerate() {
            out.push_str(&format!("  [{}] {response}\n", category_key(i)));
        }
        for member in task.profile.members() {
            out.push_str(&format!(
                "  member {} model={} mode={} weight={} backend={}\n",
                member.id,
                member.model,
                member.mode,
                member.weight,
                member.backend.as_deref().unwrap_or(scoring::backend::DEFAULT_BACKEND),
            ));
        }
    }
    let waves: Vec<String> = function.waves.iter().map(|w| format!("{w:?}")).collect();
    out.push_str(&format!("waves {}\n", waves.join(" -> ")));
    out.push_str(&format!("output {}\n", function.output));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_array_object_and_lines() {
        assert_eq!(parse_inputs(r#"[{"a":1},{"a":2}]"#).unwrap().len(), 2);
        assert_eq!(parse_inputs(r#"{"a":1}"#).unwrap().len(), 1);
        assert_eq!(parse_inputs("{\"a\":1}\n\n{\"a\":2}\n{\"a\":3}\n").unwrap().len(), 3);
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(parse_inputs("   ").is_err());
        let err = parse_inputs("{\"a\":1}\nnot json\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }
}
