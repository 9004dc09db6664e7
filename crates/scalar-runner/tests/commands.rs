//! Runner commands driven against the shipped demo and an in-process backend.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use scalar_runner::config::RunnerConfig;
use scalar_runner::{
    describe, read_inputs, score_inputs, validation_pipeline, FunctionSummary, ScoreRecord,
};
use scoring::backend::{Backend, BackendRequest, BackendSet};
use scoring::{EngineConfig, OutputMode, TaskPipeline, TransportError};

fn demos() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos")
}

/// Answers "A" in whatever shape the member's mode expects, and refuses
/// any input whose email mentions "outage".
struct Gateway;

#[async_trait]
impl Backend for Gateway {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn complete(&self, request: &BackendRequest) -> Result<Value, TransportError> {
        let prompt = request
            .messages
            .first()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        if prompt.contains("outage") {
            return Err(TransportError::Status {
                status: 400,
                body: "rejected".into(),
            });
        }
        Ok(match request.mode {
            OutputMode::RankedLogprobs => json!({
                "top_logprobs": [{ "token": "A", "logprob": 0.0 }]
            }),
            _ => json!({ "choice": "A" }),
        })
    }
}

fn pipeline() -> TaskPipeline {
    let mut config = EngineConfig::default();
    config.member_retries = 0;
    TaskPipeline::new(BackendSet::single(Arc::new(Gateway)), config).unwrap()
}

#[test]
fn demo_runner_config_parses() {
    let config = RunnerConfig::load(&demos().join("runner.toml")).unwrap();
    config.validate().unwrap();
    let default = &config.backends["default"];
    assert_eq!(default.api_key_env.as_deref(), Some("SCALAR_GATEWAY_KEY"));
}

fn write_toml(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

#[test]
fn validate_uses_an_explicit_config() {
    let pipeline = validation_pipeline(Some(&demos().join("runner.toml"))).unwrap();
    let function = scoring::load(&demos().join("functions/email_tone.yaml")).unwrap();
    assert!(pipeline.unwrap().missing_backends(&function).is_empty());
}

#[test]
fn validate_reports_a_broken_config() {
    assert!(validation_pipeline(Some(&demos().join("no-such-runner.toml"))).is_err());

    let unparsable = write_toml("[backends.default\nurl = 1\n");
    assert!(validation_pipeline(Some(unparsable.path())).is_err());

    let invalid = write_toml(
        "[engine]\nmax_concurrency = 0\n\n[backends.default]\nurl = \"http://gw/score\"\n",
    );
    let err = validation_pipeline(Some(invalid.path())).unwrap_err();
    assert!(format!("{err:#}").contains("max_concurrency"), "{err:#}");
}

#[test]
fn reads_demo_inputs_and_json_lines() {
    let inputs = read_inputs(&demos().join("inputs/email_tone.json")).unwrap();
    assert_eq!(inputs.len(), 10);

    let mut file = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
    writeln!(file, r#"{{"email": "a", "context": "b"}}"#).unwrap();
    writeln!(file, r#"{{"email": "c", "context": "d"}}"#).unwrap();
    assert_eq!(read_inputs(file.path()).unwrap().len(), 2);
}

#[test]
fn summary_and_description() {
    let function = scoring::load(&demos().join("functions/email_tone.yaml")).unwrap();
    let summary = FunctionSummary::new(&function, Some(&pipeline()));
    assert_eq!(summary.tasks, 1);
    assert_eq!(summary.members, 5);
    assert_eq!(summary.waves, 1);
    assert!(summary.missing_backends.is_empty());

    let text = describe(&function);
    assert!(text.starts_with("function email-tone\n"));
    assert!(text.contains("member gpt-4o-mini"));
    assert!(text.contains("total_weight=5"));
    assert!(text.contains("waves [0]"));
}

#[tokio::test]
async fn scores_each_input_and_records_failures() {
    let function = scoring::load(&demos().join("functions/email_tone.yaml")).unwrap();
    let inputs = vec![
        json!({ "email": "Thanks, see you Monday.", "context": "Replying to a colleague" }),
        json!({ "email": "The outage is your fault.", "context": "Incident review" }),
        json!({ "email": 7, "context": "Wrong type" }),
    ];

    let records = score_inputs(&pipeline(), &function, inputs).await;
    assert_eq!(records.len(), 3);

    match &records[0] {
        ScoreRecord::Scored { index, output, degraded, .. } => {
            assert_eq!(*index, 0);
            assert_eq!(output.as_f64(), Some(1.0));
            assert!(!degraded);
        }
        other => panic!("expected a score, got {other:?}"),
    }
    match &records[1] {
        ScoreRecord::Failed { failures, .. } => assert_eq!(failures.len(), 5),
        other => panic!("expected exhaustion, got {other:?}"),
    }
    match &records[2] {
        ScoreRecord::Failed { error, failures, .. } => {
            assert!(error.contains("input.email"), "{error}");
            assert!(failures.is_empty());
        }
        other => panic!("expected a schema failure, got {other:?}"),
    }

    let line = serde_json::to_value(&records[0]).unwrap();
    assert_eq!(line["index"], 0);
    assert!(line.get("error").is_none());
}
