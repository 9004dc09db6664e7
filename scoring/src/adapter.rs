//! Backend adapters turn one member's raw reply into a probability
//! distribution over the task's categories.
//!
//! | Mode                        | Reply shape                                         |
//! |-----------------------------|-----------------------------------------------------|
//! | `categorical_probabilities` | `{"probabilities": [p0, p1, ..]}` or keyed object   |
//! | `single_choice`             | `{"choice": 2}`, `{"choice": "C"}`, `{"choice": "<label>"}` |
//! | `ranked_logprobs`           | `{"top_logprobs": [{"token": "A", "logprob": -0.1}, ..]}` |
//!
//! Category *i* is addressed by key `A`, `B`, … (`AA`, `AB`, … past 26) as
//! well as by its label; the keys are also what the HTTP backend advertises
//! to the model.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DEFAULT_RENORMALIZE_TOLERANCE;
use crate::error::AdapterError;

/// Leading alphanumeric run after quotes, brackets and markdown emphasis.
static LEADING_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^[\s"'`(\[{*_]*([\p{L}\p{N}]+)"#).expect("LEADING_TOKEN regex should compile")
});

/// How a member's reply is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[serde(alias = "categorical-probabilities")]
    CategoricalProbabilities,
    #[serde(alias = "single-choice")]
    SingleChoice,
    #[serde(alias = "ranked-logprobs")]
    RankedLogprobs,
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CategoricalProbabilities => write!(f, "categorical_probabilities"),
            Self::SingleChoice => write!(f, "single_choice"),
            Self::RankedLogprobs => write!(f, "ranked_logprobs"),
        }
    }
}

/// Normalizes one reply into `categories.len()` scores summing to 1.
pub trait ReplyAdapter: Send + Sync {
    fn mode(&self) -> OutputMode;

    fn normalize(&self, reply: &Value, categories: &[String]) -> Result<Vec<f64>, AdapterError>;
}

/// Spreadsheet-style key for category `index`: A..Z, AA..AZ, BA..
pub fn category_key(index: usize) -> String {
    let mut n = index + 1;
    let mut key = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        key.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    key.reverse();
    String::from_utf8(key).unwrap_or_default()
}

/// Resolve a key (`"B"`) or exact label to a category index.
fn resolve_category(name: &str, categories: &[String]) -> Option<usize> {
    let trimmed = name.trim();
    categories
        .iter()
        .position(|label| label == trimmed)
        .or_else(|| (0..categories.len()).find(|&i| category_key(i) == trimmed))
}

fn rescale(mut scores: Vec<f64>) -> Result<Vec<f64>, AdapterError> {
    let sum: f64 = scores.iter().sum();
    if !(sum.is_finite() && sum > 0.0) {
        return Err(AdapterError::MalformedReply(format!(
            "scores sum to {sum}, cannot normalize"
        )));
    }
    for s in &mut scores {
        *s /= sum;
    }
    Ok(scores)
}

// ── categorical_probabilities ───────────────────────────────────────────────

/// Backend reports a probability per category natively.
#[derive(Debug, Clone)]
pub struct CategoricalAdapter {
    /// Allowed drift of the sum from 1.0 before rescaling.
    pub tolerance: f64,
}

impl Default for CategoricalAdapter {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_RENORMALIZE_TOLERANCE,
        }
    }
}

impl CategoricalAdapter {
    fn collect(&self, raw: &Value, categories: &[String]) -> Result<Vec<f64>, AdapterError> {
        match raw {
            Value::Array(items) => {
                if items.len() != categories.len() {
                    return Err(AdapterError::MalformedReply(format!(
                        "expected {} probabilities, got {}",
                        categories.len(),
                        items.len()
                    )));
                }
                items.iter().enumerate().map(|(i, v)| probability(v, i)).collect()
            }
            Value::Object(map) => {
                let mut scores = vec![None; categories.len()];
                for (name, v) in map {
                    let idx = resolve_category(name, categories).ok_or_else(|| {
                        AdapterError::MalformedReply(format!("unknown category '{name}'"))
                    })?;
                    scores[idx] = Some(probability(v, idx)?);
                }
                scores
                    .into_iter()
                    .enumerate()
                    .map(|(i, s)| {
                        s.ok_or_else(|| {
                            AdapterError::MalformedReply(format!(
                                "missing probability for category {}",
                                category_key(i)
                            ))
                        })
                    })
                    .collect()
            }
            other => Err(AdapterError::MalformedReply(format!(
                "probabilities must be an array or object, got {other}"
            ))),
        }
    }
}

fn probability(v: &Value, index: usize) -> Result<f64, AdapterError> {
    match v.as_f64() {
        Some(p) if p.is_finite() && p >= 0.0 => Ok(p),
        _ => Err(AdapterError::MalformedReply(format!(
            "probability {index} is not a non-negative number: {v}"
        ))),
    }
}

impl ReplyAdapter for CategoricalAdapter {
    fn mode(&self) -> OutputMode {
        OutputMode::CategoricalProbabilities
    }

    fn normalize(&self, reply: &Value, categories: &[String]) -> Result<Vec<f64>, AdapterError> {
        let raw = reply
            .get("probabilities")
            .ok_or_else(|| AdapterError::MalformedReply("missing 'probabilities'".to_string()))?;
        let scores = self.collect(raw, categories)?;
        let sum: f64 = scores.iter().sum();
        if (sum - 1.0).abs() > self.tolerance {
            rescale(scores)
        } else {
            Ok(scores)
        }
    }
}

// ── single_choice ───────────────────────────────────────────────────────────

/// Backend picks exactly one category.
#[derive(Debug, Clone, Default)]
pub struct SingleChoiceAdapter;

impl ReplyAdapter for SingleChoiceAdapter {
    fn mode(&self) -> OutputMode {
        OutputMode::SingleChoice
    }

    fn normalize(&self, reply: &Value, categories: &[String]) -> Result<Vec<f64>, AdapterError> {
        let choice = reply
            .get("choice")
            .ok_or_else(|| AdapterError::MalformedReply("missing 'choice'".to_string()))?;
        let index = match choice {
            Value::Number(n) => n
                .as_u64()
                .map(|i| i as usize)
                .filter(|&i| i < categories.len()),
            Value::String(name) => resolve_category(name, categories),
            _ => None,
        }
        .ok_or_else(|| AdapterError::MalformedReply(format!("choice {choice} names no category")))?;

        let mut scores = vec![0.0; categories.len()];
        scores[index] = 1.0;
        Ok(scores)
    }
}

// ── ranked_logprobs ─────────────────────────────────────────────────────────

/// Backend returns log-probabilities over leading tokens.
#[derive(Debug, Clone, Default)]
pub struct RankedLogprobsAdapter;

impl RankedLogprobsAdapter {
    /// Map a raw token onto a category by key, then by unique label prefix.
    pub fn map_token(token: &str, categories: &[String]) -> Option<usize> {
        let lead = LEADING_TOKEN.captures(token)?.get(1)?.as_str();
        if let Some(i) = (0..categories.len()).find(|&i| category_key(i) == lead) {
            return Some(i);
        }
        let lead = lead.to_lowercase();
        let mut matches = categories
            .iter()
            .enumerate()
            .filter(|(_, label)| label.to_lowercase().starts_with(&lead));
        match (matches.next(), matches.next()) {
            (Some((i, _)), None) => Some(i),
            _ => None,
        }
    }
}

impl ReplyAdapter for RankedLogprobsAdapter {
    fn mode(&self) -> OutputMode {
        OutputMode::RankedLogprobs
    }

    fn normalize(&self, reply: &Value, categories: &[String]) -> Result<Vec<f64>, AdapterError> {
        let entries = reply
            .get("top_logprobs")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                AdapterError::MalformedReply("missing 'top_logprobs' array".to_string())
            })?;

        let mut scores = vec![0.0; categories.len()];
        let mut mapped = 0usize;
        for entry in entries {
            let token = entry.get("token").and_then(Value::as_str).ok_or_else(|| {
                AdapterError::MalformedReply(format!("logprob entry without token: {entry}"))
            })?;
            let logprob = entry.get("logprob").and_then(Value::as_f64).ok_or_else(|| {
                AdapterError::MalformedReply(format!("logprob entry without logprob: {entry}"))
            })?;
            if logprob.is_nan() || logprob > 0.0 {
                return Err(AdapterError::MalformedReply(format!(
                    "logprob for '{token}' is not <= 0: {logprob}"
                )));
            }
            if let Some(i) = Self::map_token(token, categories) {
                scores[i] += logprob.exp();
                mapped += 1;
            }
        }

        if mapped == 0 {
            return Err(AdapterError::UnmappableResponse {
                tokens: entries.len(),
            });
        }
        rescale(scores).map_err(|_| AdapterError::UnmappableResponse {
            tokens: entries.len(),
        })
    }
}

// ── selection ───────────────────────────────────────────────────────────────

/// One adapter per mode, built once and selected by member configuration.
#[derive(Debug, Clone, Default)]
pub struct AdapterSet {
    categorical: CategoricalAdapter,
    single_choice: SingleChoiceAdapter,
    ranked_logprobs: RankedLogprobsAdapter,
}

impl AdapterSet {
    pub fn new(tolerance: f64) -> Self {
        Self {
            categorical: CategoricalAdapter { tolerance },
            ..Self::default()
        }
    }

    pub fn get(&self, mode: OutputMode) -> &dyn ReplyAdapter {
        match mode {
            OutputMode::CategoricalProbabilities => &self.categorical,
            OutputMode::SingleChoice => &self.single_choice,
            OutputMode::RankedLogprobs => &self.ranked_logprobs,
        }
    }
}
