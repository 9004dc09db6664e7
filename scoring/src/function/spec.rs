//! Serialized form of a function definition and its ensemble profile.
//!
//! A function file has two top-level sections:
//!
//! ```yaml
//! function:
//!   name: email-tone
//!   input_schema: { type: object, properties: {..}, required: [..] }
//!   tasks:
//!     - kind: ensemble_classification
//!       messages:
//!         - role: user
//!           content: "join('', ['Context: ', input.context])"
//!       responses: ["..", ".."]
//!   output: "tasks[0].scores[0] + 0.66 * tasks[0].scores[1]"
//! profile:
//!   tasks:
//!     - members:
//!         - { id: nano, model: openai/gpt-4.1-nano, mode: categorical_probabilities }
//!       weights: [1.0]
//! ```
//!
//! Message contents, `skip`, `map` and `output` are expression sources.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::OutputMode;
use crate::backend::Role;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionFile {
    pub function: FunctionDef,
    pub profile: ProfileDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON-schema subset; `null` accepts any input.
    #[serde(default)]
    pub input_schema: Value,
    pub tasks: Vec<TaskDef>,
    /// Output formula source.
    pub output: String,
}

/// Kind of task. Only ensemble classification exists today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    #[serde(alias = "vector.completion")]
    EnsembleClassification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    #[serde(default)]
    pub kind: TaskKind,
    pub messages: Vec<MessageDef>,
    /// Predicate; when true the task is omitted from the results.
    #[serde(default)]
    pub skip: Option<String>,
    /// Array-valued expression; the task runs once per element.
    #[serde(default)]
    pub map: Option<String>,
    /// Ordered categories. Order defines score indices.
    pub responses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDef {
    pub role: Role,
    /// Expression producing the message text.
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDef {
    #[serde(default)]
    pub description: Option<String>,
    /// One entry per function task, in task order.
    pub tasks: Vec<EnsembleDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleDef {
    pub members: Vec<MemberDef>,
    /// Parallel to `members`.
    pub weights: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberDef {
    /// Defaults to the model name.
    #[serde(default)]
    pub id: Option<String>,
    pub model: String,
    pub mode: OutputMode,
    /// Backend name; `None` selects the default backend.
    #[serde(default)]
    pub backend: Option<String>,
    /// Passed through to the backend untouched.
    #[serde(default)]
    pub options: Value,
}
