//! Error taxonomy for the scoring engine.
//!
//! Errors are layered the same way failures propagate:
//!
//! | Layer        | Type               | Scope        | Policy                         |
//! |--------------|--------------------|--------------|--------------------------------|
//! | Load time    | `ConfigError`      | function     | fatal, rejected before serving |
//! | Adapter      | `AdapterError`     | one member   | excluded, never retried        |
//! | Transport    | `TransportError`   | one member   | retried (bounded), then excluded |
//! | Aggregation  | `AggregationError` | one task     | fatal to the task              |
//! | Invocation   | `InvocationError`  | one call     | surfaced to the caller         |
//!
//! Member-level failures are folded into [`MemberFailure`] records so a
//! caller diagnosing an outage sees every member and reason at once.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expr::{EvalError, ExprError};
use crate::schema::SchemaViolation;

// ── Member-level ────────────────────────────────────────────────────────────

/// A backend reply could not be turned into a category distribution.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdapterError {
    /// Wrong shape, missing fields, wrong category count, bad numbers.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// Log-probability reply where no token maps onto any category.
    #[error("no token maps to a category ({tokens} tokens inspected)")]
    UnmappableResponse { tokens: usize },
}

/// The backend could not be reached or did not answer in time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("no backend named '{0}' is configured")]
    UnknownBackend(String),
}

impl TransportError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::UnknownBackend(_) => false,
        }
    }
}

/// Anything that can go wrong for a single member call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MemberError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl MemberError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transport(TransportError::Timeout(_)) => FailureKind::Timeout,
            Self::Transport(_) => FailureKind::Transport,
            Self::Adapter(AdapterError::MalformedReply(_)) => FailureKind::MalformedReply,
            Self::Adapter(AdapterError::UnmappableResponse { .. }) => {
                FailureKind::UnmappableResponse
            }
        }
    }

    /// Only transport errors are retried; adapter errors are deterministic
    /// for a given reply.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retriable(),
            Self::Adapter(_) => false,
        }
    }
}

/// Classification of an excluded member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Member deadline expired.
    Timeout,
    /// Connection / HTTP level failure.
    Transport,
    MalformedReply,
    UnmappableResponse,
    /// Member succeeded but carries no weight, so it cannot anchor an aggregate.
    ZeroWeight,
    /// The member task panicked or was aborted.
    Aborted,
}

impl FailureKind {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Timeout | Self::Transport)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Transport => write!(f, "transport"),
            Self::MalformedReply => write!(f, "malformed_reply"),
            Self::UnmappableResponse => write!(f, "unmappable_response"),
            Self::ZeroWeight => write!(f, "zero_weight"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Record of a member excluded from aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberFailure {
    /// Member id from the profile.
    pub member: String,
    pub kind: FailureKind,
    /// Human-readable reason from the last attempt.
    pub reason: String,
    /// Attempts made, including retries.
    pub attempts: u32,
}

impl MemberFailure {
    pub fn new(member: impl Into<String>, error: &MemberError, attempts: u32) -> Self {
        Self {
            member: member.into(),
            kind: error.kind(),
            reason: error.to_string(),
            attempts,
        }
    }
}

impl fmt::Display for MemberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] after {} attempt(s): {}",
            self.member, self.kind, self.attempts, self.reason
        )
    }
}

// ── Task-level ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    /// No member produced a usable distribution.
    #[error("ensemble exhausted: {} member(s) failed", .failures.len())]
    EnsembleExhausted { failures: Vec<MemberFailure> },
}

pub type AggregationResult<T> = Result<T, AggregationError>;

// ── Load-time ───────────────────────────────────────────────────────────────

/// Rejections raised while loading and compiling a function definition.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {format} function definition: {message}")]
    Parse {
        format: &'static str,
        message: String,
    },

    #[error("unsupported function file format: {0}")]
    UnsupportedFormat(String),

    #[error("function defines no tasks")]
    NoTasks,

    #[error("function has {tasks} task(s) but the profile covers {profiles}")]
    ProfileCountMismatch { tasks: usize, profiles: usize },

    #[error("task {task}: responses list is empty")]
    EmptyResponses { task: usize },

    #[error("task {task}: no messages to render")]
    NoMessages { task: usize },

    #[error("task {task}: ensemble has no members")]
    EmptyEnsemble { task: usize },

    #[error("task {task}: {members} member(s) but {weights} weight(s)")]
    WeightCountMismatch {
        task: usize,
        members: usize,
        weights: usize,
    },

    #[error("task {task}: member '{member}' has invalid weight {weight}")]
    InvalidWeight {
        task: usize,
        member: String,
        weight: f64,
    },

    #[error("task {task}: duplicate member id '{member}'")]
    DuplicateMember { task: usize, member: String },

    #[error("{location}: {source}")]
    Expression {
        location: String,
        #[source]
        source: ExprError,
    },

    #[error("invalid input schema: {0}")]
    Schema(String),

    #[error("invalid engine configuration: {0}")]
    Engine(String),

    #[error("function '{0}' is already registered")]
    DuplicateFunction(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ── Invocation-level ────────────────────────────────────────────────────────

/// Failures surfaced to the caller of one invocation.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("input rejected: {0}")]
    SchemaViolation(#[from] SchemaViolation),

    #[error("task {task}: ensemble exhausted, {} member(s) failed", .failures.len())]
    EnsembleExhausted {
        task: usize,
        failures: Vec<MemberFailure>,
    },

    #[error("invocation exceeded its {0:?} deadline")]
    InvocationTimeout(Duration),

    #[error("task {task}: {source}")]
    TaskEval {
        task: usize,
        #[source]
        source: EvalError,
    },

    #[error("output formula: {0}")]
    OutputEval(#[source] EvalError),

    #[error("invocation cancelled")]
    Cancelled,
}

impl InvocationError {
    /// Per-member failures carried by the error, if any.
    pub fn failures(&self) -> &[MemberFailure] {
        match self {
            Self::EnsembleExhausted { failures, .. } => failures,
            _ => &[],
        }
    }
}

pub type InvocationResult<T> = Result<T, InvocationError>;
