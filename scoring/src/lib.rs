//! Ensemble inference execution and aggregation engine.
//!
//! A scalar function turns structured input into a single score by asking
//! several independently configured models to vote over a fixed set of
//! response categories, combining the votes by weight, and feeding the
//! aggregated distributions into a small output formula.
//!
//! - [`function`]: parse and compile function files (JSON / YAML / TOML)
//! - [`registry`]: load-once store of compiled functions
//! - [`pipeline`]: run a function against an input
//! - [`dispatcher`]: concurrent fan-out to ensemble members
//! - [`adapter`]: normalize heterogeneous replies into distributions
//! - [`aggregator`]: weighted average over surviving members
//! - [`expr`]: expression language for prompts, predicates and formulas
//! - [`backend`]: backend trait and the generic HTTP backend

pub mod adapter;
pub mod aggregator;
pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod expr;
pub mod function;
pub mod pipeline;
pub mod profile;
pub mod registry;
pub mod schema;

pub use adapter::{AdapterSet, OutputMode, ReplyAdapter};
pub use aggregator::{MemberVote, ScoreAggregator, TaskResult};
pub use backend::{Backend, BackendRequest, BackendSet, HttpBackend, HttpBackendConfig};
pub use config::EngineConfig;
pub use dispatcher::{DispatchOutcome, EnsembleDispatcher, Prompt};
pub use error::{
    AdapterError, AggregationError, ConfigError, FailureKind, InvocationError, MemberFailure,
    TransportError,
};
pub use function::{load, ScalarFunction};
pub use pipeline::{InvocationOutcome, TaskOutput, TaskPipeline};
pub use profile::{EnsembleMember, EnsembleProfile};
pub use registry::FunctionRegistry;
pub use schema::{InputSchema, SchemaViolation};
