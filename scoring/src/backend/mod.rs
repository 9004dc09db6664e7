//! Inference backends.
//!
//! A [`Backend`] takes a rendered request for one ensemble member and returns
//! the raw JSON reply; interpreting that reply is the adapter's job. The
//! engine resolves members to backends through a [`BackendSet`] keyed by the
//! member's `backend` name, so one HTTP gateway can serve every model or each
//! member can point at its own endpoint.

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::OutputMode;
use crate::error::TransportError;

pub use http::{HttpBackend, HttpBackendConfig};

/// Name used by members that don't specify a backend.
pub const DEFAULT_BACKEND: &str = "default";

/// Chat role of a rendered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One rendered chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// A category offered to the model, with the key adapters map replies onto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseOption {
    pub key: String,
    pub label: String,
}

/// Everything a backend needs to produce one member's vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRequest {
    /// Member id from the profile.
    pub member: String,
    pub model: String,
    pub mode: OutputMode,
    pub messages: Vec<Message>,
    pub responses: Vec<ResponseOption>,
    /// Free-form per-member options passed through untouched.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

/// Trait for inference backends.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Send one request and return the raw reply body.
    async fn complete(&self, request: &BackendRequest) -> Result<Value, TransportError>;
}

/// Named backends available to the dispatcher.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set where every member resolves to `backend`.
    pub fn single(backend: Arc<dyn Backend>) -> Self {
        Self::new().with(DEFAULT_BACKEND, backend)
    }

    pub fn with(mut self, name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        self.insert(name, backend);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, backend: Arc<dyn Backend>) {
        self.backends.insert(name.into(), backend);
    }

    /// Resolve a member's backend name (`None` means the default backend).
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn Backend>, TransportError> {
        let name = name.unwrap_or(DEFAULT_BACKEND);
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::UnknownBackend(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("BackendSet").field("backends", &names).finish()
    }
}
