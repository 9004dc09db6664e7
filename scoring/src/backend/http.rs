//! Generic HTTP backend.
//!
//! Posts the [`BackendRequest`] as JSON to a scoring gateway and hands the
//! reply body back untouched. Provider-specific wire formats live behind the
//! gateway; this side only knows about status codes and JSON.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Backend, BackendRequest};
use crate::error::TransportError;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;

fn default_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

/// Endpoint configuration for one HTTP backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    /// Full URL requests are posted to.
    pub url: String,
    /// Bearer token, if the gateway wants one.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Client-side ceiling; the dispatcher's per-member deadline usually fires first.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl HttpBackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

pub struct HttpBackend {
    name: String,
    config: HttpBackendConfig,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(name: impl Into<String>, config: HttpBackendConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TransportError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            config,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &BackendRequest) -> Result<Value, TransportError> {
        let start = Instant::now();
        let mut builder = self.client.post(&self.config.url).json(request);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(start.elapsed())
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Connection(format!("failed to read body: {e}")))?;

        debug!(
            backend = %self.name,
            member = %request.member,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "backend replied"
        );

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        // A non-JSON body is a reply problem, not a transport one; let the
        // adapter reject it.
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}
