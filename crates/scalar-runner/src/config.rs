//! Runner configuration: engine knobs plus named backend endpoints.
//!
//! Loaded from a TOML file when `--config` is given:
//!
//! ```toml
//! [engine]
//! member_timeout_secs = 60
//!
//! [backends.default]
//! url = "http://localhost:8080/v1/score"
//! api_key_env = "SCALAR_GATEWAY_KEY"
//! ```
//!
//! Without a file, a single `default` backend is taken from
//! `SCALAR_BACKEND_URL` (and `SCALAR_BACKEND_API_KEY` if set).

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use scoring::backend::{BackendSet, HttpBackend, HttpBackendConfig, DEFAULT_BACKEND};
use scoring::EngineConfig;

const ENV_BACKEND_URL: &str = "SCALAR_BACKEND_URL";
const ENV_BACKEND_API_KEY: &str = "SCALAR_BACKEND_API_KEY";
const DEFAULT_ENDPOINT_TIMEOUT_SECS: u64 = 120;

fn default_timeout_secs() -> u64 {
    DEFAULT_ENDPOINT_TIMEOUT_SECS
}

/// One HTTP scoring gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    /// Environment variable holding the bearer token; the token itself never
    /// lives in the file.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl EndpointConfig {
    fn api_key(&self) -> Option<String> {
        let var = self.api_key_env.as_deref()?;
        match std::env::var(var) {
            Ok(key) if !key.is_empty() => Some(key),
            _ => {
                warn!(var, "api key variable is unset; sending requests without a token");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub backends: BTreeMap<String, EndpointConfig>,
}

impl RunnerConfig {
    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).context("failed to parse runner config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runner config {}", path.display()))?;
        Self::from_toml(&source).with_context(|| format!("in {}", path.display()))
    }

    /// Config with one `default` backend at `url`, if given.
    pub fn from_backend_url(url: Option<String>) -> Self {
        let mut backends = BTreeMap::new();
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            backends.insert(
                DEFAULT_BACKEND.to_string(),
                EndpointConfig {
                    url,
                    api_key_env: Some(ENV_BACKEND_API_KEY.to_string()),
                    timeout_secs: DEFAULT_ENDPOINT_TIMEOUT_SECS,
                },
            );
        }
        Self {
            engine: EngineConfig::default(),
            backends,
        }
    }

    pub fn from_env() -> Self {
        Self::from_backend_url(std::env::var(ENV_BACKEND_URL).ok())
    }

    /// File config if a path is given, environment otherwise.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Err(e) = self.engine.validate() {
            bail!("invalid [engine] section: {e}");
        }
        for (name, endpoint) in &self.backends {
            if endpoint.url.trim().is_empty() {
                bail!("backend '{name}' has an empty url");
            }
            if endpoint.timeout_secs == 0 {
                bail!("backend '{name}' timeout_secs must be > 0");
            }
        }
        Ok(())
    }

    /// Build HTTP backends for every configured endpoint.
    pub fn build_backends(&self) -> Result<BackendSet> {
        let mut set = BackendSet::new();
        for (name, endpoint) in &self.backends {
            let mut http = HttpBackendConfig::new(&endpoint.url);
            http.timeout_secs = endpoint.timeout_secs;
            if let Some(key) = endpoint.api_key() {
                http = http.with_api_key(key);
            }
            let backend = HttpBackend::new(name.clone(), http)
                .with_context(|| format!("failed to build backend '{name}'"))?;
            debug!(backend = %name, url = %backend.url(), "configured backend");
            set.insert(name.clone(), std::sync::Arc::new(backend));
        }
        if set.is_empty() {
            bail!("no backends configured; pass --config or set {ENV_BACKEND_URL}");
        }
        info!(backends = set.len(), "backends ready");
        Ok(set)
    }
}
