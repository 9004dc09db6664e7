//! Runtime knobs for dispatch and aggregation.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Values set explicitly (struct literal, or a key present in a
//!    deserialized `[engine]` table)
//! 2. Environment variables (e.g. `SCORING_MEMBER_TIMEOUT_SECS`), read only
//!    by `Default` and so only for fields left unset
//! 3. Built-in defaults
//!
//! The function definition itself is static data and lives in
//! [`crate::function`]; nothing here changes scoring semantics, only how
//! long and how hard the engine tries.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-member deadline for a single attempt.
const DEFAULT_MEMBER_TIMEOUT_SECS: u64 = 60;
/// Extra attempts after a transport failure.
const DEFAULT_MEMBER_RETRIES: u32 = 1;
/// Pause between attempts, multiplied by the attempt number.
const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;
/// Overall deadline for one invocation.
const DEFAULT_INVOCATION_TIMEOUT_SECS: u64 = 180;
/// Upper bound on in-flight member calls per dispatch.
const DEFAULT_MAX_CONCURRENCY: usize = 16;
/// Allowed drift from 1.0 before a categorical reply is rescaled.
pub const DEFAULT_RENORMALIZE_TOLERANCE: f64 = 1e-3;

const ENV_MEMBER_TIMEOUT: &str = "SCORING_MEMBER_TIMEOUT_SECS";
const ENV_MEMBER_RETRIES: &str = "SCORING_MEMBER_RETRIES";
const ENV_RETRY_BACKOFF: &str = "SCORING_RETRY_BACKOFF_MS";
const ENV_INVOCATION_TIMEOUT: &str = "SCORING_INVOCATION_TIMEOUT_SECS";
const ENV_MAX_CONCURRENCY: &str = "SCORING_MAX_CONCURRENCY";
const ENV_RENORMALIZE_TOLERANCE: &str = "SCORING_RENORMALIZE_TOLERANCE";

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable override");
            default
        }),
        Err(_) => default,
    }
}

/// Engine configuration shared by every invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub member_timeout_secs: u64,
    pub member_retries: u32,
    pub retry_backoff_ms: u64,
    pub invocation_timeout_secs: u64,
    pub max_concurrency: usize,
    pub renormalize_tolerance: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            member_timeout_secs: env_or(ENV_MEMBER_TIMEOUT, DEFAULT_MEMBER_TIMEOUT_SECS),
            member_retries: env_or(ENV_MEMBER_RETRIES, DEFAULT_MEMBER_RETRIES),
            retry_backoff_ms: env_or(ENV_RETRY_BACKOFF, DEFAULT_RETRY_BACKOFF_MS),
            invocation_timeout_secs: env_or(
                ENV_INVOCATION_TIMEOUT,
                DEFAULT_INVOCATION_TIMEOUT_SECS,
            ),
            max_concurrency: env_or(ENV_MAX_CONCURRENCY, DEFAULT_MAX_CONCURRENCY),
            renormalize_tolerance: env_or(
                ENV_RENORMALIZE_TOLERANCE,
                DEFAULT_RENORMALIZE_TOLERANCE,
            ),
        }
    }
}

impl EngineConfig {
    pub fn member_timeout(&self) -> Duration {
        Duration::from_secs(self.member_timeout_secs)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    /// Backoff before attempt number `attempt` (1-based retry count).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// Total attempts allowed for one member, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.member_retries.saturating_add(1)
    }

    /// Validate the config; return an error string if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.member_timeout_secs == 0 {
            return Err("member_timeout_secs must be > 0".to_string());
        }
        if self.invocation_timeout_secs == 0 {
            return Err("invocation_timeout_secs must be > 0".to_string());
        }
        if self.max_concurrency == 0 {
            return Err("max_concurrency must be > 0".to_string());
        }
        if !(self.renormalize_tolerance.is_finite() && self.renormalize_tolerance >= 0.0) {
            return Err(format!(
                "renormalize_tolerance must be finite and >= 0, got {}",
                self.renormalize_tolerance
            ));
        }
        Ok(())
    }
}
