//! Engine configuration.
//!
//! Configuration is a plain value handed to the engine, session and
//! dispatcher at construction time.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use viewforge_events::DuplicateHandlerPolicy;

pub const MAX_COMMIT_ATTEMPTS_VAR: &str = "VIEWFORGE_MAX_COMMIT_ATTEMPTS";
pub const DUPLICATE_HANDLERS_VAR: &str = "VIEWFORGE_DUPLICATE_HANDLERS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_commit_attempts must be at least 1")]
    NoCommitAttempts,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on optimistic commit attempts (first try included).
    pub max_commit_attempts: u32,

    /// Applied by the projection builders in [`crate::projections`].
    pub duplicate_handlers: DuplicateHandlerPolicy,

    /// When a projection fails on an event, drop everything it staged in the
    /// unit of work and skip its remaining events. When `false` only the
    /// failing event is skipped.
    pub stop_projection_on_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: 3,
            duplicate_handlers: DuplicateHandlerPolicy::Reject,
            stop_projection_on_failure: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `VIEWFORGE_*` environment variables.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(MAX_COMMIT_ATTEMPTS_VAR) {
            match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => config.max_commit_attempts = n,
                _ => warn!(var = MAX_COMMIT_ATTEMPTS_VAR, value = %raw, "ignoring invalid value"),
            }
        }

        if let Some(raw) = lookup(DUPLICATE_HANDLERS_VAR) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "reject" => config.duplicate_handlers = DuplicateHandlerPolicy::Reject,
                "replace" => config.duplicate_handlers = DuplicateHandlerPolicy::Replace,
                _ => warn!(var = DUPLICATE_HANDLERS_VAR, value = %raw, "ignoring invalid value"),
            }
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_commit_attempts == 0 {
            return Err(ConfigError::NoCommitAttempts);
        }
        Ok(())
    }
}
