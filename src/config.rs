use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::retry::{Backoff, RetryPolicy};

pub const MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_TASKS: usize = 64;
pub const UPLOAD_TIMEOUT_MS: u64 = 120_000;
pub const ANALYSIS_ATTEMPT_TIMEOUT_MS: u64 = 60_000;
pub const READ_ATTEMPT_TIMEOUT_MS: u64 = 15_000;
pub const SUCCESS_TTL_MS: u64 = 3_000;
pub const MAX_ANALYSIS_ATTEMPTS: u32 = 5;
pub const MAX_READ_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// What the notifier does when a task ends in `Error`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSurfacing {
    /// Hide the progress surface and log; another channel reports the failure.
    #[default]
    LogOnly,
    /// Also raise an error notification.
    Notify,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_tasks: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_tasks: DEFAULT_MAX_TASKS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_file_bytes: u64,
    pub allowed_content_types: Vec<String>,
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: MAX_IMAGE_BYTES,
            allowed_content_types: vec![
                "image/jpeg".into(),
                "image/png".into(),
                "image/webp".into(),
            ],
            timeout_ms: UPLOAD_TIMEOUT_MS,
            retry: RetryPolicy::new(
                3,
                Backoff::Exponential {
                    base_ms: 1_000,
                    max_ms: 10_000,
                    jitter_ms: 250,
                },
            ),
        }
    }
}

impl UploadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub attempt_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: ANALYSIS_ATTEMPT_TIMEOUT_MS,
            retry: RetryPolicy::new(
                MAX_ANALYSIS_ATTEMPTS,
                Backoff::Exponential {
                    base_ms: 1_000,
                    max_ms: 30_000,
                    jitter_ms: 250,
                },
            ),
        }
    }
}

impl AnalysisConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub success_ttl_ms: u64,
    pub success_notification_ms: u64,
    pub error_notification_ms: u64,
    pub error_surfacing: ErrorSurfacing,
    pub edit_action_label: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            success_ttl_ms: SUCCESS_TTL_MS,
            success_notification_ms: 6_000,
            error_notification_ms: 8_000,
            error_surfacing: ErrorSurfacing::LogOnly,
            edit_action_label: "Edit item".into(),
        }
    }
}

impl NotifierConfig {
    pub fn success_ttl(&self) -> Duration {
        Duration::from_millis(self.success_ttl_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub attempt_timeout_ms: u64,
    pub error_notification_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: READ_ATTEMPT_TIMEOUT_MS,
            error_notification_ms: 6_000,
            retry: RetryPolicy::new(
                MAX_READ_ATTEMPTS,
                Backoff::Schedule {
                    delays_ms: vec![300, 1_000, 1_500],
                },
            ),
        }
    }
}

impl ResolverConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub upload: UploadConfig,
    pub analysis: AnalysisConfig,
    pub notifier: NotifierConfig,
    pub resolver: ResolverConfig,
}

impl PipelineConfig {
    /// Parses a JSON document; missing sections fall back to defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.max_tasks == 0 {
            return Err(ConfigError::Invalid("store.max_tasks must be > 0".into()));
        }
        if self.upload.max_file_bytes == 0 {
            return Err(ConfigError::Invalid(
                "upload.max_file_bytes must be > 0".into(),
            ));
        }
        if self.upload.allowed_content_types.is_empty() {
            return Err(ConfigError::Invalid(
                "upload.allowed_content_types cannot be empty".into(),
            ));
        }
        if self.upload.timeout_ms == 0
            || self.analysis.attempt_timeout_ms == 0
            || self.resolver.attempt_timeout_ms == 0
        {
            return Err(ConfigError::Invalid("step timeouts must be > 0".into()));
        }
        for (name, policy) in [
            ("upload.retry", &self.upload.retry),
            ("analysis.retry", &self.analysis.retry),
            ("resolver.retry", &self.resolver.retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.max_attempts must be > 0"
                )));
            }
            if let Backoff::Exponential { base_ms, max_ms, .. } = policy.backoff {
                if base_ms > max_ms {
                    return Err(ConfigError::Invalid(format!(
                        "{name}: base_ms must not exceed max_ms"
                    )));
                }
            }
        }
        Ok(())
    }
}
