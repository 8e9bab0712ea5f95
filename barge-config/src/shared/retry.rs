use serde::Deserialize;

use crate::shared::ValidationError;

/// Retry budget for transient target failures during bulk load.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of attempts for one batch load.
    #[serde(default = "default_copy_max_retries")]
    pub copy_max_retries: u32,
    /// Cap, in seconds, on the additive backoff between attempts.
    #[serde(default = "default_max_sleep_seconds")]
    pub max_sleep_seconds: u64,
}

impl RetryConfig {
    /// Default maximum number of load attempts per batch.
    pub const DEFAULT_COPY_MAX_RETRIES: u32 = 10;

    /// Default backoff cap in seconds.
    pub const DEFAULT_MAX_SLEEP_SECONDS: u64 = 60;

    /// Validates retry configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.copy_max_retries == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "retry.copy_max_retries".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            copy_max_retries: default_copy_max_retries(),
            max_sleep_seconds: default_max_sleep_seconds(),
        }
    }
}

fn default_copy_max_retries() -> u32 {
    RetryConfig::DEFAULT_COPY_MAX_RETRIES
}

fn default_max_sleep_seconds() -> u64 {
    RetryConfig::DEFAULT_MAX_SLEEP_SECONDS
}
