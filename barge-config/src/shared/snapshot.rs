use serde::Deserialize;

use crate::shared::ValidationError;

/// Tuning for the snapshot import phase.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SnapshotConfig {
    /// Maximum number of rows in one snapshot batch file.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    /// Number of batches loaded into the target concurrently.
    ///
    /// The batch worker pool is sized to twice this value so that splitting can
    /// run ahead, but the target connection pool admits only `parallelism`
    /// loads at a time.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl SnapshotConfig {
    /// Default number of rows per snapshot batch.
    pub const DEFAULT_BATCH_SIZE: i64 = 20_000;

    /// Default number of concurrent batch loads.
    pub const DEFAULT_PARALLELISM: usize = 4;

    /// Size of the batch worker pool.
    pub fn pool_size(&self) -> usize {
        self.parallelism * 2
    }

    /// Validates snapshot configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size <= 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "snapshot.batch_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.parallelism == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "snapshot.parallelism".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            parallelism: default_parallelism(),
        }
    }
}

fn default_batch_size() -> i64 {
    SnapshotConfig::DEFAULT_BATCH_SIZE
}

fn default_parallelism() -> usize {
    SnapshotConfig::DEFAULT_PARALLELISM
}
