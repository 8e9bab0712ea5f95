use std::path::PathBuf;

use serde::Deserialize;

use crate::shared::{
    RetryConfig, SnapshotConfig, StreamConfig, TableFilterConfig, TargetConnectionConfig,
    TargetDbType, ValidationError,
};

/// Target database selection and connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TargetConfig {
    /// Which kind of database the import writes to.
    pub db_type: TargetDbType,
    /// Connection settings for the target.
    pub connection: TargetConnectionConfig,
}

impl TargetConfig {
    /// Validates target configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.connection.validate()
    }
}

/// Configuration for one migration run.
///
/// Built once at startup and shared read-only by every subsystem for the
/// lifetime of the run.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Directory the exporter wrote data files, the event queue, and metadata
    /// into. All local state lives under this directory too.
    pub export_dir: PathBuf,
    /// Target database selection and connection settings.
    pub target: TargetConfig,
    /// Snapshot phase tuning.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// Change streaming phase tuning.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Retry budget for transient target failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Table include/exclude lists.
    #[serde(default)]
    pub tables: TableFilterConfig,
    /// Discard previous import state and truncate target tables in scope.
    #[serde(default)]
    pub start_clean: bool,
    /// Stream captured changes after the snapshot completes.
    #[serde(default)]
    pub change_streaming: bool,
}

impl MigrationConfig {
    /// Validates the whole configuration tree.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.target.validate()?;
        self.snapshot.validate()?;
        self.stream.validate()?;
        self.retry.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_json(stream: &str) -> String {
        format!(
            r#"{{
                "export_dir": "/tmp/export",
                "target": {{
                    "db_type": "yugabytedb",
                    "connection": {{
                        "host": "localhost",
                        "database": "yugabyte",
                        "username": "yugabyte",
                        "password": "secret"
                    }}
                }},
                "stream": {stream}
            }}"#
        )
    }

    #[test]
    fn defaults_are_valid() {
        let config: MigrationConfig = serde_json::from_str(&config_json("{}")).unwrap();
        config.validate().unwrap();

        assert_eq!(config.snapshot.batch_size, SnapshotConfig::DEFAULT_BATCH_SIZE);
        assert_eq!(
            config.stream.num_event_channels,
            StreamConfig::DEFAULT_NUM_EVENT_CHANNELS
        );
        assert!(!config.start_clean);
    }

    #[test]
    fn non_power_of_two_channel_count_is_rejected() {
        let config: MigrationConfig =
            serde_json::from_str(&config_json(r#"{"num_event_channels": 500}"#)).unwrap();

        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidFieldValue { field, .. }) if field == "stream.num_event_channels"
        ));
    }

    #[test]
    fn channel_capacity_must_exceed_batch_size() {
        let config: MigrationConfig = serde_json::from_str(&config_json(
            r#"{"event_channel_size": 100, "max_events_per_batch": 100}"#,
        ))
        .unwrap();

        assert!(config.validate().is_err());
    }
}
