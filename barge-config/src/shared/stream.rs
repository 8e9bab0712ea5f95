use serde::Deserialize;

use crate::shared::ValidationError;

/// Tuning for the change streaming phase.
///
/// The channel count is persisted implicitly in the target's channel metadata
/// table, so it must match across runs of the same migration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StreamConfig {
    /// Number of parallel apply lanes events are partitioned over.
    ///
    /// Must be a power of two, which keeps the hash-modulo routing free of
    /// modulo bias.
    #[serde(default = "default_num_event_channels")]
    pub num_event_channels: usize,
    /// Capacity of each bounded event channel. Must exceed
    /// `max_events_per_batch` so a full batch never deadlocks its producer.
    #[serde(default = "default_event_channel_size")]
    pub event_channel_size: usize,
    /// Maximum number of events applied in one transaction on a channel.
    #[serde(default = "default_max_events_per_batch")]
    pub max_events_per_batch: usize,
    /// Maximum time, in milliseconds, a partially filled batch waits before it
    /// is applied anyway.
    #[serde(default = "default_max_interval_between_batches_ms")]
    pub max_interval_between_batches_ms: u64,
}

impl StreamConfig {
    /// Default number of event channels.
    pub const DEFAULT_NUM_EVENT_CHANNELS: usize = 512;

    /// Default bounded channel capacity.
    pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 2000;

    /// Default maximum batch size in events.
    pub const DEFAULT_MAX_EVENTS_PER_BATCH: usize = 2000;

    /// Default maximum interval between batches in milliseconds.
    pub const DEFAULT_MAX_INTERVAL_BETWEEN_BATCHES_MS: u64 = 2000;

    /// Validates stream configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.num_event_channels == 0 || !self.num_event_channels.is_power_of_two() {
            return Err(ValidationError::InvalidFieldValue {
                field: "stream.num_event_channels".to_string(),
                constraint: "must be a power of two".to_string(),
            });
        }

        if self.max_events_per_batch == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "stream.max_events_per_batch".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.event_channel_size <= self.max_events_per_batch {
            return Err(ValidationError::InvalidFieldValue {
                field: "stream.event_channel_size".to_string(),
                constraint: "must be greater than stream.max_events_per_batch".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            num_event_channels: default_num_event_channels(),
            event_channel_size: default_event_channel_size(),
            max_events_per_batch: default_max_events_per_batch(),
            max_interval_between_batches_ms: default_max_interval_between_batches_ms(),
        }
    }
}

fn default_num_event_channels() -> usize {
    StreamConfig::DEFAULT_NUM_EVENT_CHANNELS
}

fn default_event_channel_size() -> usize {
    StreamConfig::DEFAULT_EVENT_CHANNEL_SIZE
}

fn default_max_events_per_batch() -> usize {
    StreamConfig::DEFAULT_MAX_EVENTS_PER_BATCH
}

fn default_max_interval_between_batches_ms() -> u64 {
    StreamConfig::DEFAULT_MAX_INTERVAL_BETWEEN_BATCHES_MS
}
