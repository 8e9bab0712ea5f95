//! Shared configuration types for the import engine.

mod connection;
mod migration;
mod retry;
mod snapshot;
mod stream;
mod tables;

pub use connection::{TargetConnectionConfig, TargetDbType, ValidationError};
pub use migration::{MigrationConfig, TargetConfig};
pub use retry::RetryConfig;
pub use snapshot::SnapshotConfig;
pub use stream::StreamConfig;
pub use tables::TableFilterConfig;
