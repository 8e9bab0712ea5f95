//! Polymorphic driver for the supported target databases.
//!
//! One variant is selected at startup by configuration. Both variants expose
//! the same capability set: bulk batch load, transactional event apply with
//! watermark updates, bookkeeping schema management, and dialect helpers. The
//! YugabyteDB variant speaks the PostgreSQL wire protocol; the Oracle variant
//! drives the SQL*Loader and SQL*Plus client binaries.

pub mod identifier;
mod oracle;
mod yugabyte;

pub use oracle::{OracleDb, SQLLDR_DIR_NAME};
pub use yugabyte::YugabyteDb;

use std::collections::HashMap;

use uuid::Uuid;

use barge_config::shared::{MigrationConfig, TargetDbType};

use crate::convert::ColumnConverter;
use crate::descriptor::{FileFormat, SourceDbType};
use crate::error::{BargeError, BargeResult};
use crate::types::{Batch, EventBatch, EventCounts};

/// Options describing how one batch file should be bulk loaded.
///
/// Built once per import task from the data file descriptor; workers clone it
/// and fill in the per-batch `rows_per_transaction`.
#[derive(Debug, Clone)]
pub struct ImportBatchArgs {
    /// Target table, possibly schema-qualified and/or quoted.
    pub table_name: String,
    /// Ordered column list; empty means the target's natural column order.
    pub columns: Vec<String>,
    pub file_format: FileFormat,
    pub delimiter: char,
    pub has_header: bool,
    /// Quote byte, `None` to omit the option.
    pub quote_char: Option<u8>,
    /// Escape byte, `None` to omit the option.
    pub escape_char: Option<u8>,
    pub null_string: String,
    pub rows_per_transaction: i64,
}

/// Per-channel watermark row read back from the target at stream start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventChannelMetaInfo {
    pub channel_no: i64,
    pub last_applied_vsn: i64,
}

/// The selected target database adapter.
#[derive(Debug)]
pub enum TargetDb {
    Yugabyte(YugabyteDb),
    Oracle(OracleDb),
}

impl TargetDb {
    /// Builds the adapter selected by configuration. No connection is made
    /// until [`TargetDb::init`].
    pub fn new(config: &MigrationConfig, source_db: SourceDbType) -> Self {
        match config.target.db_type {
            TargetDbType::Yugabytedb => {
                TargetDb::Yugabyte(YugabyteDb::new(config.target.connection.clone(), source_db))
            }
            TargetDbType::Oracle => TargetDb::Oracle(OracleDb::new(
                config.target.connection.clone(),
                config.export_dir.clone(),
            )),
        }
    }

    /// Verifies the target is reachable.
    pub async fn init(&mut self) -> BargeResult<()> {
        match self {
            TargetDb::Yugabyte(db) => db.init().await,
            TargetDb::Oracle(db) => db.init().await,
        }
    }

    /// Releases connections held by the adapter.
    pub async fn finalize(&self) {
        match self {
            TargetDb::Yugabyte(db) => db.finalize().await,
            TargetDb::Oracle(db) => db.finalize().await,
        }
    }

    /// Sizes the connection pool to the configured parallelism. At most that
    /// many batch loads execute concurrently; excess workers wait for a
    /// connection.
    pub async fn init_conn_pool(&mut self, parallelism: usize) -> BargeResult<()> {
        match self {
            TargetDb::Yugabyte(db) => db.init_conn_pool(parallelism).await,
            TargetDb::Oracle(db) => db.init_conn_pool(parallelism).await,
        }
    }

    /// Creates the adapter's private bookkeeping schema on the target.
    pub async fn create_metadata_schema(&self) -> BargeResult<()> {
        match self {
            TargetDb::Yugabyte(db) => db.create_metadata_schema().await,
            TargetDb::Oracle(db) => db.create_metadata_schema().await,
        }
    }

    /// Reports the target server version for the operator.
    pub async fn version(&self) -> BargeResult<String> {
        match self {
            TargetDb::Yugabyte(db) => db.version().await,
            TargetDb::Oracle(db) => db.version().await,
        }
    }

    /// Returns the subset of `table_names` holding at least one row.
    pub async fn non_empty_tables(&self, table_names: &[String]) -> Vec<String> {
        match self {
            TargetDb::Yugabyte(db) => db.non_empty_tables(table_names).await,
            TargetDb::Oracle(db) => db.non_empty_tables(table_names).await,
        }
    }

    /// Loads one batch file into its table, recording the batch in
    /// `batch_metadata`. Skips work if the exact batch is already recorded,
    /// making crash recovery idempotent. Returns rows affected.
    pub async fn import_batch(
        &self,
        migration_uuid: Uuid,
        batch: &Batch,
        args: &ImportBatchArgs,
    ) -> BargeResult<i64> {
        match self {
            TargetDb::Yugabyte(db) => db.import_batch(migration_uuid, batch, args).await,
            TargetDb::Oracle(db) => db.import_batch(migration_uuid, batch, args).await,
        }
    }

    /// Applies one event batch and advances the owning channel's watermark in
    /// the same transaction. A batch whose max VSN is at or below the stored
    /// watermark is a no-op.
    pub async fn execute_batch(
        &self,
        migration_uuid: Uuid,
        event_batch: &EventBatch,
    ) -> BargeResult<()> {
        match self {
            TargetDb::Yugabyte(db) => db.execute_batch(migration_uuid, event_batch).await,
            TargetDb::Oracle(db) => db.execute_batch(migration_uuid, event_batch).await,
        }
    }

    /// Creates or resets the per-channel watermark rows; with `start_clean`
    /// also truncates the target tables in scope.
    pub async fn init_live_migration_state(
        &self,
        migration_uuid: Uuid,
        num_channels: usize,
        start_clean: bool,
        table_names: &[String],
    ) -> BargeResult<()> {
        match self {
            TargetDb::Yugabyte(db) => {
                db.init_live_migration_state(migration_uuid, num_channels, start_clean, table_names)
                    .await
            }
            TargetDb::Oracle(db) => {
                db.init_live_migration_state(migration_uuid, num_channels, start_clean, table_names)
                    .await
            }
        }
    }

    /// Reads back every channel's watermark row.
    pub async fn event_channels_meta_info(
        &self,
        migration_uuid: Uuid,
    ) -> BargeResult<HashMap<i64, EventChannelMetaInfo>> {
        match self {
            TargetDb::Yugabyte(db) => db.event_channels_meta_info(migration_uuid).await,
            TargetDb::Oracle(db) => db.event_channels_meta_info(migration_uuid).await,
        }
    }

    /// Sums the per-op counters over every channel.
    pub async fn total_events_imported_by_type(
        &self,
        migration_uuid: Uuid,
    ) -> BargeResult<EventCounts> {
        match self {
            TargetDb::Yugabyte(db) => db.total_events_imported_by_type(migration_uuid).await,
            TargetDb::Oracle(db) => db.total_events_imported_by_type(migration_uuid).await,
        }
    }

    /// Restores sequence values recorded by the exporter.
    pub async fn restore_sequences(
        &self,
        sequences: &HashMap<String, i64>,
    ) -> BargeResult<()> {
        match self {
            TargetDb::Yugabyte(db) => db.restore_sequences(sequences).await,
            TargetDb::Oracle(db) => db.restore_sequences(sequences).await,
        }
    }

    /// Returns `true` if the error must not be retried. The adapters classify
    /// at error-creation time; this consults that classification.
    pub fn is_non_retryable_copy_error(&self, err: &BargeError) -> bool {
        !err.is_retryable()
    }

    /// Quotes column names that need it in this target's dialect.
    pub fn quote_column_names_if_required(&self, columns: &[String]) -> Vec<String> {
        match self {
            TargetDb::Yugabyte(_) => columns
                .iter()
                .map(|c| identifier::quote_if_required_pg(c))
                .collect(),
            TargetDb::Oracle(_) => columns
                .iter()
                .map(|c| identifier::quote_if_required_oracle(c))
                .collect(),
        }
    }

    /// Adapter hint capping batch file size in bytes.
    pub fn max_batch_size_in_bytes(&self) -> i64 {
        match self {
            TargetDb::Yugabyte(db) => db.max_batch_size_in_bytes(),
            TargetDb::Oracle(db) => db.max_batch_size_in_bytes(),
        }
    }

    /// Converter suite mapping wire type names to this dialect's converters.
    pub fn converter_suite(&self) -> HashMap<String, ColumnConverter> {
        match self {
            TargetDb::Yugabyte(db) => db.converter_suite(),
            TargetDb::Oracle(db) => db.converter_suite(),
        }
    }
}
