use std::collections::HashMap;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use barge_config::shared::TargetConnectionConfig;

use crate::bail;
use crate::convert::{ColumnConverter, quote_literal, yugabyte_converter_suite};
use crate::descriptor::SourceDbType;
use crate::error::{BargeError, BargeResult, ErrorKind};
use crate::target::identifier;
use crate::target::{EventChannelMetaInfo, ImportBatchArgs};
use crate::types::{Batch, Event, EventBatch, EventCounts, EventOp};

/// Schema on the target holding the adapter's bookkeeping tables.
const METADATA_SCHEMA: &str = "barge_metadata";

/// COPY performance degrades beyond a few hundred megabytes per batch, so the
/// splitter caps batch files here.
const MAX_BATCH_SIZE_BYTES: i64 = 200 * 1024 * 1024;

/// Target adapter for YugabyteDB, speaking the PostgreSQL wire protocol.
///
/// Bulk load goes through `COPY ... FROM STDIN` inside a transaction that also
/// records the batch in `batch_metadata`; event batches are applied in one
/// transaction together with the channel watermark update.
#[derive(Debug)]
pub struct YugabyteDb {
    connection: TargetConnectionConfig,
    source_db: SourceDbType,
    pool: Option<PgPool>,
}

impl YugabyteDb {
    pub(crate) fn new(connection: TargetConnectionConfig, source_db: SourceDbType) -> Self {
        Self {
            connection,
            source_db,
            pool: None,
        }
    }

    fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.connection.host)
            .port(self.connection.port)
            .database(&self.connection.database)
            .username(&self.connection.username)
            .password(self.connection.password())
    }

    fn pool(&self) -> BargeResult<&PgPool> {
        self.pool.as_ref().ok_or_else(|| {
            crate::barge_error!(
                ErrorKind::TargetConnectionFailed,
                "Target connection pool was not initialized"
            )
        })
    }

    pub(crate) async fn init(&mut self) -> BargeResult<()> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(self.connect_options())
            .await
            .map_err(connect_error)?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(connect_error)?;

        self.pool = Some(pool);

        Ok(())
    }

    pub(crate) async fn finalize(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }

    pub(crate) async fn init_conn_pool(&mut self, parallelism: usize) -> BargeResult<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }

        let pool = PgPoolOptions::new()
            .max_connections(parallelism as u32)
            .connect_with(self.connect_options())
            .await
            .map_err(connect_error)?;
        self.pool = Some(pool);

        debug!(parallelism, "initialized target connection pool");

        Ok(())
    }

    pub(crate) async fn version(&self) -> BargeResult<String> {
        let row = sqlx::query("SELECT version() AS version")
            .fetch_one(self.pool()?)
            .await
            .map_err(query_error)?;

        Ok(row.try_get("version").map_err(query_error)?)
    }

    pub(crate) async fn create_metadata_schema(&self) -> BargeResult<()> {
        let pool = self.pool()?;

        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {METADATA_SCHEMA}"),
            format!(
                "CREATE TABLE IF NOT EXISTS {METADATA_SCHEMA}.batch_metadata (
                    migration_uuid UUID,
                    file_path      TEXT,
                    table_name     TEXT,
                    batch_number   BIGINT,
                    rows_affected  BIGINT,
                    PRIMARY KEY (migration_uuid, file_path, table_name, batch_number)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {METADATA_SCHEMA}.event_channels_metadata (
                    migration_uuid   UUID,
                    channel_no       BIGINT,
                    last_applied_vsn BIGINT,
                    num_inserts      BIGINT,
                    num_updates      BIGINT,
                    num_deletes      BIGINT,
                    PRIMARY KEY (migration_uuid, channel_no)
                )"
            ),
        ];

        for statement in statements {
            sqlx::query(&statement)
                .execute(pool)
                .await
                .map_err(query_error)?;
        }

        Ok(())
    }

    pub(crate) async fn non_empty_tables(&self, table_names: &[String]) -> Vec<String> {
        let Ok(pool) = self.pool() else {
            return Vec::new();
        };

        let mut non_empty = Vec::new();
        for table in table_names {
            let query = format!(
                "SELECT EXISTS (SELECT 1 FROM {} LIMIT 1) AS present",
                self.qualified_table(table)
            );

            match sqlx::query(&query).fetch_one(pool).await {
                Ok(row) => {
                    if row.try_get::<bool, _>("present").unwrap_or(false) {
                        non_empty.push(table.clone());
                    }
                }
                // A missing table has no rows to protect.
                Err(err) => debug!(%table, error = %err, "table presence check failed"),
            }
        }

        non_empty
    }

    pub(crate) async fn import_batch(
        &self,
        migration_uuid: Uuid,
        batch: &Batch,
        args: &ImportBatchArgs,
    ) -> BargeResult<i64> {
        let mut tx = self.pool()?.begin().await.map_err(copy_error)?;

        let existing = sqlx::query(&format!(
            "SELECT rows_affected FROM {METADATA_SCHEMA}.batch_metadata \
             WHERE migration_uuid = $1 AND file_path = $2 AND table_name = $3 \
               AND batch_number = $4"
        ))
        .bind(migration_uuid)
        .bind(&batch.file_path)
        .bind(&batch.table_name)
        .bind(batch.number)
        .fetch_optional(&mut *tx)
        .await
        .map_err(copy_error)?;

        if let Some(row) = existing {
            let rows_affected: i64 = row.try_get("rows_affected").map_err(query_error)?;
            info!(
                table_name = %batch.table_name,
                batch_number = batch.number,
                "batch already imported, skipping"
            );
            return Ok(rows_affected);
        }

        let data = tokio::fs::read(&batch.batch_file).await?;
        let statement = copy_statement(&self.qualified_table(&args.table_name), args);

        let mut copy = (&mut *tx).copy_in_raw(&statement).await.map_err(copy_error)?;
        copy.send(data.as_slice()).await.map_err(copy_error)?;
        let rows_affected = copy.finish().await.map_err(copy_error)? as i64;

        sqlx::query(&format!(
            "INSERT INTO {METADATA_SCHEMA}.batch_metadata \
             (migration_uuid, file_path, table_name, batch_number, rows_affected) \
             VALUES ($1, $2, $3, $4, $5)"
        ))
        .bind(migration_uuid)
        .bind(&batch.file_path)
        .bind(&batch.table_name)
        .bind(batch.number)
        .bind(rows_affected)
        .execute(&mut *tx)
        .await
        .map_err(copy_error)?;

        tx.commit().await.map_err(copy_error)?;

        Ok(rows_affected)
    }

    pub(crate) async fn execute_batch(
        &self,
        migration_uuid: Uuid,
        event_batch: &EventBatch,
    ) -> BargeResult<()> {
        let mut tx = self.pool()?.begin().await.map_err(apply_error)?;

        let row = sqlx::query(&format!(
            "SELECT last_applied_vsn FROM {METADATA_SCHEMA}.event_channels_metadata \
             WHERE migration_uuid = $1 AND channel_no = $2 FOR UPDATE"
        ))
        .bind(migration_uuid)
        .bind(event_batch.channel_no as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(apply_error)?;

        let Some(row) = row else {
            bail!(
                ErrorKind::ChannelMetadataMissing,
                "No channel metadata row on the target",
                event_batch.channel_no
            );
        };

        let last_applied_vsn: i64 = row.try_get("last_applied_vsn").map_err(apply_error)?;
        if last_applied_vsn >= event_batch.max_vsn {
            debug!(
                channel_no = event_batch.channel_no,
                last_applied_vsn,
                batch_max_vsn = event_batch.max_vsn,
                "event batch already applied, skipping"
            );
            return Ok(());
        }

        for event in &event_batch.events {
            self.execute_event(&mut tx, event).await?;
        }

        let counts = &event_batch.event_counts;
        sqlx::query(&format!(
            "UPDATE {METADATA_SCHEMA}.event_channels_metadata \
             SET last_applied_vsn = $3, \
                 num_inserts = num_inserts + $4, \
                 num_updates = num_updates + $5, \
                 num_deletes = num_deletes + $6 \
             WHERE migration_uuid = $1 AND channel_no = $2"
        ))
        .bind(migration_uuid)
        .bind(event_batch.channel_no as i64)
        .bind(event_batch.max_vsn)
        .bind(counts.num_inserts)
        .bind(counts.num_updates)
        .bind(counts.num_deletes)
        .execute(&mut *tx)
        .await
        .map_err(apply_error)?;

        tx.commit().await.map_err(apply_error)?;

        Ok(())
    }

    /// Events are applied as literal statements. A bind parameter would reach
    /// the server typed as text and fail assignment to non-text columns; a
    /// quoted literal stays untyped until the server coerces it to the column
    /// type, exactly like COPY input.
    async fn execute_event(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &Event,
    ) -> BargeResult<()> {
        let table = self.qualified_table(&event.effective_table_name(self.source_db));

        let sql = match event.op {
            EventOp::Insert => build_insert(&table, event),
            EventOp::Update => build_update(&table, event)?,
            EventOp::Delete => build_delete(&table, event),
            EventOp::EndOfSegment => return Ok(()),
        };
        sqlx::query(&sql).execute(&mut **tx).await.map_err(apply_error)?;

        Ok(())
    }

    pub(crate) async fn init_live_migration_state(
        &self,
        migration_uuid: Uuid,
        num_channels: usize,
        start_clean: bool,
        table_names: &[String],
    ) -> BargeResult<()> {
        let mut tx = self.pool()?.begin().await.map_err(query_error)?;

        if start_clean {
            sqlx::query(&format!(
                "DELETE FROM {METADATA_SCHEMA}.event_channels_metadata \
                 WHERE migration_uuid = $1"
            ))
            .bind(migration_uuid)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

            for table in table_names {
                let statement = format!("TRUNCATE TABLE {}", self.qualified_table(table));
                sqlx::query(&statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(query_error)?;
            }
        }

        for channel_no in 0..num_channels {
            sqlx::query(&format!(
                "INSERT INTO {METADATA_SCHEMA}.event_channels_metadata \
                 (migration_uuid, channel_no, last_applied_vsn, num_inserts, num_updates, num_deletes) \
                 VALUES ($1, $2, 0, 0, 0, 0) \
                 ON CONFLICT (migration_uuid, channel_no) DO NOTHING"
            ))
            .bind(migration_uuid)
            .bind(channel_no as i64)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }

        tx.commit().await.map_err(query_error)?;

        Ok(())
    }

    pub(crate) async fn event_channels_meta_info(
        &self,
        migration_uuid: Uuid,
    ) -> BargeResult<HashMap<i64, EventChannelMetaInfo>> {
        let rows = sqlx::query(&format!(
            "SELECT channel_no, last_applied_vsn \
             FROM {METADATA_SCHEMA}.event_channels_metadata \
             WHERE migration_uuid = $1"
        ))
        .bind(migration_uuid)
        .fetch_all(self.pool()?)
        .await
        .map_err(query_error)?;

        let mut meta_info = HashMap::with_capacity(rows.len());
        for row in rows {
            let channel_no: i64 = row.try_get("channel_no").map_err(query_error)?;
            meta_info.insert(
                channel_no,
                EventChannelMetaInfo {
                    channel_no,
                    last_applied_vsn: row.try_get("last_applied_vsn").map_err(query_error)?,
                },
            );
        }

        Ok(meta_info)
    }

    pub(crate) async fn total_events_imported_by_type(
        &self,
        migration_uuid: Uuid,
    ) -> BargeResult<EventCounts> {
        let row = sqlx::query(&format!(
            "SELECT COALESCE(SUM(num_inserts), 0)::BIGINT AS num_inserts, \
                    COALESCE(SUM(num_updates), 0)::BIGINT AS num_updates, \
                    COALESCE(SUM(num_deletes), 0)::BIGINT AS num_deletes \
             FROM {METADATA_SCHEMA}.event_channels_metadata \
             WHERE migration_uuid = $1"
        ))
        .bind(migration_uuid)
        .fetch_one(self.pool()?)
        .await
        .map_err(query_error)?;

        Ok(EventCounts {
            num_inserts: row.try_get("num_inserts").map_err(query_error)?,
            num_updates: row.try_get("num_updates").map_err(query_error)?,
            num_deletes: row.try_get("num_deletes").map_err(query_error)?,
        })
    }

    pub(crate) async fn restore_sequences(
        &self,
        sequences: &HashMap<String, i64>,
    ) -> BargeResult<()> {
        let pool = self.pool()?;

        for (sequence, last_value) in sequences {
            sqlx::query("SELECT setval($1::regclass, $2, true)")
                .bind(sequence)
                .bind(last_value)
                .execute(pool)
                .await
                .map_err(query_error)?;
            debug!(%sequence, last_value, "restored sequence");
        }

        Ok(())
    }

    pub(crate) fn max_batch_size_in_bytes(&self) -> i64 {
        MAX_BATCH_SIZE_BYTES
    }

    pub(crate) fn converter_suite(&self) -> HashMap<String, ColumnConverter> {
        yugabyte_converter_suite()
    }

    /// Qualifies a bare table name with the configured target schema.
    ///
    /// PostgreSQL sources already qualify names where it matters; other
    /// sources address tables by bare name within the configured schema.
    fn qualified_table(&self, table: &str) -> String {
        if table.contains('.')
            || self.source_db == SourceDbType::Postgresql
            || self.connection.schema == "public"
        {
            table.to_string()
        } else {
            format!("{}.{}", self.connection.schema, table)
        }
    }
}

/// Builds the COPY statement for one batch load.
fn copy_statement(table: &str, args: &ImportBatchArgs) -> String {
    let columns = if args.columns.is_empty() {
        String::new()
    } else {
        format!(" ({})", args.columns.join(", "))
    };

    let mut options = vec![
        format!("FORMAT '{}'", args.file_format.as_copy_option()),
        format!("ROWS_PER_TRANSACTION {}", args.rows_per_transaction),
    ];
    if args.has_header {
        options.push("HEADER".to_string());
    }
    options.push(format!("DELIMITER E'{}'", escape_char_option(args.delimiter)));
    if let Some(quote) = args.quote_char {
        options.push(format!("QUOTE E'{}'", escape_char_option(char::from(quote))));
    }
    if let Some(escape) = args.escape_char {
        options.push(format!("ESCAPE E'{}'", escape_char_option(char::from(escape))));
    }
    if !args.null_string.is_empty() {
        options.push(format!("NULL '{}'", args.null_string));
    }

    format!(
        "COPY {table}{columns} FROM STDIN WITH ({})",
        options.join(", ")
    )
}

fn escape_char_option(c: char) -> String {
    match c {
        '\t' => "\\t".to_string(),
        '\'' => "\\'".to_string(),
        '\\' => "\\\\".to_string(),
        other => other.to_string(),
    }
}

/// Insert values arrive bare from the converter (`format_if_required` was
/// false for inserts), so they are wrapped in quotes here.
fn build_insert(table: &str, event: &Event) -> String {
    let mut columns = Vec::with_capacity(event.fields.len());
    let mut values = Vec::with_capacity(event.fields.len());

    for (column, value) in &event.fields {
        columns.push(identifier::quote(column));
        values.push(match value {
            Some(value) => quote_literal(value),
            None => "NULL".to_string(),
        });
    }

    format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        columns.join(", "),
        values.join(", ")
    )
}

/// Update statements embed the converter's formatted literals directly; the
/// values were produced with `format_if_required` set.
fn build_update(table: &str, event: &Event) -> BargeResult<String> {
    if event.fields.is_empty() {
        bail!(
            ErrorKind::EventApplyFailed,
            "Update event carries no fields",
            event.vsn
        );
    }

    let assignments: Vec<String> = event
        .fields
        .iter()
        .map(|(column, value)| {
            format!(
                "{} = {}",
                identifier::quote(column),
                value.as_deref().unwrap_or("NULL")
            )
        })
        .collect();

    let predicates: Vec<String> = event
        .key
        .iter()
        .map(|(column, value)| match value {
            Some(value) => format!("{} = {}", identifier::quote(column), value),
            None => format!("{} IS NULL", identifier::quote(column)),
        })
        .collect();

    Ok(format!(
        "UPDATE {table} SET {} WHERE {}",
        assignments.join(", "),
        predicates.join(" AND ")
    ))
}

/// Delete keys arrive bare like insert values and are quoted here.
fn build_delete(table: &str, event: &Event) -> String {
    let predicates: Vec<String> = event
        .key
        .iter()
        .map(|(column, value)| match value {
            Some(value) => format!("{} = {}", identifier::quote(column), quote_literal(value)),
            None => format!("{} IS NULL", identifier::quote(column)),
        })
        .collect();

    format!("DELETE FROM {table} WHERE {}", predicates.join(" AND "))
}

fn connect_error(err: sqlx::Error) -> BargeError {
    crate::barge_error!(
        ErrorKind::TargetConnectionFailed,
        "Could not connect to the target database"
    )
    .with_source(err)
}

fn query_error(err: sqlx::Error) -> BargeError {
    crate::barge_error!(ErrorKind::TargetQueryFailed, "Target query failed").with_source(err)
}

fn apply_error(err: sqlx::Error) -> BargeError {
    crate::barge_error!(ErrorKind::EventApplyFailed, "Applying events failed").with_source(err)
}

/// Classifies bulk-load failures: transient connection and contention errors
/// are retryable, everything the server rejected (bad data, constraint
/// violations) is not.
fn copy_error(err: sqlx::Error) -> BargeError {
    let retryable = match &err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            // Connection exceptions (08xxx), insufficient resources (53xxx),
            // serialization failure / deadlock, admin shutdown.
            code.starts_with("08")
                || code.starts_with("53")
                || code == "40001"
                || code == "40P01"
                || code == "57P01"
        }
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Protocol(_) => true,
        _ => false,
    };

    if retryable {
        crate::barge_error!(ErrorKind::CopyRetryable, "Transient bulk load failure")
            .with_source(err)
    } else {
        crate::barge_error!(ErrorKind::CopyRejected, "Bulk load rejected by the target")
            .with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::descriptor::FileFormat;

    fn args() -> ImportBatchArgs {
        ImportBatchArgs {
            table_name: "orders".to_string(),
            columns: vec!["id".to_string(), "total".to_string()],
            file_format: FileFormat::Csv,
            delimiter: ',',
            has_header: true,
            quote_char: Some(b'"'),
            escape_char: Some(b'"'),
            null_string: "\\N".to_string(),
            rows_per_transaction: 4096,
        }
    }

    #[test]
    fn copy_statement_lists_all_options() {
        let statement = copy_statement("orders", &args());
        assert_eq!(
            statement,
            "COPY orders (id, total) FROM STDIN WITH (FORMAT 'csv', \
             ROWS_PER_TRANSACTION 4096, HEADER, DELIMITER E',', QUOTE E'\"', \
             ESCAPE E'\"', NULL '\\N')"
        );
    }

    #[test]
    fn copy_statement_omits_optional_parts() {
        let mut args = args();
        args.columns.clear();
        args.has_header = false;
        args.quote_char = None;
        args.escape_char = None;
        args.null_string = String::new();
        args.file_format = FileFormat::Text;
        args.delimiter = '\t';

        let statement = copy_statement("items", &args);
        assert_eq!(
            statement,
            "COPY items FROM STDIN WITH (FORMAT 'text', ROWS_PER_TRANSACTION 4096, \
             DELIMITER E'\\t')"
        );
    }

    fn event(op: EventOp) -> Event {
        Event {
            op,
            vsn: 11,
            schema_name: "public".to_string(),
            table_name: "orders".to_string(),
            key: BTreeMap::from([("id".to_string(), Some("7".to_string()))]),
            fields: BTreeMap::from([
                ("id".to_string(), Some("7".to_string())),
                ("total".to_string(), Some("99.5".to_string())),
            ]),
        }
    }

    #[test]
    fn insert_embeds_quoted_literals_in_column_order() {
        let sql = build_insert("orders", &event(EventOp::Insert));

        assert_eq!(
            sql,
            "INSERT INTO orders (\"id\", \"total\") VALUES ('7', '99.5')"
        );
    }

    #[test]
    fn insert_escapes_embedded_quotes_and_folds_nulls() {
        let mut event = event(EventOp::Insert);
        event.fields = BTreeMap::from([
            ("name".to_string(), Some("o'hare".to_string())),
            ("note".to_string(), None),
        ]);

        let sql = build_insert("orders", &event);
        assert_eq!(
            sql,
            "INSERT INTO orders (\"name\", \"note\") VALUES ('o''hare', NULL)"
        );
    }

    #[test]
    fn update_embeds_formatted_literals() {
        let mut event = event(EventOp::Update);
        // Values as the converter leaves them with formatting requested.
        event.fields = BTreeMap::from([
            ("total".to_string(), Some("'99.5'".to_string())),
            ("note".to_string(), None),
        ]);
        event.key = BTreeMap::from([("id".to_string(), Some("'7'".to_string()))]);

        let sql = build_update("orders", &event).unwrap();
        assert_eq!(
            sql,
            "UPDATE orders SET \"note\" = NULL, \"total\" = '99.5' WHERE \"id\" = '7'"
        );
    }

    #[test]
    fn update_without_fields_is_rejected() {
        let mut event = event(EventOp::Update);
        event.fields.clear();

        assert!(build_update("orders", &event).is_err());
    }

    #[test]
    fn delete_embeds_key_literals_and_folds_nulls() {
        let mut event = event(EventOp::Delete);
        event.key = BTreeMap::from([
            ("id".to_string(), Some("7".to_string())),
            ("region".to_string(), None),
        ]);

        let sql = build_delete("orders", &event);
        assert_eq!(
            sql,
            "DELETE FROM orders WHERE \"id\" = '7' AND \"region\" IS NULL"
        );
    }
}
