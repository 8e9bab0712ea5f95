use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use barge_config::shared::TargetConnectionConfig;

use crate::bail;
use crate::convert::{ColumnConverter, oracle_converter_suite};
use crate::error::{BargeError, BargeResult, ErrorKind};
use crate::target::{EventChannelMetaInfo, ImportBatchArgs};
use crate::types::{Batch, Event, EventBatch, EventCounts, EventOp};

/// Subdirectory of the export directory holding SQL*Loader control, log, and
/// bad files. Removed wholesale on start-clean.
pub const SQLLDR_DIR_NAME: &str = "sqlldr";

/// SQL*Loader handles arbitrarily large files; the cap only bounds how much
/// disk one batch file occupies.
const MAX_BATCH_SIZE_BYTES: i64 = 1024 * 1024 * 1024;

/// ORA codes that indicate a transient connectivity problem worth retrying.
const RETRYABLE_ORA_CODES: &[&str] = &[
    "ORA-01033", // initialization or shutdown in progress
    "ORA-03113", // end-of-file on communication channel
    "ORA-03114", // not connected to ORACLE
    "ORA-12170", // connect timeout
    "ORA-12514", // listener does not currently know of service
    "ORA-12541", // no listener
];

/// Target adapter for Oracle.
///
/// There is no in-process driver: bulk loads run through the SQL*Loader
/// binary with a generated control file, and everything else is SQL*Plus
/// scripts. Transactional guarantees for event batches come from a single
/// PL/SQL block that checks the channel watermark, applies the statements,
/// and commits server-side.
#[derive(Debug)]
pub struct OracleDb {
    connection: TargetConnectionConfig,
    scratch_dir: PathBuf,
}

impl OracleDb {
    pub(crate) fn new(connection: TargetConnectionConfig, export_dir: PathBuf) -> Self {
        Self {
            connection,
            scratch_dir: export_dir.join(SQLLDR_DIR_NAME),
        }
    }

    pub(crate) async fn init(&mut self) -> BargeResult<()> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        self.query_single("SELECT 1 FROM DUAL").await?;

        Ok(())
    }

    pub(crate) async fn finalize(&self) {}

    /// The external clients open their own connections per invocation, so
    /// there is no pool to size.
    pub(crate) async fn init_conn_pool(&mut self, _parallelism: usize) -> BargeResult<()> {
        Ok(())
    }

    pub(crate) async fn version(&self) -> BargeResult<String> {
        let banner = self
            .query_single("SELECT banner FROM v$version WHERE ROWNUM = 1")
            .await?;

        banner.ok_or_else(|| {
            crate::barge_error!(ErrorKind::TargetQueryFailed, "Version banner query was empty")
        })
    }

    pub(crate) async fn create_metadata_schema(&self) -> BargeResult<()> {
        let tables = [
            "CREATE TABLE batch_metadata (
                migration_uuid VARCHAR2(36),
                file_path      VARCHAR2(1024),
                table_name     VARCHAR2(256),
                batch_number   NUMBER,
                rows_affected  NUMBER,
                CONSTRAINT batch_metadata_pk
                    PRIMARY KEY (migration_uuid, file_path, table_name, batch_number)
            )",
            "CREATE TABLE event_channels_metadata (
                migration_uuid   VARCHAR2(36),
                channel_no       NUMBER,
                last_applied_vsn NUMBER,
                num_inserts      NUMBER,
                num_updates      NUMBER,
                num_deletes      NUMBER,
                CONSTRAINT event_channels_metadata_pk
                    PRIMARY KEY (migration_uuid, channel_no)
            )",
        ];

        for ddl in tables {
            // ORA-00955: the table is already there from an earlier run.
            let block = format!(
                "BEGIN\n  EXECUTE IMMEDIATE '{}';\nEXCEPTION WHEN OTHERS THEN\n  IF SQLCODE != -955 THEN RAISE; END IF;\nEND;\n/",
                ddl.replace('\n', " ")
            );
            self.run_script(&block).await?;
        }

        Ok(())
    }

    pub(crate) async fn non_empty_tables(&self, table_names: &[String]) -> Vec<String> {
        let mut non_empty = Vec::new();

        for table in table_names {
            let query = format!(
                "SELECT COUNT(*) FROM (SELECT 1 FROM {} WHERE ROWNUM = 1)",
                self.qualified_table(table)
            );

            match self.query_single(&query).await {
                Ok(Some(count)) if count.trim() == "1" => non_empty.push(table.clone()),
                Ok(_) => {}
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
        let check = format!(
            "SELECT rows_affected FROM batch_metadata \
             WHERE migration_uuid = '{migration_uuid}' \
               AND file_path = '{}' AND table_name = '{}' AND batch_number = {}",
            sql_escape(&batch.file_path),
            sql_escape(&batch.table_name),
            batch.number
        );
        if let Some(rows) = self.query_single(&check).await? {
            info!(
                table_name = %batch.table_name,
                batch_number = batch.number,
                "batch already imported, skipping"
            );
            return Ok(rows.trim().parse::<i64>().unwrap_or(0));
        }

        let rows_affected = self.run_sqlldr(batch, args).await?;

        let record = format!(
            "INSERT INTO batch_metadata \
             (migration_uuid, file_path, table_name, batch_number, rows_affected) \
             VALUES ('{migration_uuid}', '{}', '{}', {}, {});\nCOMMIT;",
            sql_escape(&batch.file_path),
            sql_escape(&batch.table_name),
            batch.number,
            rows_affected
        );
        self.run_script(&record).await?;

        Ok(rows_affected)
    }

    async fn run_sqlldr(&self, batch: &Batch, args: &ImportBatchArgs) -> BargeResult<i64> {
        let stem = format!("batch-{}-{}", sanitize(&batch.table_name), batch.number);
        let control_path = self.scratch_dir.join(format!("{stem}.ctl"));
        let log_path = self.scratch_dir.join(format!("{stem}.log"));
        let bad_path = self.scratch_dir.join(format!("{stem}.bad"));

        let control_file = control_file(
            &self.qualified_table(&args.table_name),
            &batch.batch_file.display().to_string(),
            args,
        );
        tokio::fs::write(&control_path, control_file).await?;

        let output = Command::new("sqlldr")
            .arg(format!("userid={}", self.connection.oracle_connect_string()))
            .arg(format!("control={}", control_path.display()))
            .arg(format!("log={}", log_path.display()))
            .arg(format!("bad={}", bad_path.display()))
            .arg("errors=0")
            .arg("silent=ALL")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| {
                crate::barge_error!(
                    ErrorKind::LoaderClientFailed,
                    "Could not invoke sqlldr; is the Oracle client installed?"
                )
                .with_source(err)
            })?;

        let log = tokio::fs::read_to_string(&log_path)
            .await
            .unwrap_or_default();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_ora_failure(
                "SQL*Loader failed",
                &format!("{stderr}\n{log}"),
            ));
        }

        parse_rows_loaded(&log).ok_or_else(|| {
            crate::barge_error!(
                ErrorKind::LoaderClientFailed,
                "SQL*Loader log did not report a loaded row count",
                log_path.display()
            )
        })
    }

    pub(crate) async fn execute_batch(
        &self,
        migration_uuid: Uuid,
        event_batch: &EventBatch,
    ) -> BargeResult<()> {
        let mut statements = String::new();
        for event in &event_batch.events {
            statements.push_str("    ");
            statements.push_str(&self.event_statement(event)?);
            statements.push_str(";\n");
        }

        let counts = &event_batch.event_counts;
        // The watermark check, the event statements, and the counter update
        // run in one server-side block; redelivered batches fall through to
        // the bare COMMIT.
        let block = format!(
            "DECLARE\n\
             \x20 v_last_vsn NUMBER;\n\
             BEGIN\n\
             \x20 SELECT last_applied_vsn INTO v_last_vsn FROM event_channels_metadata\n\
             \x20  WHERE migration_uuid = '{migration_uuid}' AND channel_no = {channel} FOR UPDATE;\n\
             \x20 IF v_last_vsn < {max_vsn} THEN\n\
             {statements}\
             \x20   UPDATE event_channels_metadata\n\
             \x20      SET last_applied_vsn = {max_vsn},\n\
             \x20          num_inserts = num_inserts + {inserts},\n\
             \x20          num_updates = num_updates + {updates},\n\
             \x20          num_deletes = num_deletes + {deletes}\n\
             \x20    WHERE migration_uuid = '{migration_uuid}' AND channel_no = {channel};\n\
             \x20 END IF;\n\
             \x20 COMMIT;\n\
             END;\n\
             /",
            channel = event_batch.channel_no,
            max_vsn = event_batch.max_vsn,
            inserts = counts.num_inserts,
            updates = counts.num_updates,
            deletes = counts.num_deletes,
        );

        self.run_script(&block).await.map_err(|err| {
            if err.detail().is_some_and(|d| d.contains("ORA-01403")) {
                crate::barge_error!(
                    ErrorKind::ChannelMetadataMissing,
                    "No channel metadata row on the target",
                    event_batch.channel_no
                )
            } else {
                err
            }
        })?;

        Ok(())
    }

    fn event_statement(&self, event: &Event) -> BargeResult<String> {
        let table = self.qualified_table(&event.table_name);

        // Values reached this point already formatted as Oracle literals.
        match event.op {
            EventOp::Insert => {
                let columns: Vec<&str> = event.fields.keys().map(String::as_str).collect();
                let values: Vec<&str> = event
                    .fields
                    .values()
                    .map(|v| v.as_deref().unwrap_or("NULL"))
                    .collect();

                Ok(format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    columns.join(", "),
                    values.join(", ")
                ))
            }
            EventOp::Update => {
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
                    .map(|(c, v)| format!("{c} = {}", v.as_deref().unwrap_or("NULL")))
                    .collect();

                Ok(format!(
                    "UPDATE {table} SET {} WHERE {}",
                    assignments.join(", "),
                    key_predicates(event).join(" AND ")
                ))
            }
            EventOp::Delete => Ok(format!(
                "DELETE FROM {table} WHERE {}",
                key_predicates(event).join(" AND ")
            )),
            EventOp::EndOfSegment => bail!(
                ErrorKind::EventApplyFailed,
                "Segment terminator reached the apply path"
            ),
        }
    }

    pub(crate) async fn init_live_migration_state(
        &self,
        migration_uuid: Uuid,
        num_channels: usize,
        start_clean: bool,
        table_names: &[String],
    ) -> BargeResult<()> {
        let mut script = String::new();

        if start_clean {
            script.push_str(&format!(
                "DELETE FROM event_channels_metadata WHERE migration_uuid = '{migration_uuid}';\n"
            ));
            for table in table_names {
                script.push_str(&format!(
                    "TRUNCATE TABLE {};\n",
                    self.qualified_table(table)
                ));
            }
        }

        for channel_no in 0..num_channels {
            script.push_str(&format!(
                "INSERT INTO event_channels_metadata \
                 (migration_uuid, channel_no, last_applied_vsn, num_inserts, num_updates, num_deletes) \
                 SELECT '{migration_uuid}', {channel_no}, 0, 0, 0, 0 FROM DUAL \
                 WHERE NOT EXISTS (SELECT 1 FROM event_channels_metadata \
                    WHERE migration_uuid = '{migration_uuid}' AND channel_no = {channel_no});\n"
            ));
        }
        script.push_str("COMMIT;");

        self.run_script(&script).await?;

        Ok(())
    }

    pub(crate) async fn event_channels_meta_info(
        &self,
        migration_uuid: Uuid,
    ) -> BargeResult<HashMap<i64, EventChannelMetaInfo>> {
        let query = format!(
            "SELECT channel_no || ',' || last_applied_vsn FROM event_channels_metadata \
             WHERE migration_uuid = '{migration_uuid}' ORDER BY channel_no"
        );

        let mut meta_info = HashMap::new();
        for line in self.query_lines(&query).await? {
            let Some((channel, vsn)) = line.split_once(',') else {
                bail!(
                    ErrorKind::TargetQueryFailed,
                    "Malformed channel metadata row",
                    line
                );
            };
            let channel_no = parse_number(channel)?;
            meta_info.insert(
                channel_no,
                EventChannelMetaInfo {
                    channel_no,
                    last_applied_vsn: parse_number(vsn)?,
                },
            );
        }

        Ok(meta_info)
    }

    pub(crate) async fn total_events_imported_by_type(
        &self,
        migration_uuid: Uuid,
    ) -> BargeResult<EventCounts> {
        let query = format!(
            "SELECT NVL(SUM(num_inserts), 0) || ',' || NVL(SUM(num_updates), 0) \
                 || ',' || NVL(SUM(num_deletes), 0) \
             FROM event_channels_metadata WHERE migration_uuid = '{migration_uuid}'"
        );

        let line = self.query_single(&query).await?.unwrap_or_default();
        let parts: Vec<&str> = line.trim().split(',').collect();
        if parts.len() != 3 {
            bail!(
                ErrorKind::TargetQueryFailed,
                "Malformed event counter row",
                line
            );
        }

        Ok(EventCounts {
            num_inserts: parse_number(parts[0])?,
            num_updates: parse_number(parts[1])?,
            num_deletes: parse_number(parts[2])?,
        })
    }

    pub(crate) async fn restore_sequences(
        &self,
        sequences: &HashMap<String, i64>,
    ) -> BargeResult<()> {
        if sequences.is_empty() {
            return Ok(());
        }

        let mut script = String::new();
        for (sequence, last_value) in sequences {
            script.push_str(&format!(
                "ALTER SEQUENCE {} RESTART START WITH {};\n",
                sequence,
                last_value + 1
            ));
        }
        self.run_script(&script).await?;

        Ok(())
    }

    pub(crate) fn max_batch_size_in_bytes(&self) -> i64 {
        MAX_BATCH_SIZE_BYTES
    }

    pub(crate) fn converter_suite(&self) -> HashMap<String, ColumnConverter> {
        oracle_converter_suite()
    }

    fn qualified_table(&self, table: &str) -> String {
        if table.contains('.') {
            table.to_string()
        } else {
            format!("{}.{}", self.connection.schema, table)
        }
    }

    /// Runs a script through `sqlplus -s`, failing on any ORA or SP2 error in
    /// the output.
    async fn run_script(&self, script: &str) -> BargeResult<String> {
        let mut child = Command::new("sqlplus")
            .arg("-s")
            .arg("-l")
            .arg(self.connection.oracle_connect_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                crate::barge_error!(
                    ErrorKind::LoaderClientFailed,
                    "Could not invoke sqlplus; is the Oracle client installed?"
                )
                .with_source(err)
            })?;

        let input = format!(
            "SET HEADING OFF FEEDBACK OFF PAGESIZE 0 VERIFY OFF ECHO OFF\n\
             WHENEVER SQLERROR EXIT FAILURE ROLLBACK\n\
             {script}\nEXIT;\n"
        );
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(input.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success()
            || stdout.contains("ORA-")
            || stdout.contains("SP2-")
        {
            warn!(%stdout, %stderr, "sqlplus script failed");
            return Err(classify_ora_failure(
                "SQL*Plus script failed",
                &format!("{stdout}\n{stderr}"),
            ));
        }

        Ok(stdout)
    }

    async fn query_single(&self, query: &str) -> BargeResult<Option<String>> {
        let lines = self.query_lines(query).await?;
        Ok(lines.into_iter().next())
    }

    async fn query_lines(&self, query: &str) -> BargeResult<Vec<String>> {
        let output = self.run_script(&format!("{query};")).await?;

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

fn key_predicates(event: &Event) -> Vec<String> {
    event
        .key
        .iter()
        .map(|(column, value)| match value {
            Some(value) => format!("{column} = {value}"),
            None => format!("{column} IS NULL"),
        })
        .collect()
}

/// Builds the SQL*Loader control file for one batch.
fn control_file(table: &str, data_file: &str, args: &ImportBatchArgs) -> String {
    let columns = if args.columns.is_empty() {
        String::new()
    } else {
        let specs: Vec<String> = args
            .columns
            .iter()
            .map(|col| format!("{col} NULLIF {col}='{}'", args.null_string))
            .collect();
        format!("({})", specs.join(", "))
    };

    let delimiter = if args.delimiter == '\t' {
        "\\t".to_string()
    } else {
        args.delimiter.to_string()
    };

    format!(
        "LOAD DATA\nINFILE '{data_file}'\nAPPEND\nINTO TABLE {table}\n\
         REENABLE DISABLED_CONSTRAINTS\nFIELDS TERMINATED BY '{delimiter}'\n{columns}"
    )
}

/// Pulls the loaded row count out of a SQL*Loader log.
fn parse_rows_loaded(log: &str) -> Option<i64> {
    log.lines().find_map(|line| {
        let line = line.trim();
        line.strip_suffix("Rows successfully loaded.")
            .or_else(|| line.strip_suffix("Row successfully loaded."))
            .and_then(|prefix| prefix.trim().parse::<i64>().ok())
    })
}

fn classify_ora_failure(description: &'static str, detail: &str) -> BargeError {
    let retryable = RETRYABLE_ORA_CODES
        .iter()
        .any(|code| detail.contains(code));

    let kind = if retryable {
        ErrorKind::CopyRetryable
    } else {
        ErrorKind::CopyRejected
    };

    BargeError::new(kind, description).with_detail(detail)
}

fn parse_number(raw: &str) -> BargeResult<i64> {
    raw.trim().parse::<i64>().map_err(|err| {
        crate::barge_error!(
            ErrorKind::TargetQueryFailed,
            "Expected a number from the target",
            raw
        )
        .with_source(err)
    })
}

fn sql_escape(value: &str) -> String {
    value.replace('\'', "''")
}

fn sanitize(identifier: &str) -> String {
    identifier
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::descriptor::FileFormat;

    #[test]
    fn control_file_targets_quoted_table_with_nullif_columns() {
        let args = ImportBatchArgs {
            table_name: "\"ORDER\"".to_string(),
            columns: vec!["ID".to_string(), "TOTAL".to_string()],
            file_format: FileFormat::Text,
            delimiter: '\t',
            has_header: false,
            quote_char: None,
            escape_char: None,
            null_string: "\\N".to_string(),
            rows_per_transaction: 4096,
        };

        let rendered = control_file("sales.\"ORDER\"", "/tmp/batch-1", &args);

        assert!(rendered.contains("INTO TABLE sales.\"ORDER\""));
        assert!(rendered.contains("INFILE '/tmp/batch-1'"));
        assert!(rendered.contains("FIELDS TERMINATED BY '\\t'"));
        assert!(rendered.contains("ID NULLIF ID='\\N'"));
        assert!(rendered.contains("REENABLE DISABLED_CONSTRAINTS"));
    }

    #[test]
    fn rows_loaded_is_parsed_from_the_log() {
        let log = "\n  Table SALES.ORDERS:\n  4096 Rows successfully loaded.\n  0 Rows not loaded due to data errors.\n";
        assert_eq!(parse_rows_loaded(log), Some(4096));

        let singular = "  1 Row successfully loaded.\n";
        assert_eq!(parse_rows_loaded(singular), Some(1));

        assert_eq!(parse_rows_loaded("no counts here"), None);
    }

    #[test]
    fn ora_failures_classify_by_code() {
        let transient = classify_ora_failure("SQL*Loader failed", "ORA-12541: TNS no listener");
        assert!(transient.is_retryable());

        let rejected =
            classify_ora_failure("SQL*Loader failed", "ORA-00001: unique constraint violated");
        assert!(!rejected.is_retryable());
    }

    fn oracle() -> OracleDb {
        let connection: TargetConnectionConfig = serde_json::from_str(
            r#"{
                "host": "localhost",
                "port": 1521,
                "database": "ORCLPDB",
                "username": "migrator",
                "password": "secret",
                "schema": "SALES"
            }"#,
        )
        .unwrap();
        OracleDb::new(connection, PathBuf::from("/tmp/export"))
    }

    #[test]
    fn event_statements_embed_formatted_literals() {
        let db = oracle();
        let event = Event {
            op: EventOp::Update,
            vsn: 5,
            schema_name: "sales".to_string(),
            table_name: "\"ORDER\"".to_string(),
            key: BTreeMap::from([("ID".to_string(), Some("7".to_string()))]),
            fields: BTreeMap::from([("TOTAL".to_string(), Some("'99.5'".to_string()))]),
        };

        let sql = db.event_statement(&event).unwrap();
        assert_eq!(
            sql,
            "UPDATE SALES.\"ORDER\" SET TOTAL = '99.5' WHERE ID = 7"
        );
    }

    #[test]
    fn delete_statement_folds_null_keys() {
        let db = oracle();
        let event = Event {
            op: EventOp::Delete,
            vsn: 6,
            schema_name: "sales".to_string(),
            table_name: "orders".to_string(),
            key: BTreeMap::from([
                ("ID".to_string(), Some("7".to_string())),
                ("REGION".to_string(), None),
            ]),
            fields: BTreeMap::new(),
        };

        let sql = db.event_statement(&event).unwrap();
        assert_eq!(
            sql,
            "DELETE FROM SALES.orders WHERE ID = 7 AND REGION IS NULL"
        );
    }
}
