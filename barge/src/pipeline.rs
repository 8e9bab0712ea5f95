//! End-to-end wiring of one import run.
//!
//! Builds the dependency bundle every subsystem shares and exposes one entry
//! point per phase: [`run_snapshot_import`] for the bulk load of staged data
//! files and [`run_change_streaming`] for CDC apply, so an embedding binary
//! can run them back to back or resume streaming alone in a later process.
//! The binary owns flag parsing and the terminal; it hands over a validated
//! [`MigrationConfig`] and a confirmation callback for the start-clean
//! prompt.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use barge_config::shared::{MigrationConfig, TargetDbType};

use crate::bail;
use crate::convert::ValueConverter;
use crate::descriptor::{
    DATA_DIR_NAME, DataFileDescriptor, ExportStatus, SourceDbType, check_export_data_done,
    discover_source_db_type, load_or_create_migration_uuid,
};
use crate::error::{BargeResult, ErrorKind};
use crate::snapshot::{self, DataFile, file_key};
use crate::state::ImportDataState;
use crate::stream;
use crate::target::{TargetDb, identifier};
use crate::types::ImportFileTask;

/// Operator confirmation callback for destructive choices.
pub type ConfirmFn = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Returns a confirmation callback that prompts on the controlling terminal.
pub fn stdin_confirm() -> ConfirmFn {
    Box::new(|question| {
        print!("{question} (y/N): ");
        let _ = std::io::stdout().flush();

        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }

        matches!(answer.trim(), "y" | "Y" | "yes" | "YES")
    })
}

/// Shared dependency bundle of one import run.
///
/// Everything here is built once before any worker starts and is read-only
/// afterwards; workers share it through cheap clones and reference counts.
pub struct ImportContext {
    pub config: MigrationConfig,
    pub descriptor: DataFileDescriptor,
    pub source_db: SourceDbType,
    pub migration_uuid: Uuid,
    pub state: ImportDataState,
    pub target: Arc<TargetDb>,
    pub converter: Arc<ValueConverter>,
    pub table_columns: Arc<HashMap<String, Vec<String>>>,
}

/// Builds the shared context of one run: gate checks, discovery, target and
/// converter initialization, task filtering. Both phase entry points start
/// here, so either phase can run in a process of its own.
async fn prepare_context(
    config: MigrationConfig,
) -> BargeResult<(ImportContext, Vec<ImportFileTask>)> {
    config.validate().map_err(|err| {
        crate::barge_error!(ErrorKind::ConfigInvalid, "Invalid migration configuration")
            .with_source(err)
    })?;

    check_export_data_done(&config.export_dir)?;
    let source_db = discover_source_db_type(&config.export_dir)?;
    let migration_uuid = load_or_create_migration_uuid(&config.export_dir)?;

    let mut descriptor = DataFileDescriptor::open(&config.export_dir)?;
    quote_table_names_if_required(&mut descriptor, config.target.db_type);

    let mut target = TargetDb::new(&config, source_db);
    target.init().await?;
    let version = target.version().await?;
    info!(target = config.target.db_type.as_str(), %version, "connected to target");

    target.create_metadata_schema().await?;
    target.init_conn_pool(config.snapshot.parallelism).await?;

    let converter = Arc::new(ValueConverter::load(
        &config.export_dir,
        &descriptor,
        target.converter_suite(),
    )?);
    let target = Arc::new(target);
    let state = ImportDataState::open(&config.export_dir).await?;

    let tasks = apply_table_list_filter(&config, descriptor.discover_tasks())?;
    let table_columns = Arc::new(build_table_columns(&config, &descriptor, &tasks).await?);

    let ctx = ImportContext {
        config,
        descriptor,
        source_db,
        migration_uuid,
        state,
        target,
        converter,
        table_columns,
    };

    Ok((ctx, tasks))
}

/// Runs the snapshot phase: start-clean handling, then splitting and bulk
/// loading every pending data file.
///
/// Snapshot-only migrations restore sequences right away; live migrations
/// leave that to [`run_change_streaming`], which restores them after cutover.
pub async fn run_snapshot_import(config: MigrationConfig, confirm: ConfirmFn) -> BargeResult<()> {
    let (ctx, tasks) = prepare_context(config).await?;

    info!(database = %ctx.config.target.connection.database, "import of data started");

    if ctx.config.start_clean {
        clean_import_state(&ctx, &tasks, &confirm).await?;
    }

    snapshot::import_data(&ctx, tasks).await?;

    if !ctx.config.change_streaming {
        let status = ExportStatus::read(&ctx.config.export_dir)?;
        ctx.target.restore_sequences(&status.sequences).await?;
    }
    ctx.target.finalize().await;

    info!("snapshot import complete");

    Ok(())
}

/// Runs the change streaming phase until a fatal error or cutover.
///
/// Callable on its own, e.g. to resume streaming after the snapshot finished
/// in an earlier process.
pub async fn run_change_streaming(config: MigrationConfig) -> BargeResult<()> {
    let (ctx, _tasks) = prepare_context(config).await?;

    info!("streaming changes to the target");
    stream::stream_changes(&ctx).await?;

    let status = ExportStatus::read(&ctx.config.export_dir)?;
    ctx.target.restore_sequences(&status.sequences).await?;
    ctx.target.finalize().await;

    Ok(())
}

/// Oracle folds unquoted names, so reserved or case-sensitive table names are
/// wrapped in double quotes before any splitting starts. The exported column
/// map must be rekeyed at the same time; batch records and bookkeeping rows
/// all use the quoted form.
pub fn quote_table_names_if_required(
    descriptor: &mut DataFileDescriptor,
    target_db_type: TargetDbType,
) {
    if target_db_type != TargetDbType::Oracle {
        return;
    }

    for entry in &mut descriptor.data_file_list {
        if identifier::is_quoted(&entry.table_name) {
            continue;
        }

        if identifier::is_reserved_oracle(&entry.table_name)
            || identifier::is_case_sensitive_oracle(&entry.table_name)
        {
            let quoted = identifier::quote(&entry.table_name);
            if let Some(columns) = descriptor.table_columns.remove(&entry.table_name) {
                descriptor.table_columns.insert(quoted.clone(), columns);
            }
            entry.table_name = quoted;
        }
    }
}

/// Applies the include/exclude lists. Unknown names in either list abort
/// before any work starts; the lists are case-sensitive.
pub fn apply_table_list_filter(
    config: &MigrationConfig,
    tasks: Vec<ImportFileTask>,
) -> BargeResult<Vec<ImportFileTask>> {
    let mut known: Vec<String> = tasks.iter().map(|t| t.table_name.clone()).collect();
    known.sort();
    known.dedup();

    let unknown = config.tables.unknown_names(&known);
    if !unknown.is_empty() {
        bail!(
            ErrorKind::ConfigInvalid,
            "Unknown table names in the include/exclude lists",
            format!("unknown: {unknown:?}, valid: {known:?}")
        );
    }

    Ok(tasks
        .into_iter()
        .filter(|task| {
            let keep = config.tables.should_import(&task.table_name);
            if !keep {
                info!(table_name = %task.table_name, "skipping table due to table list filter");
            }
            keep
        })
        .collect())
}

/// Builds the read-only table-to-columns map used by row conversion, COPY
/// column lists, and event statements.
///
/// The descriptor's exported column map wins; without one, the CSV headers
/// are the source of truth.
pub async fn build_table_columns(
    config: &MigrationConfig,
    descriptor: &DataFileDescriptor,
    tasks: &[ImportFileTask],
) -> BargeResult<HashMap<String, Vec<String>>> {
    let mut table_columns = HashMap::new();

    for task in tasks {
        if let Some(columns) = descriptor.table_columns.get(&task.table_name) {
            table_columns.insert(task.table_name.clone(), columns.clone());
            continue;
        }

        if descriptor.has_header {
            let path = config.export_dir.join(DATA_DIR_NAME).join(&task.file_path);
            let data_file = DataFile::open(&path, descriptor).await?;
            let Some(header) = data_file.header() else {
                continue;
            };

            let columns: Vec<String> = header
                .split(descriptor.delimiter)
                .map(str::to_string)
                .collect();
            info!(table_name = %task.table_name, ?columns, "read column names from file header");
            table_columns.insert(task.table_name.clone(), columns);
        }
    }

    Ok(table_columns)
}

/// Start-clean: warn about non-empty target tables, then purge all local
/// batch state and the Oracle loader scratch directory.
async fn clean_import_state(
    ctx: &ImportContext,
    tasks: &[ImportFileTask],
    confirm: &ConfirmFn,
) -> BargeResult<()> {
    let mut table_names: Vec<String> = tasks.iter().map(|t| t.table_name.clone()).collect();
    table_names.sort();
    table_names.dedup();

    let non_empty = ctx.target.non_empty_tables(&table_names).await;
    if !non_empty.is_empty() {
        warn!(
            tables = ?non_empty,
            "tables are not empty; truncate them before importing with start-clean"
        );
        let question = format!(
            "The following tables are not empty: {}. Do you want to continue without truncating them?",
            non_empty.join(", ")
        );
        if !confirm(&question) {
            bail!(ErrorKind::Aborted, "Aborting import");
        }
    }

    for task in tasks {
        ctx.state.clean(&file_key(task), &task.table_name).await?;
    }

    let sqlldr_dir = ctx.config.export_dir.join(crate::target::SQLLDR_DIR_NAME);
    if sqlldr_dir.exists() {
        tokio::fs::remove_dir_all(&sqlldr_dir).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DataFileEntry, FileFormat};

    fn descriptor_with(tables: &[&str]) -> DataFileDescriptor {
        DataFileDescriptor {
            file_format: FileFormat::Csv,
            delimiter: ',',
            has_header: false,
            quote_char: None,
            escape_char: None,
            null_string: "\\N".to_string(),
            data_file_list: tables
                .iter()
                .map(|t| DataFileEntry {
                    file_path: format!("{t}_data.csv"),
                    table_name: t.to_string(),
                    row_count: 0,
                    file_size: 0,
                })
                .collect(),
            table_columns: tables
                .iter()
                .map(|t| (t.to_string(), vec!["ID".to_string()]))
                .collect(),
        }
    }

    #[test]
    fn oracle_reserved_table_names_are_quoted_and_rekeyed() {
        let mut descriptor = descriptor_with(&["ORDER", "ORDERS"]);

        quote_table_names_if_required(&mut descriptor, TargetDbType::Oracle);

        assert_eq!(descriptor.data_file_list[0].table_name, "\"ORDER\"");
        assert_eq!(descriptor.data_file_list[1].table_name, "ORDERS");
        assert!(descriptor.table_columns.contains_key("\"ORDER\""));
        assert!(!descriptor.table_columns.contains_key("ORDER"));
        assert!(descriptor.table_columns.contains_key("ORDERS"));
    }

    #[test]
    fn yugabyte_targets_keep_table_names_untouched() {
        let mut descriptor = descriptor_with(&["ORDER"]);

        quote_table_names_if_required(&mut descriptor, TargetDbType::Yugabytedb);

        assert_eq!(descriptor.data_file_list[0].table_name, "ORDER");
    }

    fn config_with_filters(include: &[&str], exclude: &[&str]) -> MigrationConfig {
        let json = format!(
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
                "tables": {{"include": {include:?}, "exclude": {exclude:?}}}
            }}"#
        );
        serde_json::from_str(&json).unwrap()
    }

    fn tasks() -> Vec<ImportFileTask> {
        vec![
            ImportFileTask {
                id: 0,
                file_path: "orders_data.csv".into(),
                table_name: "orders".to_string(),
            },
            ImportFileTask {
                id: 1,
                file_path: "items_data.csv".into(),
                table_name: "items".to_string(),
            },
        ]
    }

    #[test]
    fn filter_keeps_included_tables_only() {
        let config = config_with_filters(&["orders"], &[]);
        let filtered = apply_table_list_filter(&config, tasks()).unwrap();

        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].table_name, "orders");
    }

    #[test]
    fn filter_rejects_unknown_names() {
        let config = config_with_filters(&["orderz"], &[]);
        let err = apply_table_list_filter(&config, tasks()).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert!(err.detail().is_some_and(|d| d.contains("orderz")));
    }

    #[tokio::test]
    async fn table_columns_fall_back_to_file_headers() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join(DATA_DIR_NAME);
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("orders_data.csv"), "id,total\n1,10\n").unwrap();

        let mut config = config_with_filters(&[], &[]);
        config.export_dir = dir.path().to_path_buf();

        let mut descriptor = descriptor_with(&["orders"]);
        descriptor.has_header = true;
        descriptor.table_columns.clear();

        let tasks = vec![ImportFileTask {
            id: 0,
            file_path: "orders_data.csv".into(),
            table_name: "orders".to_string(),
        }];

        let columns = build_table_columns(&config, &descriptor, &tasks).await.unwrap();
        assert_eq!(
            columns["orders"],
            vec!["id".to_string(), "total".to_string()]
        );
    }
}
