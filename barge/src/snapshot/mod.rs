//! Snapshot import: splits staged data files into resumable batches and
//! drives their parallel bulk load into the target.
//!
//! Files are processed one at a time; batches within a file load in parallel
//! through a bounded worker pool. Every batch transition is durable before the
//! next step, so a crashed run resumes by replaying pending batches and
//! continuing the split at the last recorded offset.

mod data_file;
mod pool;

pub use data_file::DataFile;
pub use pool::BatchImportPool;

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use barge_config::shared::RetryConfig;

use crate::convert::ValueConverter;
use crate::descriptor::{DATA_DIR_NAME, DataFileDescriptor, FileFormat};
use crate::error::{BargeResult, ErrorKind};
use crate::pipeline::ImportContext;
use crate::state::ImportDataState;
use crate::target::{ImportBatchArgs, TargetDb};
use crate::types::{Batch, FileImportState, ImportFileTask};

/// Splits tasks by their recorded import state. Pending tasks come back with
/// in-progress files first so interrupted work resumes before new work starts.
pub async fn classify_tasks(
    state: &ImportDataState,
    tasks: Vec<ImportFileTask>,
) -> BargeResult<(Vec<ImportFileTask>, Vec<ImportFileTask>)> {
    let mut in_progress = Vec::new();
    let mut not_started = Vec::new();
    let mut completed = Vec::new();

    for task in tasks {
        let file_key = file_key(&task);
        match state.file_import_state(&file_key, &task.table_name).await? {
            FileImportState::Completed => completed.push(task),
            FileImportState::InProgress => in_progress.push(task),
            FileImportState::NotStarted => not_started.push(task),
        }
    }

    in_progress.extend(not_started);

    Ok((in_progress, completed))
}

/// Imports every pending task, one file at a time.
pub async fn import_data(ctx: &ImportContext, tasks: Vec<ImportFileTask>) -> BargeResult<()> {
    let (pending, completed) = classify_tasks(&ctx.state, tasks).await?;

    if !completed.is_empty() {
        info!(
            tables = ?table_names(&completed),
            "already imported tables"
        );
    }

    if pending.is_empty() {
        info!("all the tables are already imported, nothing left to import");
        return Ok(());
    }
    info!(tables = ?table_names(&pending), "tables to import");

    for task in &pending {
        let mut pool = BatchImportPool::new(ctx.config.snapshot.pool_size());
        import_file(ctx, task, &mut pool).await?;
        // Batches within a file run in parallel; completion is serialized
        // per file.
        pool.wait_all().await?;
        info!(table_name = %task.table_name, "file import finished");
    }

    Ok(())
}

async fn import_file(
    ctx: &ImportContext,
    task: &ImportFileTask,
    pool: &mut BatchImportPool,
) -> BargeResult<()> {
    let file_key = file_key(task);
    let args_proto = import_batch_args(ctx, &task.table_name);
    info!(table_name = %task.table_name, file = %file_key, "start splitting data file");

    ctx.state
        .prepare_for_file_import(&file_key, &task.table_name)
        .await?;
    let recovered = ctx.state.recover(&file_key, &task.table_name).await?;

    for batch in recovered.pending_batches {
        submit_batch(ctx, pool, batch, &args_proto).await?;
    }

    if !recovered.fully_split {
        let data_file_path = ctx.config.export_dir.join(DATA_DIR_NAME).join(&task.file_path);
        let columns = ctx
            .table_columns
            .get(&task.table_name)
            .cloned()
            .unwrap_or_default();

        split_file(
            &ctx.state,
            &ctx.converter,
            &ctx.descriptor,
            &columns,
            &file_key,
            &task.table_name,
            &data_file_path,
            ctx.config.snapshot.batch_size,
            ctx.target.max_batch_size_in_bytes(),
            recovered.last_batch_number,
            recovered.last_offset,
            async |batch| submit_batch(ctx, pool, batch, &args_proto).await,
        )
        .await?;
    }

    Ok(())
}

/// Splits one data file into batch files, resuming at `last_offset`.
///
/// A batch closes when any of: the configured row count is reached, the
/// target's byte cap is reached, or end-of-file. The batch number only
/// advances when another batch actually begins.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn split_file<F>(
    state: &ImportDataState,
    converter: &ValueConverter,
    descriptor: &DataFileDescriptor,
    columns: &[String],
    file_key: &str,
    table_name: &str,
    data_file_path: &Path,
    batch_size: i64,
    max_batch_bytes: i64,
    last_batch_number: i64,
    last_offset: i64,
    mut on_batch: F,
) -> BargeResult<()>
where
    F: AsyncFnMut(Batch) -> BargeResult<()>,
{
    let mut data_file = DataFile::open(data_file_path, descriptor).await?;
    let header = data_file.header().map(str::to_string);

    data_file.skip_lines(last_offset).await?;

    let mut batch_number = last_batch_number + 1;
    let mut lines_taken = last_offset;
    let mut reached_eof = false;

    while !reached_eof {
        let mut writer = state
            .new_batch_writer(file_key, table_name, batch_number, lines_taken)
            .await?;

        if let Some(header) = &header {
            if descriptor.file_format == FileFormat::Csv {
                writer.write_header(header).await?;
            }
        }

        loop {
            let Some(line) = data_file.next_line().await? else {
                reached_eof = true;
                break;
            };

            lines_taken += 1;
            if !line.is_empty() {
                let converted = converter.convert_row(table_name, columns, &line)?;
                writer.write_record(&converted).await?;
            }

            if writer.records_written() >= batch_size
                || data_file.bytes_read() >= max_batch_bytes
            {
                break;
            }
        }

        let batch = writer
            .done(reached_eof, lines_taken, data_file.bytes_read())
            .await?;
        data_file.reset_bytes_read();
        on_batch(batch).await?;

        if !reached_eof {
            batch_number += 1;
        }
    }

    info!(%file_key, %table_name, "done splitting data file");

    Ok(())
}

async fn submit_batch(
    ctx: &ImportContext,
    pool: &mut BatchImportPool,
    batch: Batch,
    args_proto: &ImportBatchArgs,
) -> BargeResult<()> {
    let state = ctx.state.clone();
    let target = ctx.target.clone();
    let retry = ctx.config.retry.clone();
    let migration_uuid = ctx.migration_uuid;
    let args = args_proto.clone();

    pool.submit(async move {
        import_batch_with_retries(state, target, retry, migration_uuid, batch, args).await
    })
    .await
}

/// Loads one batch with up to the configured number of attempts and additive
/// 10 s backoff. Retries stop on errors the adapter classifies as
/// non-retryable.
async fn import_batch_with_retries(
    state: ImportDataState,
    target: std::sync::Arc<TargetDb>,
    retry: RetryConfig,
    migration_uuid: Uuid,
    mut batch: Batch,
    mut args: ImportBatchArgs,
) -> BargeResult<()> {
    state.mark_batch_pending(&mut batch).await?;
    args.rows_per_transaction = batch.offset_end - batch.offset_start;

    let mut sleep_seconds = 0u64;
    let mut last_error = None;

    for attempt in 0..retry.copy_max_retries {
        match target.import_batch(migration_uuid, &batch, &args).await {
            Ok(rows_affected) => {
                state.mark_batch_done(&mut batch, rows_affected).await?;
                info!(
                    table_name = %batch.table_name,
                    batch_number = batch.number,
                    rows_affected,
                    "imported batch"
                );
                return Ok(());
            }
            Err(err) if target.is_non_retryable_copy_error(&err) => return Err(err),
            Err(err) => {
                sleep_seconds = (sleep_seconds + 10).min(retry.max_sleep_seconds);
                warn!(
                    table_name = %batch.table_name,
                    batch_number = batch.number,
                    attempt,
                    sleep_seconds,
                    error = %err,
                    "batch load failed, retrying"
                );
                last_error = Some(err);
                tokio::time::sleep(Duration::from_secs(sleep_seconds)).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        crate::barge_error!(ErrorKind::CopyRetryable, "Batch import retries exhausted")
    }))
}

fn import_batch_args(ctx: &ImportContext, table_name: &str) -> ImportBatchArgs {
    let columns = ctx
        .table_columns
        .get(table_name)
        .cloned()
        .unwrap_or_default();
    let columns = ctx.target.quote_column_names_if_required(&columns);

    let file_format = ctx.descriptor.file_format.load_format();

    ImportBatchArgs {
        table_name: table_name.to_string(),
        columns,
        file_format,
        delimiter: ctx.descriptor.delimiter,
        has_header: ctx.descriptor.has_header && file_format == FileFormat::Csv,
        quote_char: ctx.descriptor.quote_char,
        escape_char: ctx.descriptor.escape_char,
        null_string: ctx.descriptor.null_string.clone(),
        rows_per_transaction: 0,
    }
}

pub(crate) fn file_key(task: &ImportFileTask) -> String {
    task.file_path.display().to_string()
}

fn table_names(tasks: &[ImportFileTask]) -> Vec<&str> {
    let mut names: Vec<&str> = tasks.iter().map(|t| t.table_name.as_str()).collect();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    use crate::convert::{ValueConverter, yugabyte_converter_suite};
    use crate::types::BatchState;

    const FILE: &str = "orders_data.csv";
    const TABLE: &str = "orders";

    fn descriptor(has_header: bool) -> DataFileDescriptor {
        DataFileDescriptor {
            file_format: FileFormat::Csv,
            delimiter: ',',
            has_header,
            quote_char: Some(b'"'),
            escape_char: Some(b'"'),
            null_string: "\\N".to_string(),
            data_file_list: vec![],
            table_columns: HashMap::new(),
        }
    }

    async fn split_fixture(
        contents: &str,
        has_header: bool,
        batch_size: i64,
        last_batch_number: i64,
        last_offset: i64,
    ) -> (ImportDataState, Vec<Batch>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join(FILE);
        std::fs::write(&data_path, contents).unwrap();

        let descriptor = descriptor(has_header);
        let state = ImportDataState::open(dir.path()).await.unwrap();
        state.prepare_for_file_import(FILE, TABLE).await.unwrap();
        let converter =
            ValueConverter::load(dir.path(), &descriptor, yugabyte_converter_suite()).unwrap();

        let mut batches = Vec::new();
        split_file(
            &state,
            &converter,
            &descriptor,
            &["id".to_string(), "total".to_string()],
            FILE,
            TABLE,
            &data_path,
            batch_size,
            i64::MAX,
            last_batch_number,
            last_offset,
            async |batch| {
                batches.push(batch);
                Ok(())
            },
        )
        .await
        .unwrap();

        (state, batches, dir)
    }

    fn rows(count: usize, header: bool) -> String {
        let mut contents = String::new();
        if header {
            contents.push_str("id,total\n");
        }
        for i in 0..count {
            contents.push_str(&format!("{i},{}\n", i * 10));
        }
        contents
    }

    #[tokio::test]
    async fn batches_partition_the_file() {
        let (_state, batches, _dir) = split_fixture(&rows(10_000, true), true, 4096, 0, 0).await;

        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches
                .iter()
                .map(|b| (b.number, b.offset_start, b.offset_end, b.record_count))
                .collect::<Vec<_>>(),
            vec![(1, 0, 4096, 4096), (2, 4096, 8192, 4096), (3, 8192, 10_000, 1808)]
        );
        assert!(batches.iter().all(|b| b.state == BatchState::Created));

        // Every batch file repeats the header before its rows.
        for batch in &batches {
            let contents = std::fs::read_to_string(&batch.batch_file).unwrap();
            assert!(contents.starts_with("id,total\n"));
            assert_eq!(
                contents.lines().count() as i64,
                batch.record_count + 1,
                "batch {} line count",
                batch.number
            );
        }
    }

    #[tokio::test]
    async fn single_small_file_is_one_batch() {
        let (_state, batches, _dir) = split_fixture(&rows(500, false), false, 4096, 0, 0).await;

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].offset_end, 500);
        assert_eq!(batches[0].record_count, 500);
    }

    #[tokio::test]
    async fn missing_trailing_newline_still_counts_the_last_record() {
        let contents = "1,10\n2,20\n3,30";
        let (_state, batches, _dir) = split_fixture(contents, false, 4096, 0, 0).await;

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].record_count, 3);
        assert_eq!(batches[0].offset_end, 3);
    }

    #[tokio::test]
    async fn resume_does_not_reread_covered_offsets() {
        // Offsets 0..12288 were covered before the crash; splitting resumes
        // at batch 4.
        let (state, batches, _dir) =
            split_fixture(&rows(10_000, true), true, 4096, 3, 8192).await;

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].number, 4);
        assert_eq!(batches[0].offset_start, 8192);
        assert_eq!(batches[0].offset_end, 10_000);

        let recovered = state.recover(FILE, TABLE).await.unwrap();
        assert!(recovered.fully_split);
    }

    #[tokio::test]
    async fn exact_multiple_emits_a_final_empty_batch() {
        let (_state, batches, _dir) = split_fixture(&rows(8, false), false, 4, 0, 0).await;

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].record_count, 0);
        assert_eq!(batches[2].offset_start, 8);
        assert_eq!(batches[2].offset_end, 8);
    }

    #[tokio::test]
    async fn classify_orders_in_progress_before_not_started() {
        let dir = tempdir().unwrap();
        let state = ImportDataState::open(dir.path()).await.unwrap();

        let fresh = ImportFileTask {
            id: 0,
            file_path: "a.csv".into(),
            table_name: "a".to_string(),
        };
        let started = ImportFileTask {
            id: 1,
            file_path: "b.csv".into(),
            table_name: "b".to_string(),
        };
        state.prepare_for_file_import("b.csv", "b").await.unwrap();

        let (pending, completed) =
            classify_tasks(&state, vec![fresh.clone(), started.clone()]).await.unwrap();

        assert_eq!(pending, vec![started, fresh]);
        assert!(completed.is_empty());
    }
}
