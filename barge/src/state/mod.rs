//! Durable local state of one import run.
//!
//! Everything the engine must remember across crashes lives in a file-backed
//! SQLite database under the export directory: file-import progress, batch
//! lifecycle states, processed queue segments, and the exporter's event
//! counters. Every transition is a transaction and is fsync-visible before the
//! corresponding side effect is acknowledged to callers.

mod batch_writer;

pub use batch_writer::BatchWriter;

use std::path::{Path, PathBuf};

use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::debug;

use crate::descriptor::META_INFO_DIR_NAME;
use crate::error::BargeResult;
use crate::types::{Batch, BatchState, FileImportState};

/// Result of [`ImportDataState::recover`]: everything needed to resume a
/// partially imported file.
///
/// Replaying `pending_batches` and resuming splitting at `last_offset`
/// reproduces the same coverage as an uninterrupted run.
#[derive(Debug)]
pub struct RecoveredFileImport {
    /// Every batch still in the created or pending state.
    pub pending_batches: Vec<Batch>,
    /// Largest batch number ever allocated for the file, 0 if none.
    pub last_batch_number: i64,
    /// Largest end offset ever covered by a batch, 0 if none.
    pub last_offset: i64,
    /// Whether splitting previously reached end-of-file.
    pub fully_split: bool,
}

/// Durable records of file, batch, and segment progress.
///
/// Cloning is cheap; all clones share one connection pool. The pool holds a
/// single connection, which serializes the store's own writes.
#[derive(Debug, Clone)]
pub struct ImportDataState {
    pool: SqlitePool,
    batches_dir: PathBuf,
}

impl ImportDataState {
    /// Opens (creating if necessary) the state database under `export_dir`.
    pub async fn open(export_dir: &Path) -> BargeResult<Self> {
        let state_dir = export_dir.join(META_INFO_DIR_NAME).join("import_data_state");
        tokio::fs::create_dir_all(&state_dir).await?;

        let db_path = state_dir.join("state.db");
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let state = Self {
            pool,
            batches_dir: state_dir.join("batches"),
        };
        state.create_tables().await?;

        Ok(state)
    }

    async fn create_tables(&self) -> BargeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_imports (
                file_path   TEXT NOT NULL,
                table_name  TEXT NOT NULL,
                fully_split INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (file_path, table_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batches (
                file_path     TEXT NOT NULL,
                table_name    TEXT NOT NULL,
                batch_number  INTEGER NOT NULL,
                offset_start  INTEGER NOT NULL,
                offset_end    INTEGER NOT NULL,
                byte_count    INTEGER NOT NULL,
                record_count  INTEGER NOT NULL,
                batch_file    TEXT NOT NULL,
                state         TEXT NOT NULL,
                rows_affected INTEGER,
                PRIMARY KEY (file_path, table_name, batch_number)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_segments (
                segment_num     INTEGER PRIMARY KEY,
                processed       INTEGER NOT NULL DEFAULT 0,
                exported_events INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns the import state of one (file, table).
    ///
    /// A file is completed iff splitting reached end-of-file and every emitted
    /// batch is done.
    pub async fn file_import_state(
        &self,
        file_path: &str,
        table_name: &str,
    ) -> BargeResult<FileImportState> {
        let row = sqlx::query(
            "SELECT fully_split FROM file_imports WHERE file_path = ?1 AND table_name = ?2",
        )
        .bind(file_path)
        .bind(table_name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(FileImportState::NotStarted);
        };
        let fully_split: i64 = row.try_get("fully_split")?;

        if fully_split != 0 {
            let not_done: i64 = sqlx::query(
                "SELECT COUNT(*) AS n FROM batches \
                 WHERE file_path = ?1 AND table_name = ?2 AND state != 'done'",
            )
            .bind(file_path)
            .bind(table_name)
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

            if not_done == 0 {
                return Ok(FileImportState::Completed);
            }
        }

        Ok(FileImportState::InProgress)
    }

    /// Transitions a (file, table) to in-progress. Idempotent on re-entry.
    pub async fn prepare_for_file_import(
        &self,
        file_path: &str,
        table_name: &str,
    ) -> BargeResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO file_imports (file_path, table_name, fully_split) \
             VALUES (?1, ?2, 0)",
        )
        .bind(file_path)
        .bind(table_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Collects everything needed to resume the import of one file.
    pub async fn recover(
        &self,
        file_path: &str,
        table_name: &str,
    ) -> BargeResult<RecoveredFileImport> {
        let rows = sqlx::query(
            "SELECT batch_number, offset_start, offset_end, byte_count, record_count, \
                    batch_file, state \
             FROM batches WHERE file_path = ?1 AND table_name = ?2 \
             ORDER BY batch_number",
        )
        .bind(file_path)
        .bind(table_name)
        .fetch_all(&self.pool)
        .await?;

        let mut pending_batches = Vec::new();
        let mut last_batch_number = 0i64;
        let mut last_offset = 0i64;

        for row in rows {
            let number: i64 = row.try_get("batch_number")?;
            let offset_end: i64 = row.try_get("offset_end")?;
            let state = BatchState::parse(row.try_get::<String, _>("state")?.as_str())?;

            last_batch_number = last_batch_number.max(number);
            last_offset = last_offset.max(offset_end);

            if state != BatchState::Done {
                pending_batches.push(Batch {
                    file_path: file_path.to_string(),
                    table_name: table_name.to_string(),
                    number,
                    offset_start: row.try_get("offset_start")?,
                    offset_end,
                    byte_count: row.try_get("byte_count")?,
                    record_count: row.try_get("record_count")?,
                    batch_file: PathBuf::from(row.try_get::<String, _>("batch_file")?),
                    state,
                });
            }
        }

        let fully_split: Option<i64> = sqlx::query(
            "SELECT fully_split FROM file_imports WHERE file_path = ?1 AND table_name = ?2",
        )
        .bind(file_path)
        .bind(table_name)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.try_get("fully_split"))
        .transpose()?;

        debug!(
            %file_path,
            %table_name,
            pending = pending_batches.len(),
            last_batch_number,
            last_offset,
            "recovered file import state"
        );

        Ok(RecoveredFileImport {
            pending_batches,
            last_batch_number,
            last_offset,
            fully_split: fully_split.unwrap_or(0) != 0,
        })
    }

    /// Allocates a fresh batch file and returns a writer for it.
    pub async fn new_batch_writer(
        &self,
        file_path: &str,
        table_name: &str,
        batch_number: i64,
        offset_start: i64,
    ) -> BargeResult<BatchWriter> {
        BatchWriter::create(
            self.clone(),
            file_path.to_string(),
            table_name.to_string(),
            batch_number,
            offset_start,
        )
        .await
    }

    /// Records a finalized batch as created; with `is_last` also marks the
    /// file as fully split, in the same transaction.
    ///
    /// Uses replace semantics so re-splitting after a crash between the batch
    /// file rename and this record is idempotent.
    pub(crate) async fn register_batch(&self, batch: &Batch, is_last: bool) -> BargeResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR REPLACE INTO batches \
             (file_path, table_name, batch_number, offset_start, offset_end, \
              byte_count, record_count, batch_file, state, rows_affected) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'created', NULL)",
        )
        .bind(&batch.file_path)
        .bind(&batch.table_name)
        .bind(batch.number)
        .bind(batch.offset_start)
        .bind(batch.offset_end)
        .bind(batch.byte_count)
        .bind(batch.record_count)
        .bind(batch.batch_file.display().to_string())
        .execute(&mut *tx)
        .await?;

        if is_last {
            sqlx::query(
                "UPDATE file_imports SET fully_split = 1 \
                 WHERE file_path = ?1 AND table_name = ?2",
            )
            .bind(&batch.file_path)
            .bind(&batch.table_name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    /// Marks a batch as picked up by a worker.
    pub async fn mark_batch_pending(&self, batch: &mut Batch) -> BargeResult<()> {
        sqlx::query(
            "UPDATE batches SET state = 'pending' \
             WHERE file_path = ?1 AND table_name = ?2 AND batch_number = ?3",
        )
        .bind(&batch.file_path)
        .bind(&batch.table_name)
        .bind(batch.number)
        .execute(&self.pool)
        .await?;
        batch.state = BatchState::Pending;

        Ok(())
    }

    /// Marks a batch as done, recording the rows-affected count reported by
    /// the target.
    pub async fn mark_batch_done(&self, batch: &mut Batch, rows_affected: i64) -> BargeResult<()> {
        sqlx::query(
            "UPDATE batches SET state = 'done', rows_affected = ?4 \
             WHERE file_path = ?1 AND table_name = ?2 AND batch_number = ?3",
        )
        .bind(&batch.file_path)
        .bind(&batch.table_name)
        .bind(batch.number)
        .bind(rows_affected)
        .execute(&self.pool)
        .await?;
        batch.state = BatchState::Done;

        Ok(())
    }

    /// Purges all batch records and batch files for one (file, table).
    pub async fn clean(&self, file_path: &str, table_name: &str) -> BargeResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM batches WHERE file_path = ?1 AND table_name = ?2")
            .bind(file_path)
            .bind(table_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM file_imports WHERE file_path = ?1 AND table_name = ?2")
            .bind(file_path)
            .bind(table_name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let dir = self.batch_dir(file_path, table_name);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }

        Ok(())
    }

    /// Sums record counts over done batches for one (file, table).
    pub async fn imported_row_count(
        &self,
        file_path: &str,
        table_name: &str,
    ) -> BargeResult<i64> {
        let count: i64 = sqlx::query(
            "SELECT COALESCE(SUM(record_count), 0) AS n FROM batches \
             WHERE file_path = ?1 AND table_name = ?2 AND state = 'done'",
        )
        .bind(file_path)
        .bind(table_name)
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;

        Ok(count)
    }

    /// Sums byte counts over done batches for one (file, table).
    pub async fn imported_byte_count(
        &self,
        file_path: &str,
        table_name: &str,
    ) -> BargeResult<i64> {
        let count: i64 = sqlx::query(
            "SELECT COALESCE(SUM(byte_count), 0) AS n FROM batches \
             WHERE file_path = ?1 AND table_name = ?2 AND state = 'done'",
        )
        .bind(file_path)
        .bind(table_name)
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;

        Ok(count)
    }

    /// Terminal transition for an event queue segment.
    pub async fn mark_event_queue_segment_as_processed(
        &self,
        segment_num: i64,
    ) -> BargeResult<()> {
        sqlx::query(
            "INSERT INTO queue_segments (segment_num, processed) VALUES (?1, 1) \
             ON CONFLICT (segment_num) DO UPDATE SET processed = 1",
        )
        .bind(segment_num)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Number of the first segment not yet marked processed.
    pub async fn first_unprocessed_segment(&self) -> BargeResult<i64> {
        let next: i64 = sqlx::query(
            "SELECT COALESCE(MAX(segment_num) + 1, 0) AS n FROM queue_segments \
             WHERE processed = 1",
        )
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;

        Ok(next)
    }

    /// Aggregate count of events the exporter has written to the queue.
    pub async fn total_exported_events(&self) -> BargeResult<i64> {
        let total: i64 =
            sqlx::query("SELECT COALESCE(SUM(exported_events), 0) AS n FROM queue_segments")
                .fetch_one(&self.pool)
                .await?
                .try_get("n")?;

        Ok(total)
    }

    /// Records the exporter-side event count of a segment.
    ///
    /// Written by the exporter through this same store layer; exposed here so
    /// the reporter's remaining-events math has a counterpart to read.
    pub async fn record_exported_events(&self, segment_num: i64, count: i64) -> BargeResult<()> {
        sqlx::query(
            "INSERT INTO queue_segments (segment_num, exported_events) VALUES (?1, ?2) \
             ON CONFLICT (segment_num) DO UPDATE SET exported_events = ?2",
        )
        .bind(segment_num)
        .bind(count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Directory holding the batch files of one (file, table).
    pub(crate) fn batch_dir(&self, file_path: &str, table_name: &str) -> PathBuf {
        self.batches_dir
            .join(format!("{}__{}", sanitize(file_path), sanitize(table_name)))
    }
}

/// Maps an arbitrary identifier to a filesystem-safe directory name. Quoted
/// and schema-qualified table names contain characters paths cannot carry.
fn sanitize(identifier: &str) -> String {
    identifier
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FILE: &str = "orders_data.csv";
    const TABLE: &str = "orders";

    async fn open_state(dir: &Path) -> ImportDataState {
        ImportDataState::open(dir).await.unwrap()
    }

    async fn write_batch(
        state: &ImportDataState,
        number: i64,
        offset_start: i64,
        offset_end: i64,
        is_last: bool,
    ) -> Batch {
        let mut writer = state
            .new_batch_writer(FILE, TABLE, number, offset_start)
            .await
            .unwrap();
        for i in offset_start..offset_end {
            writer.write_record(&format!("{i},row-{i}")).await.unwrap();
        }
        let byte_count = (offset_end - offset_start) * 12;
        writer.done(is_last, offset_end, byte_count).await.unwrap()
    }

    #[tokio::test]
    async fn file_state_progresses_monotonically() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path()).await;

        assert_eq!(
            state.file_import_state(FILE, TABLE).await.unwrap(),
            FileImportState::NotStarted
        );

        state.prepare_for_file_import(FILE, TABLE).await.unwrap();
        // Idempotent on re-entry.
        state.prepare_for_file_import(FILE, TABLE).await.unwrap();
        assert_eq!(
            state.file_import_state(FILE, TABLE).await.unwrap(),
            FileImportState::InProgress
        );

        let mut batch = write_batch(&state, 1, 0, 500, true).await;
        assert_eq!(
            state.file_import_state(FILE, TABLE).await.unwrap(),
            FileImportState::InProgress
        );

        state.mark_batch_pending(&mut batch).await.unwrap();
        state.mark_batch_done(&mut batch, 500).await.unwrap();
        assert_eq!(
            state.file_import_state(FILE, TABLE).await.unwrap(),
            FileImportState::Completed
        );
    }

    #[tokio::test]
    async fn recover_reports_pending_batches_and_offsets() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path()).await;
        state.prepare_for_file_import(FILE, TABLE).await.unwrap();

        let mut done = write_batch(&state, 1, 0, 4096, false).await;
        state.mark_batch_pending(&mut done).await.unwrap();
        state.mark_batch_done(&mut done, 4096).await.unwrap();

        let mut applied = write_batch(&state, 2, 4096, 8192, false).await;
        state.mark_batch_pending(&mut applied).await.unwrap();
        state.mark_batch_done(&mut applied, 4096).await.unwrap();

        // Created but never picked up, as after a crash mid-import.
        let created = write_batch(&state, 3, 8192, 12288, false).await;

        let recovered = state.recover(FILE, TABLE).await.unwrap();
        assert_eq!(recovered.pending_batches, vec![created]);
        assert_eq!(recovered.last_batch_number, 3);
        assert_eq!(recovered.last_offset, 12288);
        assert!(!recovered.fully_split);
    }

    #[tokio::test]
    async fn recover_on_fresh_file_is_empty() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path()).await;
        state.prepare_for_file_import(FILE, TABLE).await.unwrap();

        let recovered = state.recover(FILE, TABLE).await.unwrap();
        assert!(recovered.pending_batches.is_empty());
        assert_eq!(recovered.last_batch_number, 0);
        assert_eq!(recovered.last_offset, 0);
        assert!(!recovered.fully_split);
    }

    #[tokio::test]
    async fn imported_counts_sum_only_done_batches() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path()).await;
        state.prepare_for_file_import(FILE, TABLE).await.unwrap();

        let mut first = write_batch(&state, 1, 0, 100, false).await;
        state.mark_batch_pending(&mut first).await.unwrap();
        state.mark_batch_done(&mut first, 100).await.unwrap();
        let _second = write_batch(&state, 2, 100, 150, true).await;

        assert_eq!(state.imported_row_count(FILE, TABLE).await.unwrap(), 100);
        assert_eq!(state.imported_byte_count(FILE, TABLE).await.unwrap(), 1200);
    }

    #[tokio::test]
    async fn clean_purges_records_and_files() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path()).await;
        state.prepare_for_file_import(FILE, TABLE).await.unwrap();

        let batch = write_batch(&state, 1, 0, 10, true).await;
        assert!(batch.batch_file.exists());

        state.clean(FILE, TABLE).await.unwrap();

        assert!(!batch.batch_file.exists());
        assert_eq!(
            state.file_import_state(FILE, TABLE).await.unwrap(),
            FileImportState::NotStarted
        );
        let recovered = state.recover(FILE, TABLE).await.unwrap();
        assert!(recovered.pending_batches.is_empty());
    }

    #[tokio::test]
    async fn segment_bookkeeping() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path()).await;

        assert_eq!(state.first_unprocessed_segment().await.unwrap(), 0);

        state.record_exported_events(0, 1500).await.unwrap();
        state.record_exported_events(1, 500).await.unwrap();
        assert_eq!(state.total_exported_events().await.unwrap(), 2000);

        state.mark_event_queue_segment_as_processed(0).await.unwrap();
        assert_eq!(state.first_unprocessed_segment().await.unwrap(), 1);

        // Marking is terminal and idempotent.
        state.mark_event_queue_segment_as_processed(0).await.unwrap();
        assert_eq!(state.total_exported_events().await.unwrap(), 2000);
    }
}
