use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::error::BargeResult;
use crate::state::ImportDataState;
use crate::types::{Batch, BatchState};

/// Writes one batch file for the snapshot importer.
///
/// Rows are appended to a temp file; [`BatchWriter::done`] makes the file
/// durable, renames it into place, and registers the batch as created in the
/// state store. The batch file is durable before the created record becomes
/// visible, so recovery never sees a record without its file.
pub struct BatchWriter {
    state: ImportDataState,
    file_path: String,
    table_name: String,
    batch_number: i64,
    offset_start: i64,
    final_path: PathBuf,
    temp_path: PathBuf,
    writer: BufWriter<File>,
    records_written: i64,
}

impl BatchWriter {
    pub(crate) async fn create(
        state: ImportDataState,
        file_path: String,
        table_name: String,
        batch_number: i64,
        offset_start: i64,
    ) -> BargeResult<Self> {
        let dir = state.batch_dir(&file_path, &table_name);
        tokio::fs::create_dir_all(&dir).await?;

        let final_path = dir.join(format!("batch-{batch_number}"));
        let temp_path = dir.join(format!("batch-{batch_number}.tmp"));
        let file = File::create(&temp_path).await?;

        Ok(Self {
            state,
            file_path,
            table_name,
            batch_number,
            offset_start,
            final_path,
            temp_path,
            writer: BufWriter::new(file),
            records_written: 0,
        })
    }

    /// Number of data records written so far.
    pub fn records_written(&self) -> i64 {
        self.records_written
    }

    /// Writes the header row duplicated from the source file.
    ///
    /// Headers are not counted as records and do not contribute to offsets.
    pub async fn write_header(&mut self, header: &str) -> BargeResult<()> {
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;

        Ok(())
    }

    /// Appends one data record. Empty lines are ignored.
    pub async fn write_record(&mut self, record: &str) -> BargeResult<()> {
        if record.is_empty() {
            return Ok(());
        }

        self.writer.write_all(record.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.records_written += 1;

        Ok(())
    }

    /// Finalizes the batch file and registers the batch as created.
    ///
    /// `offset_end` is the logical row index just past the batch's last row in
    /// the source file; `byte_count` is the number of source bytes consumed
    /// producing this batch. With `is_last` the owning file is marked fully
    /// split in the same state transaction.
    pub async fn done(
        mut self,
        is_last: bool,
        offset_end: i64,
        byte_count: i64,
    ) -> BargeResult<Batch> {
        self.writer.flush().await?;
        let file = self.writer.into_inner();
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&self.temp_path, &self.final_path).await?;

        // The rename itself must survive a crash before the created record is
        // written, so the parent directory is synced as well.
        if let Some(dir) = self.final_path.parent() {
            std::fs::File::open(dir)?.sync_all()?;
        }

        let batch = Batch {
            file_path: self.file_path,
            table_name: self.table_name,
            number: self.batch_number,
            offset_start: self.offset_start,
            offset_end,
            byte_count,
            record_count: self.records_written,
            batch_file: self.final_path,
            state: BatchState::Created,
        };
        self.state.register_batch(&batch, is_last).await?;

        debug!(
            table_name = %batch.table_name,
            number = batch.number,
            records = batch.record_count,
            is_last,
            "finalized batch file"
        );

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn batch_file_lands_under_final_name_with_header() {
        let dir = tempdir().unwrap();
        let state = ImportDataState::open(dir.path()).await.unwrap();
        state
            .prepare_for_file_import("orders_data.csv", "orders")
            .await
            .unwrap();

        let mut writer = state
            .new_batch_writer("orders_data.csv", "orders", 1, 0)
            .await
            .unwrap();
        writer.write_header("id,total").await.unwrap();
        writer.write_record("1,10.0").await.unwrap();
        writer.write_record("").await.unwrap();
        writer.write_record("2,20.0").await.unwrap();
        assert_eq!(writer.records_written(), 2);

        let batch = writer.done(true, 2, 14).await.unwrap();

        assert_eq!(batch.state, BatchState::Created);
        assert_eq!(batch.record_count, 2);
        assert!(batch.batch_file.ends_with("batch-1"));

        let contents = tokio::fs::read_to_string(&batch.batch_file).await.unwrap();
        assert_eq!(contents, "id,total\n1,10.0\n2,20.0\n");

        // No temp file left behind.
        assert!(!batch.batch_file.with_extension("tmp").exists());
    }
}
