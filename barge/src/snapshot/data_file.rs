use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::descriptor::{DataFileDescriptor, FileFormat};
use crate::error::BargeResult;

/// Sequential reader over one staged data file.
///
/// Records are logical rows, not physical lines: a quoted CSV field may span
/// lines, so a record is complete only once its quote count is balanced. The
/// reader tracks bytes consumed so the splitter can cap batch file sizes.
pub struct DataFile {
    reader: BufReader<File>,
    header: Option<String>,
    quote: Option<char>,
    bytes_read: i64,
}

impl DataFile {
    /// Opens a data file, consuming the header row first when the descriptor
    /// says there is one. The header does not count as a record or towards
    /// bytes read.
    pub async fn open(path: &Path, descriptor: &DataFileDescriptor) -> BargeResult<Self> {
        let file = File::open(path).await?;
        let quote = match descriptor.file_format {
            FileFormat::Csv => descriptor.quote_char.map(char::from),
            FileFormat::Text | FileFormat::SqlAsText => None,
        };

        let mut data_file = Self {
            reader: BufReader::new(file),
            header: None,
            quote,
            bytes_read: 0,
        };

        if descriptor.has_header {
            data_file.header = data_file.next_line().await?;
            data_file.bytes_read = 0;
        }

        Ok(data_file)
    }

    /// The header row, if the file has one.
    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    /// Bytes consumed from the file since the last reset.
    pub fn bytes_read(&self) -> i64 {
        self.bytes_read
    }

    pub fn reset_bytes_read(&mut self) {
        self.bytes_read = 0;
    }

    /// Skips `count` records, as when resuming a partially split file.
    pub async fn skip_lines(&mut self, count: i64) -> BargeResult<()> {
        for _ in 0..count {
            if self.next_line().await?.is_none() {
                break;
            }
        }
        self.bytes_read = 0;

        Ok(())
    }

    /// Reads the next record, or `None` at end-of-file.
    ///
    /// A final record without a trailing newline still counts as one record.
    pub async fn next_line(&mut self) -> BargeResult<Option<String>> {
        let mut record = String::new();

        loop {
            let mut chunk = String::new();
            let read = self.reader.read_line(&mut chunk).await?;

            if read == 0 {
                if record.is_empty() {
                    return Ok(None);
                }
                break;
            }

            self.bytes_read += read as i64;
            record.push_str(&chunk);

            if !has_open_quote(&record, self.quote) {
                break;
            }
        }

        if record.ends_with('\n') {
            record.pop();
            if record.ends_with('\r') {
                record.pop();
            }
        }

        Ok(Some(record))
    }
}

/// A record with an odd number of quote characters is still inside a quoted
/// field; doubled-quote escaping keeps the parity correct.
fn has_open_quote(record: &str, quote: Option<char>) -> bool {
    let Some(quote) = quote else {
        return false;
    };

    record.chars().filter(|c| *c == quote).count() % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn descriptor(has_header: bool) -> DataFileDescriptor {
        DataFileDescriptor {
            file_format: FileFormat::Csv,
            delimiter: ',',
            has_header,
            quote_char: Some(b'"'),
            escape_char: Some(b'"'),
            null_string: "\\N".to_string(),
            data_file_list: vec![],
            table_columns: Default::default(),
        }
    }

    async fn open(contents: &str, has_header: bool) -> (tempfile::TempDir, DataFile) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, contents).unwrap();
        let data_file = DataFile::open(&path, &descriptor(has_header)).await.unwrap();
        (dir, data_file)
    }

    #[tokio::test]
    async fn header_is_consumed_and_not_counted() {
        let (_dir, mut df) = open("id,total\n1,10\n2,20\n", true).await;

        assert_eq!(df.header(), Some("id,total"));
        assert_eq!(df.bytes_read(), 0);

        assert_eq!(df.next_line().await.unwrap().as_deref(), Some("1,10"));
        assert_eq!(df.next_line().await.unwrap().as_deref(), Some("2,20"));
        assert_eq!(df.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn final_record_without_newline_counts() {
        let (_dir, mut df) = open("1,10\n2,20", false).await;

        assert_eq!(df.next_line().await.unwrap().as_deref(), Some("1,10"));
        assert_eq!(df.next_line().await.unwrap().as_deref(), Some("2,20"));
        assert_eq!(df.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn quoted_fields_may_span_lines() {
        let (_dir, mut df) = open("1,\"a\nb\"\n2,c\n", false).await;

        assert_eq!(df.next_line().await.unwrap().as_deref(), Some("1,\"a\nb\""));
        assert_eq!(df.next_line().await.unwrap().as_deref(), Some("2,c"));
    }

    #[tokio::test]
    async fn skip_lines_positions_past_already_split_records() {
        let (_dir, mut df) = open("1,a\n2,b\n3,c\n", false).await;

        df.skip_lines(2).await.unwrap();
        assert_eq!(df.bytes_read(), 0);
        assert_eq!(df.next_line().await.unwrap().as_deref(), Some("3,c"));
    }

    #[tokio::test]
    async fn bytes_read_tracks_consumed_input() {
        let (_dir, mut df) = open("1,a\n2,b\n", false).await;

        df.next_line().await.unwrap();
        assert_eq!(df.bytes_read(), 4);
        df.next_line().await.unwrap();
        assert_eq!(df.bytes_read(), 8);

        df.reset_bytes_read();
        assert_eq!(df.bytes_read(), 0);
    }
}
