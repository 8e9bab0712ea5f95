use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::trace;

use crate::bail;
use crate::error::{BargeResult, ErrorKind};
use crate::types::Event;

/// How long to wait for more data when the reader catches up with a segment
/// the exporter is still appending to.
const TAIL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// One append-only NDJSON file of the event queue.
///
/// A segment may still be growing while it is read; [`EventQueueSegment::next_event`]
/// tails the file until the terminator record arrives. VSNs within the segment
/// are strictly increasing.
#[derive(Debug)]
pub struct EventQueueSegment {
    segment_num: i64,
    file_path: PathBuf,
    reader: Option<BufReader<File>>,
    /// Carries a partially written trailing line across reads.
    partial_line: String,
    processed: bool,
}

impl EventQueueSegment {
    pub(crate) fn new(segment_num: i64, file_path: PathBuf) -> Self {
        Self {
            segment_num,
            file_path,
            reader: None,
            partial_line: String::new(),
            processed: false,
        }
    }

    /// Monotonic segment number, assigned by the exporter from 0.
    pub fn segment_num(&self) -> i64 {
        self.segment_num
    }

    /// Path of the segment file on disk.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Whether the terminator record has been read.
    pub fn is_processed(&self) -> bool {
        self.processed
    }

    /// Opens the segment file for reading.
    pub async fn open(&mut self) -> BargeResult<()> {
        let file = File::open(&self.file_path).await?;
        self.reader = Some(BufReader::new(file));

        Ok(())
    }

    /// Reads the next event, or `None` once the terminator record is reached.
    ///
    /// Blocks (polling) while the exporter has not yet written the next
    /// complete line; an event line is only parsed once its newline has
    /// landed.
    pub async fn next_event(&mut self) -> BargeResult<Option<Event>> {
        if self.processed {
            return Ok(None);
        }

        let Some(reader) = self.reader.as_mut() else {
            bail!(
                ErrorKind::EventParseFailed,
                "Event queue segment was not opened before reading"
            );
        };

        loop {
            let mut chunk = String::new();
            let read = reader.read_line(&mut chunk).await?;

            if read == 0 {
                tokio::time::sleep(TAIL_POLL_INTERVAL).await;
                continue;
            }

            self.partial_line.push_str(&chunk);
            if !self.partial_line.ends_with('\n') {
                // The exporter is mid-write; wait for the rest of the line.
                continue;
            }

            let line = std::mem::take(&mut self.partial_line);
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            let event: Event = serde_json::from_str(line).map_err(|err| {
                crate::barge_error!(
                    ErrorKind::EventParseFailed,
                    "Malformed event in queue segment",
                    format!("segment {}: {line}", self.segment_num)
                )
                .with_source(err)
            })?;

            if event.is_end_of_segment() {
                self.processed = true;
                trace!(segment_num = self.segment_num, "segment terminator reached");
                return Ok(None);
            }

            trace!(vsn = event.vsn, segment_num = self.segment_num, "read event");
            return Ok(Some(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_segment(lines: &str) -> (tempfile::TempDir, EventQueueSegment) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment.0.ndjson");
        std::fs::write(&path, lines).unwrap();

        let mut segment = EventQueueSegment::new(0, path);
        segment.open().await.unwrap();
        (dir, segment)
    }

    #[tokio::test]
    async fn events_are_read_in_order_until_terminator() {
        let (_dir, mut segment) = open_segment(concat!(
            "{\"op\":\"c\",\"vsn\":1,\"schema_name\":\"public\",\"table_name\":\"orders\",",
            "\"key\":{\"id\":\"7\"},\"fields\":{\"id\":\"7\",\"total\":\"10\"}}\n",
            "{\"op\":\"u\",\"vsn\":2,\"schema_name\":\"public\",\"table_name\":\"orders\",",
            "\"key\":{\"id\":\"7\"},\"fields\":{\"total\":\"11\"}}\n",
            "{\"op\":\"end_of_source_queue_segment\"}\n",
        ))
        .await;

        let first = segment.next_event().await.unwrap().unwrap();
        assert_eq!(first.vsn, 1);
        let second = segment.next_event().await.unwrap().unwrap();
        assert_eq!(second.vsn, 2);

        assert!(segment.next_event().await.unwrap().is_none());
        assert!(segment.is_processed());

        // Reading past the terminator stays terminal.
        assert!(segment.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_line_is_an_error() {
        let (_dir, mut segment) = open_segment("{not json}\n").await;

        let err = segment.next_event().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EventParseFailed);
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let (_dir, mut segment) = open_segment(concat!(
            "\n",
            "{\"op\":\"d\",\"vsn\":5,\"schema_name\":\"public\",\"table_name\":\"orders\",",
            "\"key\":{\"id\":\"1\"},\"fields\":{}}\n",
            "{\"op\":\"end_of_source_queue_segment\"}\n",
        ))
        .await;

        let event = segment.next_event().await.unwrap().unwrap();
        assert_eq!(event.vsn, 5);
    }
}
