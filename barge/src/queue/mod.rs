//! Ordered reader over the exporter's segmented append-only event log.
//!
//! The queue lives at `data/event_queue/` inside the export directory as
//! numbered NDJSON segment files. Segment numbers are monotonic from 0; VSNs
//! are strictly increasing within a segment and across segments in
//! segment-number order. Each segment ends with a terminator record,
//! identified by its operation value.

mod segment;

pub use segment::EventQueueSegment;

use std::path::PathBuf;

use tracing::debug;

use crate::descriptor::DATA_DIR_NAME;

/// Subdirectory of `data/` holding the queue segments.
const EVENT_QUEUE_DIR_NAME: &str = "event_queue";

/// Materializes the event queue as a sequence of segments.
#[derive(Debug)]
pub struct EventQueue {
    queue_dir: PathBuf,
    next_segment_num: i64,
}

impl EventQueue {
    /// Creates a reader positioned at `first_segment_num`, the first segment
    /// not yet marked processed in the state store.
    pub fn new(export_dir: &std::path::Path, first_segment_num: i64) -> Self {
        Self {
            queue_dir: export_dir.join(DATA_DIR_NAME).join(EVENT_QUEUE_DIR_NAME),
            next_segment_num: first_segment_num,
        }
    }

    /// Directory the segments are read from.
    pub fn queue_dir(&self) -> &std::path::Path {
        &self.queue_dir
    }

    /// Returns the lowest-numbered unprocessed segment that exists on disk,
    /// or `None` if the exporter has not produced it yet. The caller polls.
    ///
    /// Advances the internal cursor on success; the caller owns marking the
    /// segment processed in the state store once it is drained.
    pub fn next_segment(&mut self) -> Option<EventQueueSegment> {
        let segment_num = self.next_segment_num;
        let path = self.segment_path(segment_num);

        if !path.exists() {
            return None;
        }

        self.next_segment_num += 1;
        debug!(segment_num, path = %path.display(), "found next queue segment");

        Some(EventQueueSegment::new(segment_num, path))
    }

    fn segment_path(&self, segment_num: i64) -> PathBuf {
        self.queue_dir.join(format!("segment.{segment_num}.ndjson"))
    }
}
