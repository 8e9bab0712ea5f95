use std::path::PathBuf;

use crate::bail;
use crate::error::{BargeResult, ErrorKind};

/// Lifecycle state of one snapshot batch.
///
/// `Created` means the batch file is durable and registered; `Pending` means a
/// worker has picked it up; `Done` means the target confirmed the load and the
/// rows-affected count is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Created,
    Pending,
    Done,
}

impl BatchState {
    /// Stable string form persisted in the state store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Done => "done",
        }
    }

    /// Parses the persisted string form.
    ///
    /// An unknown state means the store was written by something else and the
    /// engine must not guess; the caller treats this as fatal.
    pub fn parse(s: &str) -> BargeResult<Self> {
        match s {
            "created" => Ok(Self::Created),
            "pending" => Ok(Self::Pending),
            "done" => Ok(Self::Done),
            other => bail!(
                ErrorKind::StateStoreInconsistent,
                "Unknown batch state in the state store",
                other
            ),
        }
    }
}

/// A contiguous slice of rows from one data file, materialized as its own
/// file.
///
/// Offsets are logical row indices into the original file, half-open. Batches
/// of the same (file, table) cover disjoint ranges and, once the file is fully
/// split, partition `[0, total_rows)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Source data file the rows came from.
    pub file_path: String,
    /// Target table the rows belong to.
    pub table_name: String,
    /// Monotonic per-file batch number, starting at 1.
    pub number: i64,
    pub offset_start: i64,
    pub offset_end: i64,
    /// Bytes read from the source file while producing this batch.
    pub byte_count: i64,
    /// Number of data rows in the batch file, excluding any header.
    pub record_count: i64,
    /// Path of the materialized batch file.
    pub batch_file: PathBuf,
    pub state: BatchState,
}
