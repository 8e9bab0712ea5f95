use std::fmt;
use std::path::PathBuf;

/// One snapshot data file to import into one target table.
///
/// Tasks are discovered from the export's data-file descriptor and are
/// immutable afterwards. The table name may be schema-qualified and/or quoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFileTask {
    /// Stable identifier, the position in the descriptor's file list.
    pub id: usize,
    /// Path of the data file within the export's `data` directory.
    pub file_path: PathBuf,
    /// Target table the file's rows belong to.
    pub table_name: String,
}

impl fmt::Display for ImportFileTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.file_path.display(), self.table_name)
    }
}

/// Progress of one (file, table) import.
///
/// Transitions are monotonic: a file never leaves `Completed`, and
/// `InProgress` only moves forward. A file is `Completed` iff splitting
/// reached end-of-file and every emitted batch is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileImportState {
    NotStarted,
    InProgress,
    Completed,
}

impl fmt::Display for FileImportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::InProgress => write!(f, "in progress"),
            Self::Completed => write!(f, "completed"),
        }
    }
}
