//! Types describing the layout of the export directory.
//!
//! The exporter stages everything the import engine consumes under a single
//! directory: data files plus their descriptor manifest, the event queue, and
//! discovery markers. This module reads those artifacts; it never writes into
//! the exporter's files.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use uuid::Uuid;

use crate::bail;
use crate::error::{BargeResult, ErrorKind};
use crate::types::ImportFileTask;

/// Subdirectory holding data files, the descriptor, and the event queue.
pub const DATA_DIR_NAME: &str = "data";
/// Subdirectory holding discovery markers and local import state.
pub const META_INFO_DIR_NAME: &str = "metainfo";
/// Marker file the exporter creates once data export has finished.
const EXPORT_DATA_DONE_FLAG: &str = "flags/exportDataDone";
/// File holding the migration UUID shared by exporter and importer.
const MIGRATION_UUID_FILE: &str = "migration_uuid";

/// Kind of database the data was exported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceDbType {
    Postgresql,
    Mysql,
    Oracle,
}

impl SourceDbType {
    fn from_marker(name: &str) -> Option<Self> {
        match name {
            "postgresql" => Some(Self::Postgresql),
            "mysql" => Some(Self::Mysql),
            "oracle" => Some(Self::Oracle),
            _ => None,
        }
    }
}

impl fmt::Display for SourceDbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgresql => write!(f, "postgresql"),
            Self::Mysql => write!(f, "mysql"),
            Self::Oracle => write!(f, "oracle"),
        }
    }
}

/// Format of the staged data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Csv,
    Text,
    /// SQL dumps re-staged as tab separated text; loaded as [`FileFormat::Text`].
    SqlAsText,
}

impl FileFormat {
    /// The format the target bulk loader should be told about.
    pub fn load_format(&self) -> FileFormat {
        match self {
            FileFormat::SqlAsText => FileFormat::Text,
            other => *other,
        }
    }

    /// Name used inside COPY statements.
    pub fn as_copy_option(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Text | FileFormat::SqlAsText => "text",
        }
    }
}

/// One entry of the descriptor's data file list.
#[derive(Debug, Clone, Deserialize)]
pub struct DataFileEntry {
    pub file_path: String,
    pub table_name: String,
    pub row_count: i64,
    pub file_size: i64,
}

/// Manifest describing the staged data files, written by the exporter as
/// `data/datafile_descriptor.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct DataFileDescriptor {
    pub file_format: FileFormat,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub has_header: bool,
    #[serde(default)]
    pub quote_char: Option<u8>,
    #[serde(default)]
    pub escape_char: Option<u8>,
    #[serde(default = "default_null_string")]
    pub null_string: String,
    pub data_file_list: Vec<DataFileEntry>,
    /// Ordered column list per table, as exported. Keys follow any renames
    /// applied to the file list (reserved-word quoting), so they must be
    /// rekeyed together with `data_file_list`.
    #[serde(default)]
    pub table_columns: HashMap<String, Vec<String>>,
}

impl DataFileDescriptor {
    /// Reads the descriptor from the export directory.
    ///
    /// A missing descriptor means the data was exported by an incompatible
    /// version of the exporter.
    pub fn open(export_dir: &Path) -> BargeResult<Self> {
        let path = export_dir.join(DATA_DIR_NAME).join("datafile_descriptor.json");
        let raw = std::fs::read_to_string(&path).map_err(|err| {
            crate::barge_error!(
                ErrorKind::ExportLayoutInvalid,
                "Data file descriptor is missing; export and import versions must match",
                path.display()
            )
            .with_source(err)
        })?;

        let descriptor: DataFileDescriptor = serde_json::from_str(&raw).map_err(|err| {
            crate::barge_error!(
                ErrorKind::ExportLayoutInvalid,
                "Data file descriptor is not valid JSON",
                path.display()
            )
            .with_source(err)
        })?;

        Ok(descriptor)
    }

    /// Builds one import task per data file entry, in manifest order.
    pub fn discover_tasks(&self) -> Vec<ImportFileTask> {
        self.data_file_list
            .iter()
            .enumerate()
            .map(|(id, entry)| ImportFileTask {
                id,
                file_path: PathBuf::from(&entry.file_path),
                table_name: entry.table_name.clone(),
            })
            .collect()
    }
}

fn default_delimiter() -> char {
    ','
}

fn default_null_string() -> String {
    "\\N".to_string()
}

/// Restored-sequence values and completion details written by the exporter as
/// `data/export_status.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportStatus {
    #[serde(default)]
    pub sequences: HashMap<String, i64>,
}

impl ExportStatus {
    /// Reads the export status file; absent means no sequences to restore.
    pub fn read(export_dir: &Path) -> BargeResult<Self> {
        let path = export_dir.join(DATA_DIR_NAME).join("export_status.json");
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Fails unless the exporter has signaled completion of the data export.
pub fn check_export_data_done(export_dir: &Path) -> BargeResult<()> {
    let meta_info_dir = export_dir.join(META_INFO_DIR_NAME);
    if !meta_info_dir.is_dir() {
        bail!(
            ErrorKind::ExportLayoutInvalid,
            "Export metainfo directory is missing",
            meta_info_dir.display()
        );
    }

    let flag = meta_info_dir.join(EXPORT_DATA_DONE_FLAG);
    if !flag.exists() {
        bail!(
            ErrorKind::ExportLayoutInvalid,
            "Data export is not complete yet",
            flag.display()
        );
    }

    Ok(())
}

/// Discovers the source database type from the `metainfo/source-db-<type>`
/// marker file the exporter leaves behind.
pub fn discover_source_db_type(export_dir: &Path) -> BargeResult<SourceDbType> {
    let meta_info_dir = export_dir.join(META_INFO_DIR_NAME);
    let entries = std::fs::read_dir(&meta_info_dir)?;

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if let Some(db_type) = name.strip_prefix("source-db-") {
            if let Some(source) = SourceDbType::from_marker(db_type) {
                return Ok(source);
            }

            bail!(
                ErrorKind::ExportLayoutInvalid,
                "Unknown source database type marker",
                name
            );
        }
    }

    bail!(
        ErrorKind::ExportLayoutInvalid,
        "No source database type marker found in the export metainfo directory"
    );
}

/// Loads the migration UUID shared by exporter and importer, creating and
/// persisting a fresh one if the exporter predates the marker.
pub fn load_or_create_migration_uuid(export_dir: &Path) -> BargeResult<Uuid> {
    let path = export_dir.join(META_INFO_DIR_NAME).join(MIGRATION_UUID_FILE);

    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let uuid = raw.trim().parse::<Uuid>().map_err(|err| {
            crate::barge_error!(
                ErrorKind::ExportLayoutInvalid,
                "Migration UUID file is corrupt",
                path.display()
            )
            .with_source(err)
        })?;
        return Ok(uuid);
    }

    let uuid = Uuid::new_v4();
    std::fs::write(&path, format!("{uuid}\n"))?;

    Ok(uuid)
}
