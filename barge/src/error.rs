use std::{error, fmt, io, result};

/// Type alias for convenience when using the Result type with [`BargeError`].
pub type BargeResult<T> = result::Result<T, BargeError>;

/// Internal error representation with kind, static description, and optional
/// dynamic detail plus source error.
///
/// Boxed to keep the public error type one word wide on the success path.
struct ErrorInner {
    kind: ErrorKind,
    description: &'static str,
    detail: Option<String>,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

/// Error classification for the import engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The export directory is missing a required file or marker.
    ExportLayoutInvalid,
    /// Failure reading a source data file or a batch file.
    SourceIo,
    /// Failure reading or writing the local import state store.
    StateStoreFailed,
    /// The state store contains a record the engine does not understand.
    StateStoreInconsistent,
    /// Connecting to or initializing the target database failed.
    TargetConnectionFailed,
    /// A query against the target database failed.
    TargetQueryFailed,
    /// A bulk load failed for a transient reason and may be retried.
    CopyRetryable,
    /// A bulk load was rejected by the target and must not be retried.
    CopyRejected,
    /// Applying a batch of change events to the target failed.
    EventApplyFailed,
    /// A line in an event queue segment could not be parsed.
    EventParseFailed,
    /// Channel metadata for an event channel is missing on the target.
    ChannelMetadataMissing,
    /// A column value could not be converted to the target representation.
    ConversionFailed,
    /// The schema manifest shipped in the export directory is unusable.
    SchemaManifestInvalid,
    /// An external loader client (sqlldr, sqlplus) failed.
    LoaderClientFailed,
    /// A worker task panicked or was cancelled.
    WorkerFailed,
    /// Configuration is invalid.
    ConfigInvalid,
    /// The operator declined to continue.
    Aborted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ExportLayoutInvalid => "export layout invalid",
            ErrorKind::SourceIo => "source io",
            ErrorKind::StateStoreFailed => "state store failed",
            ErrorKind::StateStoreInconsistent => "state store inconsistent",
            ErrorKind::TargetConnectionFailed => "target connection failed",
            ErrorKind::TargetQueryFailed => "target query failed",
            ErrorKind::CopyRetryable => "copy retryable",
            ErrorKind::CopyRejected => "copy rejected",
            ErrorKind::EventApplyFailed => "event apply failed",
            ErrorKind::EventParseFailed => "event parse failed",
            ErrorKind::ChannelMetadataMissing => "channel metadata missing",
            ErrorKind::ConversionFailed => "conversion failed",
            ErrorKind::SchemaManifestInvalid => "schema manifest invalid",
            ErrorKind::LoaderClientFailed => "loader client failed",
            ErrorKind::WorkerFailed => "worker failed",
            ErrorKind::ConfigInvalid => "config invalid",
            ErrorKind::Aborted => "aborted",
        };

        write!(f, "{name}")
    }
}

/// A stable error type for the import engine.
///
/// Carries an [`ErrorKind`] for classification, a static description, and an
/// optional dynamic detail. Built with [`BargeError::new`], most often through
/// the [`crate::barge_error!`] and [`crate::bail!`] macros.
pub struct BargeError(Box<ErrorInner>);

impl BargeError {
    /// Creates an error of `kind` carrying a static description.
    pub fn new(kind: ErrorKind, description: &'static str) -> Self {
        BargeError(Box::new(ErrorInner {
            kind,
            description,
            detail: None,
            source: None,
        }))
    }

    /// Attaches a detail rendered from any displayable value, replacing any
    /// existing one.
    pub fn with_detail(mut self, detail: impl fmt::Display) -> Self {
        self.0.detail = Some(detail.to_string());
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// Returns the detail message, if any.
    pub fn detail(&self) -> Option<&str> {
        self.0.detail.as_deref()
    }

    /// Attaches a source error, replacing any existing one.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        self.0.source = Some(source.into());
        self
    }

    /// Returns `true` if retrying the failed operation can succeed.
    ///
    /// Only transient target failures are retryable; everything else is
    /// treated as fatal by the callers that consult this.
    pub fn is_retryable(&self) -> bool {
        matches!(self.0.kind, ErrorKind::CopyRetryable)
    }
}

impl fmt::Debug for BargeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BargeError")
            .field("kind", &self.0.kind)
            .field("description", &self.0.description)
            .field("detail", &self.0.detail)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for BargeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.description)?;

        if let Some(detail) = &self.0.detail {
            write!(f, ": {detail}")?;
        }

        if let Some(source) = &self.0.source {
            write!(f, " (caused by: {source})")?;
        }

        Ok(())
    }
}

impl error::Error for BargeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0
            .source
            .as_deref()
            .map(|source| source as &(dyn error::Error + 'static))
    }
}

impl From<io::Error> for BargeError {
    fn from(err: io::Error) -> Self {
        BargeError::new(ErrorKind::SourceIo, "I/O operation failed").with_source(err)
    }
}

impl From<sqlx::Error> for BargeError {
    fn from(err: sqlx::Error) -> Self {
        BargeError::new(ErrorKind::StateStoreFailed, "State store query failed").with_source(err)
    }
}

impl From<serde_json::Error> for BargeError {
    fn from(err: serde_json::Error) -> Self {
        BargeError::new(ErrorKind::EventParseFailed, "JSON deserialization failed")
            .with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, barge_error};

    fn fails() -> BargeResult<()> {
        bail!(ErrorKind::ConfigInvalid, "Bad configuration");
    }

    #[test]
    fn display_includes_detail() {
        let err = barge_error!(
            ErrorKind::ConversionFailed,
            "Could not convert value",
            format!("column {}", "payload")
        );

        assert_eq!(err.kind(), ErrorKind::ConversionFailed);
        assert!(err.to_string().contains("column payload"));
    }

    #[test]
    fn bail_returns_early() {
        let err = fails().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn only_copy_retryable_is_retryable() {
        assert!(barge_error!(ErrorKind::CopyRetryable, "transient").is_retryable());
        assert!(!barge_error!(ErrorKind::CopyRejected, "fatal").is_retryable());
    }
}
