/*!
Error types for the Snapkeep core engine.
*/

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the Snapkeep core.
pub type Result<T> = std::result::Result<T, SnapkeepError>;

/// Errors that can occur while streaming, tracking or pruning snapshots.
#[derive(Error, Debug)]
pub enum SnapkeepError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Archive format name outside the supported set
    #[error("unknown archive format: {0}")]
    UnknownFormat(String),

    /// Snapshot directory does not exist
    #[error("snapshot not found: {0}")]
    NotFound(String),

    /// Snapshot path exists but is not a directory
    #[error("snapshot invalid: {0}")]
    Invalid(String),

    /// Directory entry of a kind that cannot be archived
    #[error("unsupported file type: {path} ({kind})")]
    UnsupportedType { path: PathBuf, kind: String },

    /// Metadata of a single directory entry could not be read
    #[error("{path}: {source}")]
    EntryMetadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot directory name is not `<timestamp>-<suffix>`
    #[error("invalid snapshot name: {0}")]
    InvalidName(String),

    /// Compression stream errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Validation and configuration errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// The issuing context was canceled
    #[error("operation canceled")]
    Canceled,

    /// A live download session references the snapshot
    #[error("snapshot in use: download {id}")]
    SnapshotInUse { name: String, id: String },

    /// No session is registered under the ID
    #[error("download {0} not found")]
    DownloadNotFound(String),

    /// Several errors merged into one, in the order they occurred
    #[error("{0}")]
    Multiple(ErrorList),
}

impl SnapkeepError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid name error
    pub fn invalid_name<S: Into<String>>(msg: S) -> Self {
        Self::InvalidName(msg.into())
    }

    /// Merge an ordered list of errors into a single error.
    ///
    /// Returns `None` for an empty list and the error itself for a list of one.
    /// Nested lists are flattened.
    pub fn combine(errors: Vec<SnapkeepError>) -> Option<SnapkeepError> {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                Self::Multiple(list) => flat.extend(list.0),
                other => flat.push(other),
            }
        }

        let mut errors = flat;
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(ErrorList(errors))),
        }
    }

    /// Flattened view over this error and any merged causes.
    pub fn errors(&self) -> Vec<&SnapkeepError> {
        match self {
            Self::Multiple(list) => list.0.iter().flat_map(|e| e.errors()).collect(),
            other => vec![other],
        }
    }

    /// True if this error, or any merged cause, is an unsupported entry type.
    pub fn has_unsupported_type(&self) -> bool {
        self.errors()
            .iter()
            .any(|e| matches!(e, Self::UnsupportedType { .. }))
    }

    /// True if this error, or any merged cause, is a cancellation.
    pub fn is_canceled(&self) -> bool {
        self.errors().iter().any(|e| matches!(e, Self::Canceled))
    }
}

/// Ordered list of errors backing [`SnapkeepError::Multiple`].
#[derive(Debug)]
pub struct ErrorList(pub Vec<SnapkeepError>);

impl ErrorList {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SnapkeepError> {
        self.0.iter()
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}
