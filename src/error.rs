use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures of a scan run.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The discovery utility could not be run or produced unusable output.
    /// "No hosts found" is not a probe failure.
    #[error("discovery probe failed: {0}")]
    Probe(String),

    #[error("screen capture failed: {0}")]
    Capture(String),

    #[error("invalid scan result: {0}")]
    InvalidResult(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("document encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("markup encoding error: {0}")]
    Markup(String),

    /// Decoded fine but breaks the host invariants of a scan result.
    #[error("invalid scan record: {0}")]
    Invalid(String),

    #[error("record {filename} is malformed: {reason}")]
    InvalidRecord { filename: String, reason: String },

    #[error("scan record not found: {0}")]
    NotFound(String),

    #[error("no scans available")]
    NoRecords,

    #[error("scan record already exists: {0}")]
    AlreadyExists(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this is one of the "nothing there" conditions rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_) | StoreError::NoRecords)
    }
}

/// Failures while shipping a record to the remote archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("cannot connect to archive {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("remote directory {path}: {reason}")]
    Directory { path: String, reason: String },

    #[error("upload of {filename} failed: {reason}")]
    Upload { filename: String, reason: String },

    #[error("cannot read local record {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
