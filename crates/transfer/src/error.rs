//! Error types for the transfer engine.

use cdndrive_driver::DriverError;

/// Errors produced by uploads and downloads.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("unexpected HTTP status {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("empty response body from {0}")]
    EmptyBody(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid meta: {0}")]
    InvalidMeta(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("cannot use source {link}: {reason}")]
    SourceParse { link: String, reason: String },

    #[error("source {driver} describes a different file than the first source")]
    SourceMismatch { driver: String },

    #[error("no usable download source")]
    NoUsableSource,

    #[error("cannot resume {path}: {reason}")]
    ResumeConflict { path: String, reason: String },

    #[error("{path} already exists and is complete")]
    AlreadyComplete { path: String },

    #[error("block {index}: {reason}")]
    Block { index: usize, reason: String },

    #[error("block {index} failed after {attempts} attempts: {last_error}")]
    Fatal {
        index: usize,
        attempts: u32,
        last_error: String,
    },

    #[error("meta object upload failed after {attempts} attempts: {last_error}")]
    MetaUpload { attempts: u32, last_error: String },

    #[error("refusing to upload empty file {0}")]
    EmptyFile(String),

    #[error("a {scope} worker panicked: {reason}")]
    WorkerPanicked { scope: String, reason: String },

    #[error("operation timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Shorthand for a per-attempt block failure.
    pub(crate) fn block(index: usize, reason: impl Into<String>) -> Self {
        Self::Block {
            index,
            reason: reason.into(),
        }
    }
}
