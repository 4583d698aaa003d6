//! Error types for drivers and the credential store.

/// Errors a driver can report for a single operation.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("credential rejected: {0}")]
    Credential(String),

    #[error("backend rejected request: {0}")]
    Rejected(String),
}

/// Errors from loading or persisting credentials.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("driver {0} rejected the credential")]
    Rejected(String),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}
