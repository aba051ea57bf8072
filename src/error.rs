//! Error types for the chat download service.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Chat source error: {0}")]
    Source(#[from] SourceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors surfaced synchronously by job management operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
    #[error("{0}")]
    Validation(String),

    #[error("Maximum concurrent downloads ({max}) reached")]
    Admission { max: usize },

    #[error("Download {id} not found")]
    NotFound { id: String },

    #[error("Download {id}: {reason}")]
    Conflict { id: String, reason: String },
}

impl DownloadError {
    /// Machine-readable error kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Admission { .. } => "admission_error",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
        }
    }
}

/// Faults raised by a chat source while a job is in flight.
///
/// These never reach the submitter; the runner records them into the job.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Request to chat source failed: {0}")]
    Request(String),

    #[error("Chat source returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Could not decode chat message: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn kind(&self) -> &'static str {
        "source_error"
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(e.to_string())
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
