//! Error taxonomy shared by every stage of a download.

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = DownloadError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// Bad arguments, or a remote that cannot be chunked.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The server answered with a status other than 2xx or 416.
    #[error("remote rejected request with HTTP {status} for {url}")]
    RemoteRequest { status: u16, url: String },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("network operation timed out after {0:?}")]
    Timeout(Duration),

    /// The body ended before the requested range was fully received.
    #[error("stream ended early: expected {expected} bytes, received {received}")]
    PrematureEof { expected: u64, received: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download cancelled")]
    Cancelled,

    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: Box<DownloadError>,
    },

    #[error("chunk worker failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl DownloadError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        DownloadError::Configuration(msg.into())
    }

    /// Whether a retry (reconnect at the current offset) may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::Http(e) => !e.is_builder(),
            DownloadError::Timeout(_)
            | DownloadError::PrematureEof { .. }
            | DownloadError::Io(_) => true,
            DownloadError::Configuration(_)
            | DownloadError::RemoteRequest { .. }
            | DownloadError::Cancelled
            | DownloadError::RetriesExhausted { .. }
            | DownloadError::TaskJoin(_) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }

    /// HTTP status carried by a permanent remote rejection, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            DownloadError::RemoteRequest { status, .. } => Some(*status),
            DownloadError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}
