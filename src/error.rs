use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Capture hardware or file unavailable. Recoverable: the capture loop
/// retries and then degrades to the synthetic generator.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("capture source not found: {0}")]
    NotFound(String),

    #[error("capture source busy: {0}")]
    Busy(String),

    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("capture source closed: {0}")]
    Closed(String),

    #[error("unsupported capture source: {0}")]
    Unsupported(String),

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resource-level failures surfaced to the operator at startup.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("certificate error ({}): {reason}", path.display())]
    Certificate { path: PathBuf, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("no listener could be started")]
    NoListeners,

    #[error("frame source unavailable: {0}")]
    Source(#[from] DeviceError),

    #[error("capture failed to start: {0}")]
    Capture(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ServerError {
    pub fn certificate(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Certificate {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Per-request credential failures. Every variant is answered with 401.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Authorization header")]
    Missing,

    #[error("malformed Authorization header")]
    Malformed,

    #[error("bad credentials")]
    BadCredentials,

    #[error("stale nonce")]
    StaleNonce,

    #[error("replayed nonce count")]
    Replay,
}
