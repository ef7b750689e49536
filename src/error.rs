//! Error types for infercore.

use thiserror::Error;

/// Result type alias for infercore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for infercore.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// A sequence could not be scheduled even after cache eviction
    /// and preemption.
    #[error("out of memory: cannot schedule sequence")]
    OutOfMemory,

    /// The intake queue is at capacity.
    #[error("admission queue full")]
    AdmissionFull,

    /// Malformed request, rejected at admission.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The scheduler has been dropped and no longer accepts requests.
    #[error("scheduler shut down")]
    Shutdown,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Construct an [`Error::InvalidArgument`] from anything displayable.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
