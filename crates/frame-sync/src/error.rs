use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures of the named-object and settings layers.
///
/// None of these is fatal to the calling process. The public frame counter
/// and access arbiter turn every one of them into a boolean or
/// [`AcquireResult`](crate::AcquireResult) plus a log entry.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("empty channel name")]
    InvalidName,

    #[error("frame counting is not enabled")]
    NotEnabled,

    #[error("failed to create or open named object [{name}]: {source}")]
    PrimitiveCreateFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to release named object [{name}]: {source}")]
    ReleaseFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("settings store: {0}")]
    Settings(#[from] io::Error),
}
