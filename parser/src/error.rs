use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("failed to open capture file {path}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decompress capture stream")]
    Decompression(#[source] std::io::Error),
    #[error("malformed capture document")]
    MalformedDocument(#[source] serde_json::Error),
    #[error("failed to enumerate capture directory {path}")]
    DirectoryEnumeration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start capture worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl StatsError {
    /// Split a decode failure into stream-level and document-level errors.
    pub(crate) fn from_json(err: serde_json::Error) -> Self {
        if err.is_io() {
            StatsError::Decompression(err.into())
        } else {
            StatsError::MalformedDocument(err)
        }
    }
}

/// Errors surfaced by the statistics cache to its callers.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The build this caller triggered or waited on failed. Every caller
    /// waiting on the same attempt receives the same error.
    #[error("failed to build player statistics")]
    Build(#[source] Arc<StatsError>),
    #[error("timed out waiting for player statistics")]
    Timeout,
    #[error("statistics worker exited without a result")]
    Abandoned,
}

pub type Result<T> = std::result::Result<T, StatsError>;
