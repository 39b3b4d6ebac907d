use std::path::PathBuf;

use thiserror::Error;

/// Errors are `Clone` so callers that waited on a synchronization can share
/// its outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("invalid repository URL: {0}")]
    InvalidUrl(String),
    #[error("`{command}` failed with {status}")]
    CommandFailed { command: String, status: String },
    #[error("build `{command}` failed with {status}")]
    BuildFailed { command: String, status: String },
    #[error("{action} {path:?}: {message}")]
    Io {
        action: &'static str,
        path: PathBuf,
        message: String,
    },
    #[error("repository is not checked out at {0:?}")]
    NotCheckedOut(PathBuf),
}

impl SyncError {
    pub(crate) fn io(action: &'static str, path: &std::path::Path, err: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}
