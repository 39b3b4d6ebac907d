use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("language server session is not running (state: {0})")]
    NotRunning(SessionState),
    #[error("language server session is closed")]
    Closed,
    #[error("{method} failed: {message} (code {code})")]
    Protocol {
        method: String,
        code: i64,
        message: String,
    },
    #[error("{method} timed out after {timeout_ms} ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("failed to launch language server `{command}`: {reason}")]
    Launch { command: String, reason: String },
    #[error("language server I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response to {method}: {reason}")]
    InvalidResponse { method: String, reason: String },
    #[error("invalid document path: {0:?}")]
    InvalidPath(String),
}

impl SessionError {
    pub(crate) fn invalid_response(method: &str, reason: impl ToString) -> Self {
        Self::InvalidResponse {
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }
}
