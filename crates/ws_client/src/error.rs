use thiserror::Error;
use ws_proto::{ErrorBody, ErrorCode};

/// Errors surfaced by the client state machine.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect after {attempts} attempt(s): {last_error}")]
    Connect { attempts: u32, last_error: String },
    #[error("request timed out after {timeout_ms} ms")]
    DeadlineExceeded { timeout_ms: u64 },
    #[error("request was cancelled")]
    Cancelled,
    #[error("server returned {}: {}", .0.code, .0.message)]
    Rpc(ErrorBody),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// The taxonomy code this failure maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Connect { .. } => ErrorCode::Unavailable,
            ClientError::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            ClientError::Cancelled => ErrorCode::Cancelled,
            ClientError::Rpc(body) => body.code.clone(),
            ClientError::Transport(_) => ErrorCode::Unavailable,
            ClientError::ConnectionClosed => ErrorCode::Unavailable,
            ClientError::Serialization(_) => ErrorCode::InvalidArgument,
        }
    }
}
