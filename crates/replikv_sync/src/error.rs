//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Store error during sync.
    #[error("store error: {0}")]
    Core(#[from] replikv_core::CoreError),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
    },

    /// The endpoint answered with a non-success, non-401 status.
    #[error("HTTP error {status}: {body}")]
    HttpError {
        /// Response status code.
        status: u16,
        /// Response body, for the logs.
        body: String,
    },

    /// The endpoint answered 401 and no fresh credential was available.
    #[error("unauthorized")]
    Unauthorized,

    /// Reauthentication was attempted too many times in one cycle.
    #[error("reauthentication limit reached")]
    ReauthLimit,

    /// The response body (or request state) violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(SyncError::Unauthorized.to_string(), "unauthorized");
        assert_eq!(
            SyncError::HttpError {
                status: 500,
                body: "oops".into()
            }
            .to_string(),
            "HTTP error 500: oops"
        );
    }
}
