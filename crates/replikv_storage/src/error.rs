//! Error types for storage backends.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error from the underlying file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backend has been closed.
    #[error("storage backend is closed")]
    Closed,

    /// A journal frame failed validation.
    #[error("journal corruption at offset {offset}: {message}")]
    Corruption {
        /// Byte offset of the bad frame.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// The journal header is missing or incompatible.
    #[error("invalid journal format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::Corruption {
            offset,
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }
}
