//! Error types for the replikv core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core store operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] replikv_storage::StorageError),

    /// JSON encode/decode error.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The transaction's store was closed while the transaction was
    /// outstanding.
    #[error("transaction closed")]
    TransactionClosed,

    /// The store has been closed.
    #[error("store is closed")]
    StoreClosed,

    /// A mutation named a mutator that is not registered.
    #[error("unknown mutator: {name}")]
    UnknownMutator {
        /// The mutator name that was looked up.
        name: String,
    },

    /// A scan referenced an index that does not exist.
    #[error("unknown index: {name}")]
    UnknownIndex {
        /// The index name that was looked up.
        name: String,
    },

    /// An index with this name already exists.
    #[error("index already exists: {name}")]
    IndexExists {
        /// The conflicting index name.
        name: String,
    },

    /// A JSON pointer is syntactically invalid.
    ///
    /// Rows that merely fail to match a valid pointer are skipped, not
    /// errors.
    #[error("invalid JSON pointer: {pointer:?}")]
    InvalidPointer {
        /// The offending pointer text.
        pointer: String,
    },

    /// A mutator returned an error; no local commit was appended.
    #[error("mutator {name} failed: {source}")]
    MutatorFailed {
        /// Name of the failing mutator.
        name: String,
        /// The underlying error.
        #[source]
        source: Box<CoreError>,
    },

    /// Persisted or remote state violated the commit model.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates an unknown mutator error.
    pub fn unknown_mutator(name: impl Into<String>) -> Self {
        Self::UnknownMutator { name: name.into() }
    }

    /// Creates an unknown index error.
    pub fn unknown_index(name: impl Into<String>) -> Self {
        Self::UnknownIndex { name: name.into() }
    }

    /// Creates an index exists error.
    pub fn index_exists(name: impl Into<String>) -> Self {
        Self::IndexExists { name: name.into() }
    }

    /// Creates an invalid pointer error.
    pub fn invalid_pointer(pointer: impl Into<String>) -> Self {
        Self::InvalidPointer {
            pointer: pointer.into(),
        }
    }

    /// Wraps an error raised by a mutator body.
    pub fn mutator_failed(name: impl Into<String>, source: CoreError) -> Self {
        Self::MutatorFailed {
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            CoreError::unknown_mutator("createTodo").to_string(),
            "unknown mutator: createTodo"
        );
        assert_eq!(
            CoreError::invalid_pointer("a/b").to_string(),
            "invalid JSON pointer: \"a/b\""
        );

        let err = CoreError::mutator_failed("m", CoreError::invalid_operation("boom"));
        assert_eq!(err.to_string(), "mutator m failed: invalid operation: boom");
    }
}
