//! Error types for the replication manager.

use replix_commit::{CommitDataError, IndexFormatVersion};
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors raised by the replication manager and its collaborators.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Commit metadata could not be read or written.
    #[error("commit metadata error: {0}")]
    CommitData(#[from] CommitDataError),

    /// A store, indexer or cursor operation failed.
    #[error("{operation} failed: {message}")]
    Store {
        /// Operation that failed.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// An operation was invoked in a state that does not allow it.
    #[error("invalid state: cannot {operation} while {state}")]
    InvalidState {
        /// Operation attempted.
        operation: &'static str,
        /// Current lifecycle state.
        state: String,
    },

    /// An index status was built from an invalid combination of fields.
    #[error("invalid index status: {0}")]
    InvalidStatus(String),

    /// The index generation uses a format replication cannot write.
    #[error("index format version {0} is not supported for replication")]
    UnsupportedFormat(IndexFormatVersion),

    /// The fatal handler was invoked; the current path stops.
    #[error("fatal: {reason}")]
    Fatal {
        /// Reason passed to the fatal handler.
        reason: String,
    },
}

impl ReplicationError {
    /// Creates a store error.
    pub fn store(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Store {
            operation,
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Returns true if this error came from the fatal handler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplicationError::Fatal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = ReplicationError::store("commit", "disk full");
        assert_eq!(err.to_string(), "commit failed: disk full");
        assert!(!err.is_fatal());
    }

    #[test]
    fn commit_data_converts() {
        let err: ReplicationError = CommitDataError::decoding_failed("eof").into();
        assert!(matches!(err, ReplicationError::CommitData(_)));
    }

    #[test]
    fn fatal_is_detected() {
        let err = ReplicationError::Fatal {
            reason: "out of memory".into(),
        };
        assert!(err.is_fatal());
    }
}
