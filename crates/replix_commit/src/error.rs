//! Error types for the commit metadata codec.

use thiserror::Error;

/// Result type for commit metadata operations.
pub type CommitDataResult<T> = Result<T, CommitDataError>;

/// Errors that can occur while encoding or decoding commit metadata.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitDataError {
    /// Failed to encode metadata to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes into metadata.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// A field decoded but holds a value that cannot be valid.
    #[error("invalid field {field}: {message}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// Description of the problem.
        message: String,
    },

    /// A resume token whose operation time cannot be read.
    #[error("invalid resume token {token:?}: {message}")]
    InvalidResumeToken {
        /// The raw token data.
        token: String,
        /// Description of the problem.
        message: String,
    },
}

impl CommitDataError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create an invalid field error.
    pub fn invalid_field(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            message: message.into(),
        }
    }

    /// Create an invalid resume token error.
    pub fn invalid_resume_token(token: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidResumeToken {
            token: token.into(),
            message: message.into(),
        }
    }
}
