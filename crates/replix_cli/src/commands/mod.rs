//! CLI command implementations.

pub mod inspect;
pub mod resolve;

use replix_commit::{CommitDataError, CommitMetadata, EncodedMetadata};
use replix_replication::FormatVersionMismatch;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors reported by the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// The metadata file could not be read.
    #[error("cannot read {path:?}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid commit metadata.
    #[error("invalid commit metadata in {path:?}: {source}")]
    Decode {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: CommitDataError,
    },

    /// JSON rendering failed.
    #[error("cannot render metadata: {0}")]
    Render(#[from] serde_json::Error),

    /// The recorded format version differs from the declared one.
    #[error(transparent)]
    Mismatch(#[from] FormatVersionMismatch),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Mismatch(_) => 2,
            _ => 1,
        }
    }
}

/// Reads and decodes the commit metadata stored in `path`.
///
/// An empty file decodes to empty metadata, as a never-committed index does.
pub fn load_metadata(path: &Path) -> Result<CommitMetadata, CliError> {
    let bytes = std::fs::read(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), len = bytes.len(), "read commit metadata");
    CommitMetadata::decode(&EncodedMetadata::from_bytes(bytes)).map_err(|source| {
        CliError::Decode {
            path: path.to_path_buf(),
            source,
        }
    })
}
