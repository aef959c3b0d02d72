//! # Replix Commit
//!
//! Typed view of the metadata persisted with every index commit.
//!
//! The index engine stores an opaque blob alongside each commit. This crate
//! owns the fields of that blob and their CBOR encoding:
//! - Change-stream and full-copy resume records
//! - Exceeded-limit and stale-state markers
//! - Collection-not-found marker
//! - Backend index format version
//!
//! ## Invariants
//!
//! - An empty blob means the index was never committed
//! - A structurally corrupt blob is an error, never silently empty
//! - After a full copy starts, exactly one resume record is present
//!
//! ## Usage
//!
//! ```
//! use replix_commit::{CommitMetadata, EncodedMetadata};
//!
//! let encoded = EncodedMetadata::default();
//! let metadata = CommitMetadata::decode(&encoded).unwrap();
//! assert!(metadata.is_empty());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod error;
mod markers;
mod metadata;
mod optime;
mod resume;

pub use error::{CommitDataError, CommitDataResult};
pub use markers::{IndexStateInfo, PersistedReason, PersistedStatusCode, StaleReason, StaleStateInfo};
pub use metadata::{CommitMetadata, EncodedMetadata, IndexFormatVersion};
pub use optime::OpTime;
pub use resume::{ChangeStreamResumeRecord, FullCopyResumeRecord, Namespace, ResumeToken};
