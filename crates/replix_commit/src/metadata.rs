//! Commit metadata and its byte encoding.

use crate::error::{CommitDataError, CommitDataResult};
use crate::markers::{IndexStateInfo, StaleStateInfo};
use crate::resume::{ChangeStreamResumeRecord, FullCopyResumeRecord};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of the on-disk index encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexFormatVersion(u32);

impl IndexFormatVersion {
    /// Oldest format replication still writes to.
    pub const MIN_SUPPORTED: IndexFormatVersion = IndexFormatVersion(4);
    /// Format written by new index generations.
    pub const CURRENT: IndexFormatVersion = IndexFormatVersion(6);

    /// Creates a format version.
    pub const fn new(number: u32) -> Self {
        Self(number)
    }

    /// Returns the version number.
    pub const fn number(&self) -> u32 {
        self.0
    }

    /// Returns true if replication may run against this format.
    pub fn is_supported(&self) -> bool {
        (Self::MIN_SUPPORTED..=Self::CURRENT).contains(self)
    }
}

impl fmt::Display for IndexFormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The opaque bytes the index engine stores with a commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedMetadata(Vec<u8>);

impl EncodedMetadata {
    /// Wraps raw bytes read from a commit.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns true if nothing was ever committed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Recovery facts persisted with every index commit.
///
/// Every field is optional. Which combination is present tells the
/// replication manager how to restart: see the named constructors for the
/// combinations it writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CommitMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change_stream_resume: Option<ChangeStreamResumeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backend_format_version: Option<IndexFormatVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exceeded_limit_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    full_copy_resume: Option<FullCopyResumeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stale_state: Option<StaleStateInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index_state: Option<IndexStateInfo>,
}

impl CommitMetadata {
    /// Metadata with no fields set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Marks the index as having exceeded a configured limit.
    pub fn exceeded(reason: impl Into<String>) -> Self {
        Self {
            exceeded_limit_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Marks the index as frozen and serving stale data.
    pub fn stale(info: StaleStateInfo) -> Self {
        Self {
            stale_state: Some(info),
            ..Self::default()
        }
    }

    /// Records progress of a full copy that is still catching up.
    pub fn full_copy_resume(version: IndexFormatVersion, record: FullCopyResumeRecord) -> Self {
        Self {
            backend_format_version: Some(version),
            full_copy_resume: Some(record),
            ..Self::default()
        }
    }

    /// Records the change-stream position of a finished copy.
    pub fn change_stream_resume(
        record: ChangeStreamResumeRecord,
        version: IndexFormatVersion,
    ) -> Self {
        Self {
            change_stream_resume: Some(record),
            backend_format_version: Some(version),
            ..Self::default()
        }
    }

    /// Persists an index status marker.
    pub fn from_index_state(info: IndexStateInfo) -> Self {
        Self {
            index_state: Some(info),
            ..Self::default()
        }
    }

    /// Returns true if the index was never committed by replication.
    pub fn is_empty(&self) -> bool {
        self.change_stream_resume.is_none() && self.backend_format_version.is_none()
    }

    /// Change-stream resume record, present once a full copy finished.
    pub fn change_stream_resume_record(&self) -> Option<&ChangeStreamResumeRecord> {
        self.change_stream_resume.as_ref()
    }

    /// Format version the index was written with.
    pub fn backend_format_version(&self) -> Option<IndexFormatVersion> {
        self.backend_format_version
    }

    /// Reason the index exceeded a limit.
    pub fn exceeded_limit_reason(&self) -> Option<&str> {
        self.exceeded_limit_reason.as_deref()
    }

    /// Full-copy resume record, present while a copy is catching up.
    pub fn full_copy_resume_record(&self) -> Option<&FullCopyResumeRecord> {
        self.full_copy_resume.as_ref()
    }

    /// Stale-state record.
    pub fn stale_state(&self) -> Option<&StaleStateInfo> {
        self.stale_state.as_ref()
    }

    /// Persisted index status marker.
    pub fn index_state(&self) -> Option<&IndexStateInfo> {
        self.index_state.as_ref()
    }

    /// Encodes the metadata to CBOR.
    pub fn encode(&self) -> CommitDataResult<EncodedMetadata> {
        if *self == Self::default() {
            return Ok(EncodedMetadata::default());
        }

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| CommitDataError::encoding_failed(e.to_string()))?;
        Ok(EncodedMetadata(bytes))
    }

    /// Decodes metadata read from a commit.
    ///
    /// An empty blob decodes to [`CommitMetadata::empty`].
    pub fn decode(encoded: &EncodedMetadata) -> CommitDataResult<Self> {
        if encoded.is_empty() {
            return Ok(Self::default());
        }

        let metadata: CommitMetadata = ciborium::de::from_reader(encoded.as_bytes())
            .map_err(|e| CommitDataError::decoding_failed(e.to_string()))?;
        metadata.validate()?;
        Ok(metadata)
    }

    fn validate(&self) -> CommitDataResult<()> {
        if let Some(version) = self.backend_format_version {
            if version.number() == 0 {
                return Err(CommitDataError::invalid_field(
                    "backendFormatVersion",
                    "must be positive",
                ));
            }
        }

        if let Some(record) = &self.change_stream_resume {
            record.resume_token.op_time().map_err(|e| {
                CommitDataError::invalid_field("changeStreamResume", e.to_string())
            })?;
        }

        if self.change_stream_resume.is_some() && self.full_copy_resume.is_some() {
            return Err(CommitDataError::invalid_field(
                "fullCopyResume",
                "present together with a change-stream resume record",
            ));
        }

        Ok(())
    }
}
