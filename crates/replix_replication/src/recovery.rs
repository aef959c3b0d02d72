//! Startup decision from the last commit's metadata.

use replix_commit::{
    ChangeStreamResumeRecord, CommitMetadata, FullCopyResumeRecord, IndexFormatVersion,
    StaleStateInfo,
};
use thiserror::Error;
use tracing::{error, info};

/// How replication (re)starts for an index that may keep running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Clear the index and copy from scratch.
    RunFullCopy,
    /// Continue an interrupted full copy.
    ResumeFullCopy(FullCopyResumeRecord),
    /// Reopen the change stream.
    ResumeTailing(ChangeStreamResumeRecord),
}

/// Everything the manager may do at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupDecision {
    /// The index exceeded a limit on a previous run.
    FailExceeded(String),
    /// The index was frozen on a previous run.
    ServeStale(StaleStateInfo),
    /// The source collection was missing on a previous run.
    CollectionNotFound,
    /// Start replicating.
    Replicate(RecoveryAction),
}

impl StartupDecision {
    /// Returns the name of the decision.
    pub fn name(&self) -> &'static str {
        match self {
            StartupDecision::FailExceeded(_) => "FailExceeded",
            StartupDecision::ServeStale(_) => "ServeStale",
            StartupDecision::CollectionNotFound => "CollectionNotFound",
            StartupDecision::Replicate(RecoveryAction::RunFullCopy) => "RunFullCopy",
            StartupDecision::Replicate(RecoveryAction::ResumeFullCopy(_)) => "ResumeFullCopy",
            StartupDecision::Replicate(RecoveryAction::ResumeTailing(_)) => "ResumeTailing",
        }
    }
}

/// The index on disk was written with a different format than declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("commit metadata index format version mismatch (expecting {expected}, found on disk {found})")]
pub struct FormatVersionMismatch {
    /// Version the generation declares.
    pub expected: IndexFormatVersion,
    /// Version recorded in the commit metadata.
    pub found: IndexFormatVersion,
}

/// Picks how replication restarts from `metadata`.
pub fn resolve_action(
    metadata: &CommitMetadata,
    declared: IndexFormatVersion,
) -> Result<RecoveryAction, FormatVersionMismatch> {
    if metadata.is_empty() {
        info!("no commit metadata found, running a full copy");
        return Ok(RecoveryAction::RunFullCopy);
    }

    let Some(found) = metadata.backend_format_version() else {
        error!("commit metadata has no index format version, running a full copy");
        return Ok(RecoveryAction::RunFullCopy);
    };

    if found != declared {
        return Err(FormatVersionMismatch {
            expected: declared,
            found,
        });
    }

    if let Some(record) = metadata.full_copy_resume_record() {
        info!("found full copy resume record, resuming full copy");
        return Ok(RecoveryAction::ResumeFullCopy(record.clone()));
    }

    match metadata.change_stream_resume_record() {
        Some(record) => Ok(RecoveryAction::ResumeTailing(record.clone())),
        None => {
            error!("commit metadata has no resume record, running a full copy");
            Ok(RecoveryAction::RunFullCopy)
        }
    }
}

/// Applies the persisted markers, then [`resolve_action`].
pub fn decide_startup(
    metadata: &CommitMetadata,
    declared: IndexFormatVersion,
    shut_down_when_collection_missing: bool,
) -> Result<StartupDecision, FormatVersionMismatch> {
    if let Some(reason) = metadata.exceeded_limit_reason() {
        return Ok(StartupDecision::FailExceeded(reason.to_string()));
    }

    if let Some(stale) = metadata.stale_state() {
        return Ok(StartupDecision::ServeStale(stale.clone()));
    }

    if shut_down_when_collection_missing
        && metadata
            .index_state()
            .is_some_and(|state| state.is_collection_not_found())
    {
        return Ok(StartupDecision::CollectionNotFound);
    }

    resolve_action(metadata, declared).map(StartupDecision::Replicate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use replix_commit::{IndexStateInfo, Namespace, OpTime, ResumeToken, StaleReason};

    fn tail_record() -> ChangeStreamResumeRecord {
        ChangeStreamResumeRecord::new(
            Namespace::new("db", "coll"),
            ResumeToken::from_op_time(OpTime::new(50, 2)),
        )
    }

    fn copy_record() -> FullCopyResumeRecord {
        FullCopyResumeRecord::NaturalOrder {
            namespace: Namespace::new("db", "coll"),
            high_water_mark: OpTime::new(40, 0),
            scan_resume_token: "t".into(),
        }
    }

    #[test]
    fn never_committed_runs_full_copy() {
        let action = resolve_action(&CommitMetadata::empty(), IndexFormatVersion::CURRENT).unwrap();
        assert_eq!(action, RecoveryAction::RunFullCopy);
    }

    #[test]
    fn finished_copy_resumes_tailing() {
        let metadata = CommitMetadata::change_stream_resume(tail_record(), IndexFormatVersion::CURRENT);
        let action = resolve_action(&metadata, IndexFormatVersion::CURRENT).unwrap();
        assert_eq!(action, RecoveryAction::ResumeTailing(tail_record()));
    }

    #[test]
    fn interrupted_copy_resumes_copy() {
        let metadata = CommitMetadata::full_copy_resume(IndexFormatVersion::CURRENT, copy_record());
        let action = resolve_action(&metadata, IndexFormatVersion::CURRENT).unwrap();
        assert_eq!(action, RecoveryAction::ResumeFullCopy(copy_record()));
    }

    #[test]
    fn format_mismatch_is_an_error() {
        let metadata = CommitMetadata::change_stream_resume(tail_record(), IndexFormatVersion::new(5));
        let err = resolve_action(&metadata, IndexFormatVersion::new(6)).unwrap_err();
        assert_eq!(err.expected, IndexFormatVersion::new(6));
        assert_eq!(err.found, IndexFormatVersion::new(5));
    }

    #[test]
    fn markers_take_priority() {
        let exceeded = CommitMetadata::exceeded("too many fields");
        assert_eq!(
            decide_startup(&exceeded, IndexFormatVersion::CURRENT, false).unwrap(),
            StartupDecision::FailExceeded("too many fields".into())
        );

        let info = StaleStateInfo::new(OpTime::new(3, 3), StaleReason::DocsExceeded, "docs");
        assert_eq!(
            decide_startup(&CommitMetadata::stale(info.clone()), IndexFormatVersion::CURRENT, false)
                .unwrap(),
            StartupDecision::ServeStale(info)
        );
    }

    #[test]
    fn collection_not_found_marker_is_gated() {
        let metadata = CommitMetadata::from_index_state(IndexStateInfo::collection_not_found());
        assert_eq!(
            decide_startup(&metadata, IndexFormatVersion::CURRENT, true).unwrap(),
            StartupDecision::CollectionNotFound
        );
        assert_eq!(
            decide_startup(&metadata, IndexFormatVersion::CURRENT, false)
                .unwrap()
                .name(),
            "RunFullCopy"
        );
    }

    proptest! {
        #[test]
        fn matching_version_never_fails(
            has_tail in any::<bool>(),
            has_copy in any::<bool>(),
            version in 4u32..=6,
        ) {
            let version = IndexFormatVersion::new(version);
            let metadata = match (has_tail, has_copy) {
                (true, _) => CommitMetadata::change_stream_resume(tail_record(), version),
                (false, true) => CommitMetadata::full_copy_resume(version, copy_record()),
                (false, false) => CommitMetadata::empty(),
            };
            prop_assert!(resolve_action(&metadata, version).is_ok());
        }

        #[test]
        fn mismatched_version_always_fails(found in 1u32..100, declared in 1u32..100) {
            prop_assume!(found != declared);
            let metadata = CommitMetadata::change_stream_resume(
                tail_record(),
                IndexFormatVersion::new(found),
            );
            prop_assert!(resolve_action(&metadata, IndexFormatVersion::new(declared)).is_err());
        }
    }
}
