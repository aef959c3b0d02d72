//! Property-based test generators using proptest.

use proptest::prelude::*;
use replix_commit::{
    ChangeStreamResumeRecord, CommitMetadata, FullCopyResumeRecord, IndexFormatVersion,
    IndexStateInfo, Namespace, OpTime, ResumeToken, StaleReason, StaleStateInfo,
};

/// Strategy for op times, including the zero time.
pub fn op_time_strategy() -> impl Strategy<Value = OpTime> {
    prop_oneof![
        1 => Just(OpTime::new(0, 0)),
        1 => (1u32.., Just(0u32)).prop_map(|(s, i)| OpTime::new(s, i)),
        8 => (any::<u32>(), any::<u32>()).prop_map(|(s, i)| OpTime::new(s, i)),
    ]
}

/// Strategy for namespaces.
pub fn namespace_strategy() -> impl Strategy<Value = Namespace> {
    ("[a-z][a-z0-9_]{0,15}", "[a-z][a-z0-9_.]{0,31}")
        .prop_map(|(database, collection)| Namespace::new(database, collection))
}

/// Strategy for index format versions, supported or not.
pub fn format_version_strategy() -> impl Strategy<Value = IndexFormatVersion> {
    (1u32..=8).prop_map(IndexFormatVersion::new)
}

/// Strategy for change-stream resume records.
pub fn change_stream_record_strategy() -> impl Strategy<Value = ChangeStreamResumeRecord> {
    (namespace_strategy(), op_time_strategy()).prop_map(|(namespace, op_time)| {
        ChangeStreamResumeRecord::new(namespace, ResumeToken::from_op_time(op_time))
    })
}

/// Strategy for full-copy resume records in either scan order.
pub fn full_copy_record_strategy() -> impl Strategy<Value = FullCopyResumeRecord> {
    (namespace_strategy(), op_time_strategy(), "[a-z0-9]{1,24}", any::<bool>()).prop_map(
        |(namespace, high_water_mark, position, natural)| {
            if natural {
                FullCopyResumeRecord::NaturalOrder {
                    namespace,
                    high_water_mark,
                    scan_resume_token: position,
                }
            } else {
                FullCopyResumeRecord::IdOrder {
                    namespace,
                    high_water_mark,
                    last_scanned_id: position,
                }
            }
        },
    )
}

/// Strategy for stale markers.
pub fn stale_state_strategy() -> impl Strategy<Value = StaleStateInfo> {
    (
        op_time_strategy(),
        prop_oneof![Just(StaleReason::DocsExceeded), Just(StaleReason::UnexpectedError)],
        ".{0,40}",
    )
        .prop_map(|(op_time, reason, detail)| {
            let message = reason.format_message(&detail);
            StaleStateInfo::new(op_time, reason, message)
        })
}

/// Strategy for every shape of commit metadata the manager may find.
pub fn commit_metadata_strategy() -> impl Strategy<Value = CommitMetadata> {
    prop_oneof![
        Just(CommitMetadata::empty()),
        "[ -~]{1,40}".prop_map(CommitMetadata::exceeded),
        stale_state_strategy().prop_map(CommitMetadata::stale),
        Just(CommitMetadata::from_index_state(IndexStateInfo::collection_not_found())),
        (format_version_strategy(), full_copy_record_strategy())
            .prop_map(|(version, record)| CommitMetadata::full_copy_resume(version, record)),
        (change_stream_record_strategy(), format_version_strategy())
            .prop_map(|(record, version)| CommitMetadata::change_stream_resume(record, version)),
    ]
}
