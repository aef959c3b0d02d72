//! Property tests for startup decisions, backoff and engine exclusivity.

use proptest::prelude::*;
use replix_commit::{CommitMetadata, IndexFormatVersion, OpTime};
use replix_replication::{
    decide_startup, resolve_action, BackoffContext, BackoffPolicy, Cause, ChangeTailError,
    FullCopyError, LifecycleState, RecoveryAction, SourceError, StartupDecision,
};
use replix_testkit::prelude::*;
use std::collections::BTreeSet;
use std::time::Duration;

proptest! {
    #[test]
    fn startup_decision_is_total(
        metadata in commit_metadata_strategy(),
        declared in format_version_strategy(),
        shut_down_when_missing in any::<bool>(),
    ) {
        let recorded = metadata.backend_format_version();
        match decide_startup(&metadata, declared, shut_down_when_missing) {
            Ok(_) => {}
            Err(mismatch) => {
                prop_assert_eq!(Some(mismatch.found), recorded);
                prop_assert_eq!(mismatch.expected, declared);
            }
        }
    }

    #[test]
    fn markers_win_over_versions(
        metadata in commit_metadata_strategy(),
        declared in format_version_strategy(),
    ) {
        let decision = decide_startup(&metadata, declared, true);
        if metadata.exceeded_limit_reason().is_some() {
            prop_assert!(matches!(decision, Ok(StartupDecision::FailExceeded(_))));
        } else if metadata.stale_state().is_some() {
            prop_assert!(matches!(decision, Ok(StartupDecision::ServeStale(_))));
        } else if metadata.index_state().is_some() {
            prop_assert!(matches!(decision, Ok(StartupDecision::CollectionNotFound)));
        }
    }

    #[test]
    fn tail_record_resumes_tailing_when_versions_match(
        record in change_stream_record_strategy(),
        version in format_version_strategy(),
    ) {
        let metadata = CommitMetadata::change_stream_resume(record.clone(), version);
        prop_assert_eq!(
            resolve_action(&metadata, version).unwrap(),
            RecoveryAction::ResumeTailing(record)
        );
    }

    #[test]
    fn last_applied_is_one_before_resume_point(op_time in op_time_strategy()) {
        let last = op_time.last_applied_before();
        prop_assert_eq!(last.seconds, op_time.seconds);
        if op_time.increment == 0 {
            prop_assert_eq!(last.increment, 0);
        } else {
            prop_assert_eq!(last.increment, op_time.increment - 1);
        }
        prop_assert!(last <= op_time);
    }
}

#[test]
fn optime_correction_examples() {
    assert_eq!(OpTime::new(100, 5).last_applied_before(), OpTime::new(100, 4));
    assert_eq!(OpTime::new(100, 0).last_applied_before(), OpTime::new(100, 0));
}

#[test]
fn rate_limit_backoff_is_jittered_within_bound() {
    let bound = Duration::from_secs(10);
    let policy = BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(20), bound);
    let rate_limited: Cause =
        SourceError::server(462, "IngressRequestRateLimitExceeded", "slow down").into_cause();

    let samples: Vec<Duration> = (0..1000)
        .map(|_| policy.duration(BackoffContext::SteadyStateTransient, Some(&rate_limited)))
        .collect();

    assert!(samples.iter().all(|d| *d <= bound));
    let distinct: BTreeSet<Duration> = samples.into_iter().collect();
    assert!(distinct.len() > 1);
}

#[test]
fn other_backoff_is_fixed() {
    let policy = BackoffPolicy::new(
        Duration::from_secs(30),
        Duration::from_secs(20),
        Duration::from_secs(10),
    );
    let transient: Cause = SourceError::driver(6, "HostUnreachable", "reset").into_cause();

    for _ in 0..100 {
        assert_eq!(
            policy.duration(BackoffContext::SteadyStateTransient, Some(&transient)),
            Duration::from_secs(20)
        );
        assert_eq!(
            policy.duration(BackoffContext::FullCopyResync, None),
            Duration::from_secs(30)
        );
    }
}

#[tokio::test(start_paused = true)]
async fn at_most_one_engine_is_ever_outstanding() {
    let harness = Harness::start();
    let check = |h: &Harness| {
        let active = h.mocks.active.current();
        assert!(active <= 1);
        assert!(!(active > 0 && h.manager.has_pending_backoff()));
    };

    // Copy: invalidated, transient, resync, then succeed.
    let copy = harness.next_full_copy().await;
    check(&harness);
    copy.fail(FullCopyError::Invalidated {
        resume: natural_order_record(3),
    });
    let copy = harness.next_full_copy().await;
    check(&harness);
    copy.fail(FullCopyError::ResumableTransient {
        cause: SourceError::driver(6, "HostUnreachable", "reset").into_cause(),
    });
    harness
        .wait_until(|h| {
            check(h);
            h.manager.state() == LifecycleState::InitialSyncBackoff
        })
        .await
        .expect("no backoff");
    let copy = harness.next_full_copy().await;
    check(&harness);
    copy.fail(FullCopyError::RequiresResync {
        message: "cursor lost".to_string(),
        cause: None,
    });
    let copy = harness.next_full_copy().await;
    check(&harness);
    copy.succeed(resume_record(10, 1));

    // Tail: invalidated, transient, rename, resync.
    let tail = harness.next_tail().await;
    check(&harness);
    tail.fail(ChangeTailError::Invalidated {
        resume: resume_record(11, 0),
    });
    let tail = harness.next_tail().await;
    check(&harness);
    tail.fail(ChangeTailError::Transient {
        cause: SourceError::server(462, "IngressRequestRateLimitExceeded", "slow down")
            .into_cause(),
    });
    harness
        .wait_until(|h| {
            check(h);
            h.manager.has_pending_backoff()
        })
        .await
        .expect("no backoff");
    let tail = harness.next_tail().await;
    check(&harness);
    tail.fail(ChangeTailError::RequiresResync {
        message: "history lost".to_string(),
        cause: None,
    });
    let _copy = harness.next_full_copy().await;
    check(&harness);

    assert_eq!(harness.mocks.active.max(), 1);
    assert_eq!(harness.fatal.count(), 0);
}

#[test]
fn declared_versions_below_minimum_are_unsupported() {
    assert!(!IndexFormatVersion::new(3).is_supported());
    assert!(IndexFormatVersion::CURRENT.is_supported());
}
