//! Wait durations before retrying a failed engine.

use crate::config::ReplicationConfig;
use crate::failure::{is_ingress_rate_limit, Cause};
use rand::{thread_rng, Rng};
use std::time::Duration;

/// Which retry is being scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffContext {
    /// Re-running or resuming a full copy.
    FullCopyResync,
    /// Resuming tailing after a transient error.
    SteadyStateTransient,
}

/// Picks how long to wait before a retry.
///
/// Rate-limit rejections from the source server get a full-jitter wait so
/// that many indexes backing off at once spread out. Everything else waits
/// the fixed duration configured for the context.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    resync: Duration,
    transient: Duration,
    rate_limit_bound: Duration,
}

impl BackoffPolicy {
    /// Creates a policy from explicit durations.
    pub fn new(resync: Duration, transient: Duration, rate_limit_bound: Duration) -> Self {
        Self {
            resync,
            transient,
            rate_limit_bound,
        }
    }

    /// Creates a policy from the replication configuration.
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self::new(
            config.resync_backoff,
            config.transient_backoff,
            config.request_rate_limit_backoff,
        )
    }

    /// Returns the fixed wait for `context`.
    pub fn fixed(&self, context: BackoffContext) -> Duration {
        match context {
            BackoffContext::FullCopyResync => self.resync,
            BackoffContext::SteadyStateTransient => self.transient,
        }
    }

    /// Returns the wait before retrying after `cause`.
    pub fn duration(&self, context: BackoffContext, cause: Option<&Cause>) -> Duration {
        if cause.is_some_and(is_ingress_rate_limit) {
            full_jitter(self.rate_limit_bound)
        } else {
            self.fixed(context)
        }
    }
}

/// Returns a uniformly random duration in `[0, bound]`, at millisecond granularity.
pub fn full_jitter(bound: Duration) -> Duration {
    let max_ms = u64::try_from(bound.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{codes, SourceError};
    use std::collections::HashSet;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(30),
            Duration::from_secs(5),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn rate_limit_waits_are_jittered_within_bound() {
        let cause = SourceError::server(
            codes::INGRESS_REQUEST_RATE_LIMIT_EXCEEDED,
            "IngressRequestRateLimitExceeded",
            "rate limited",
        )
        .into_cause();
        let policy = policy();

        let samples: Vec<Duration> = (0..1000)
            .map(|_| policy.duration(BackoffContext::SteadyStateTransient, Some(&cause)))
            .collect();

        assert!(samples.iter().all(|d| *d <= Duration::from_secs(10)));
        let distinct: HashSet<_> = samples.iter().collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn other_causes_wait_the_fixed_duration() {
        let cause = SourceError::server(6, "HostUnreachable", "down").into_cause();
        let policy = policy();

        assert_eq!(
            policy.duration(BackoffContext::SteadyStateTransient, Some(&cause)),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.duration(BackoffContext::FullCopyResync, Some(&cause)),
            Duration::from_secs(30)
        );
        assert_eq!(
            policy.duration(BackoffContext::FullCopyResync, None),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn zero_bound_yields_zero() {
        assert_eq!(full_jitter(Duration::ZERO), Duration::ZERO);
    }
}
