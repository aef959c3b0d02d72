//! Replication counters and the per-index op-time gauge.

use parking_lot::{Mutex, MutexGuard};
use replix_commit::OpTime;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Label set under which an engine failure is counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExceptionKey {
    /// Error type, or the cause's type for unexpected failures.
    pub error: String,
    /// Failure category.
    pub category: String,
    /// Type of the underlying cause.
    pub cause: String,
    /// Where the cause was raised.
    pub cause_category: String,
}

/// A named counter with its labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    /// Counter name.
    pub name: &'static str,
    /// Label pairs, in the order they were given.
    pub labels: Vec<(&'static str, String)>,
}

/// Point-in-time copy of a manager's counters.
#[derive(Debug, Clone, Default)]
pub struct ReplicationMetricsSnapshot {
    /// Engine failures by label set.
    pub exceptions: BTreeMap<ExceptionKey, u64>,
    /// Lifecycle transitions by (from, to).
    pub transitions: BTreeMap<(&'static str, &'static str), u64>,
    /// Index drops by status reason.
    pub indexes_dropped: BTreeMap<&'static str, u64>,
    /// Other named counters.
    pub counters: BTreeMap<CounterKey, u64>,
}

impl ReplicationMetricsSnapshot {
    /// Total failures recorded, across all labels.
    pub fn total_exceptions(&self) -> u64 {
        self.exceptions.values().sum()
    }

    /// Failures recorded in `category`.
    pub fn exceptions_in(&self, category: &str) -> u64 {
        self.exceptions
            .iter()
            .filter(|(key, _)| key.category == category)
            .map(|(_, count)| count)
            .sum()
    }

    /// Number of transitions from `from` to `to`.
    pub fn transition_count(&self, from: &str, to: &str) -> u64 {
        self.transitions
            .iter()
            .filter(|((f, t), _)| *f == from && *t == to)
            .map(|(_, count)| count)
            .sum()
    }

    /// Value of counter `name`, summed over its label sets.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|(key, _)| key.name == name)
            .map(|(_, count)| count)
            .sum()
    }
}

/// Counters owned by one replication manager.
#[derive(Debug, Default)]
pub struct ReplicationMetrics {
    inner: Mutex<ReplicationMetricsSnapshot>,
}

/// Placeholder reason for drops without one.
pub const UNKNOWN_DROP_REASON: &str = "unknown";

impl ReplicationMetrics {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every counter.
    pub fn snapshot(&self) -> ReplicationMetricsSnapshot {
        self.inner.lock().clone()
    }

    pub(crate) fn record_exception(&self, key: ExceptionKey) {
        *self.inner.lock().exceptions.entry(key).or_insert(0) += 1;
    }

    pub(crate) fn record_transition(&self, from: &'static str, to: &'static str) {
        *self.inner.lock().transitions.entry((from, to)).or_insert(0) += 1;
    }

    pub(crate) fn record_index_dropped(&self, reason: &'static str) {
        *self.inner.lock().indexes_dropped.entry(reason).or_insert(0) += 1;
    }

    pub(crate) fn increment(&self, name: &'static str, labels: Vec<(&'static str, String)>) {
        let key = CounterKey { name, labels };
        *self.inner.lock().counters.entry(key).or_insert(0) += 1;
    }
}

/// Last-applied operation time of one index.
///
/// Guarded by its own lock so that a close path can unset it without
/// touching the manager's state lock. A manager holds this lock while it
/// publishes a status that the op time must be consistent with.
#[derive(Debug, Default)]
pub struct OpTimeGauge {
    value: Mutex<Option<OpTime>>,
}

/// Exclusive access to an [`OpTimeGauge`].
pub struct OpTimeGaugeGuard<'a> {
    value: MutexGuard<'a, Option<OpTime>>,
}

impl OpTimeGaugeGuard<'_> {
    /// Sets the gauge.
    pub fn set(&mut self, op_time: OpTime) {
        *self.value = Some(op_time);
    }
}

impl OpTimeGauge {
    /// Locks the gauge for an update.
    pub fn lock(&self) -> OpTimeGaugeGuard<'_> {
        OpTimeGaugeGuard {
            value: self.value.lock(),
        }
    }

    /// Sets the gauge.
    pub fn update(&self, op_time: OpTime) {
        self.lock().set(op_time);
    }

    /// Clears the gauge.
    pub fn unset(&self) {
        *self.value.lock() = None;
    }

    /// Current value.
    pub fn get(&self) -> Option<OpTime> {
        *self.value.lock()
    }
}

/// Per-index indexing metrics, owned by the Indexed Store.
#[derive(Debug, Default)]
pub struct IndexMetrics {
    replication_op_time: OpTimeGauge,
    full_copy_exceptions: AtomicU64,
    change_tail_exceptions: AtomicU64,
    consecutive_full_copy_resyncs: AtomicU64,
}

impl IndexMetrics {
    /// Creates zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-applied op time gauge.
    pub fn replication_op_time(&self) -> &OpTimeGauge {
        &self.replication_op_time
    }

    /// Classified full-copy failures seen.
    pub fn full_copy_exceptions(&self) -> u64 {
        self.full_copy_exceptions.load(Ordering::Relaxed)
    }

    /// Classified tailing failures seen.
    pub fn change_tail_exceptions(&self) -> u64 {
        self.change_tail_exceptions.load(Ordering::Relaxed)
    }

    /// Full-copy resyncs since the last successful copy.
    pub fn consecutive_full_copy_resyncs(&self) -> u64 {
        self.consecutive_full_copy_resyncs.load(Ordering::Relaxed)
    }

    pub(crate) fn record_full_copy_exception(&self) {
        self.full_copy_exceptions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_change_tail_exception(&self) {
        self.change_tail_exceptions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_full_copy_resync(&self) {
        self.consecutive_full_copy_resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset_full_copy_resyncs(&self) {
        self.consecutive_full_copy_resyncs.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_counts() {
        let metrics = ReplicationMetrics::new();
        metrics.record_transition("INITIALIZING", "INITIAL_SYNC");
        metrics.record_transition("INITIALIZING", "INITIAL_SYNC");
        metrics.record_index_dropped(UNKNOWN_DROP_REASON);
        metrics.increment(
            "natural_order_scan_retry",
            vec![("reason", "server_query_failed".into())],
        );
        metrics.increment(
            "natural_order_scan_retry",
            vec![("reason", "incompatible_resume_record".into())],
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transition_count("INITIALIZING", "INITIAL_SYNC"), 2);
        assert_eq!(snapshot.indexes_dropped.get(UNKNOWN_DROP_REASON), Some(&1));
        assert_eq!(snapshot.counter("natural_order_scan_retry"), 2);
        assert_eq!(snapshot.counter("missing"), 0);
    }

    #[test]
    fn exceptions_by_category() {
        let metrics = ReplicationMetrics::new();
        let key = ExceptionKey {
            error: "ChangeTailError".into(),
            category: "TRANSIENT".into(),
            cause: "None".into(),
            cause_category: "None".into(),
        };
        metrics.record_exception(key.clone());
        metrics.record_exception(key);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.exceptions_in("TRANSIENT"), 2);
        assert_eq!(snapshot.total_exceptions(), 2);
    }

    #[test]
    fn gauge_update_and_unset() {
        let gauge = OpTimeGauge::default();
        {
            let mut guard = gauge.lock();
            guard.set(OpTime::new(4, 1));
        }
        assert_eq!(gauge.get(), Some(OpTime::new(4, 1)));
        gauge.unset();
        assert_eq!(gauge.get(), None);
    }

    #[test]
    fn resync_counter_resets() {
        let metrics = IndexMetrics::new();
        metrics.record_full_copy_resync();
        metrics.record_full_copy_resync();
        assert_eq!(metrics.consecutive_full_copy_resyncs(), 2);
        metrics.reset_full_copy_resyncs();
        assert_eq!(metrics.consecutive_full_copy_resyncs(), 0);
    }
}
