//! Configuration for index replication.

use std::time::Duration;

/// Timing and scan options shared by every replication manager.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Wait before re-running a full copy that must start over.
    pub resync_backoff: Duration,
    /// Wait before resuming tailing after a transient error.
    pub transient_backoff: Duration,
    /// Upper bound of the jittered wait after an ingress rate-limit rejection.
    pub request_rate_limit_backoff: Duration,
    /// Whether full copies may scan in natural storage order.
    pub enable_natural_order_scan: bool,
}

impl ReplicationConfig {
    /// Creates a configuration with default timings.
    pub fn new() -> Self {
        Self {
            resync_backoff: Duration::from_secs(30),
            transient_backoff: Duration::from_secs(30),
            request_rate_limit_backoff: Duration::from_secs(10),
            enable_natural_order_scan: true,
        }
    }

    /// Sets the full-copy resync backoff.
    pub fn with_resync_backoff(mut self, backoff: Duration) -> Self {
        self.resync_backoff = backoff;
        self
    }

    /// Sets the tailing transient backoff.
    pub fn with_transient_backoff(mut self, backoff: Duration) -> Self {
        self.transient_backoff = backoff;
        self
    }

    /// Sets the rate-limit backoff bound.
    pub fn with_request_rate_limit_backoff(mut self, backoff: Duration) -> Self {
        self.request_rate_limit_backoff = backoff;
        self
    }

    /// Enables or disables natural-order full-copy scans.
    pub fn with_natural_order_scan(mut self, enabled: bool) -> Self {
        self.enable_natural_order_scan = enabled;
        self
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Boolean gates on replication behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Shut replication down instead of retrying when the collection is missing.
    pub shut_down_when_collection_missing: bool,
    /// Close and keep a failed index's data instead of dropping it.
    pub retain_failed_index_data: bool,
    /// Go stale instead of failing on an unexpected tailing error.
    pub stale_on_unexpected_steady_state_error: bool,
}

impl FeatureFlags {
    /// Creates flags with every gate off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the collection-missing gate.
    pub fn with_shut_down_when_collection_missing(mut self, enabled: bool) -> Self {
        self.shut_down_when_collection_missing = enabled;
        self
    }

    /// Sets the retain-failed-data gate.
    pub fn with_retain_failed_index_data(mut self, enabled: bool) -> Self {
        self.retain_failed_index_data = enabled;
        self
    }

    /// Sets the stale-on-unexpected-error gate.
    pub fn with_stale_on_unexpected_steady_state_error(mut self, enabled: bool) -> Self {
        self.stale_on_unexpected_steady_state_error = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.resync_backoff, Duration::from_secs(30));
        assert_eq!(config.transient_backoff, Duration::from_secs(30));
        assert_eq!(config.request_rate_limit_backoff, Duration::from_secs(10));
        assert!(config.enable_natural_order_scan);

        let flags = FeatureFlags::default();
        assert!(!flags.shut_down_when_collection_missing);
        assert!(!flags.retain_failed_index_data);
        assert!(!flags.stale_on_unexpected_steady_state_error);
    }

    #[test]
    fn builders() {
        let config = ReplicationConfig::new()
            .with_resync_backoff(Duration::from_millis(5))
            .with_natural_order_scan(false);
        assert_eq!(config.resync_backoff, Duration::from_millis(5));
        assert!(!config.enable_natural_order_scan);

        let flags = FeatureFlags::new().with_retain_failed_index_data(true);
        assert!(flags.retain_failed_index_data);
    }
}
