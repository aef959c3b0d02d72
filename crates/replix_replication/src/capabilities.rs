//! Source-server capabilities negotiated by a manager.

use crate::config::ReplicationConfig;
use replix_commit::FullCopyResumeRecord;

/// Features the manager asks the engines to use.
///
/// Starts optimistic and is replaced with a downgraded value when the
/// server rejects a feature. A manager never upgrades on its own; the only
/// exception is [`Capabilities::reconciled_with`], which matches the scan
/// order of a resume record the engine already issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    filter_by_collection_id: bool,
    natural_order_scan: bool,
}

impl Capabilities {
    /// Initial capabilities for a new manager.
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            filter_by_collection_id: true,
            natural_order_scan: config.enable_natural_order_scan,
        }
    }

    /// Whether update lookups are scoped to the owning collection id.
    pub fn filter_by_collection_id(&self) -> bool {
        self.filter_by_collection_id
    }

    /// Whether full copies scan in natural storage order.
    pub fn natural_order_scan(&self) -> bool {
        self.natural_order_scan
    }

    /// Stops scoping update lookups by collection id.
    #[must_use]
    pub fn without_collection_id_filter(self) -> Self {
        Self {
            filter_by_collection_id: false,
            ..self
        }
    }

    /// Falls back to id-ordered full copies.
    #[must_use]
    pub fn without_natural_order_scan(self) -> Self {
        Self {
            natural_order_scan: false,
            ..self
        }
    }

    /// Aligns the scan order with `record`.
    #[must_use]
    pub fn reconciled_with(self, record: &FullCopyResumeRecord) -> Self {
        Self {
            natural_order_scan: record.is_natural_order(),
            ..self
        }
    }
}
