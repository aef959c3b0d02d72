//! Persisted markers that stop replication across restarts.

use crate::optime::OpTime;
use serde::{Deserialize, Serialize};

/// Why an index was frozen as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// The source grew past the configured document limit.
    DocsExceeded,
    /// Tailing hit an error nothing knew how to recover from.
    UnexpectedError,
}

impl StaleReason {
    /// Renders the user-facing message for this reason.
    pub fn format_message(&self, detail: &str) -> String {
        match self {
            StaleReason::DocsExceeded => {
                "Index exceeded the maximum number of documents".to_string()
            }
            StaleReason::UnexpectedError if detail.is_empty() => {
                "Replication stopped after an unexpected error".to_string()
            }
            StaleReason::UnexpectedError => {
                format!("Replication stopped after an unexpected error: {detail}")
            }
        }
    }
}

/// Record that the index is serving frozen data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleStateInfo {
    /// Operation time of the last event the index holds.
    pub last_optime: OpTime,
    /// Why replication stopped.
    pub reason: StaleReason,
    /// User-facing message.
    pub message: String,
}

impl StaleStateInfo {
    /// Creates a stale record.
    pub fn new(last_optime: OpTime, reason: StaleReason, message: impl Into<String>) -> Self {
        Self {
            last_optime,
            reason,
            message: message.into(),
        }
    }
}

/// Status codes that may be persisted in an [`IndexStateInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistedStatusCode {
    /// The indexed source does not exist.
    DoesNotExist,
}

/// Reasons that may be persisted in an [`IndexStateInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistedReason {
    /// The source collection could not be resolved.
    CollectionNotFound,
}

/// A persisted index status.
///
/// Only the collection-not-found status is persisted this way; an older
/// reader that drops the field falls back to a full copy, which is
/// acceptable for this status and no other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStateInfo {
    /// Persisted status code.
    pub status_code: PersistedStatusCode,
    /// Persisted reason.
    pub reason: PersistedReason,
}

impl IndexStateInfo {
    /// The marker written when the source collection is missing.
    pub const fn collection_not_found() -> Self {
        Self {
            status_code: PersistedStatusCode::DoesNotExist,
            reason: PersistedReason::CollectionNotFound,
        }
    }

    /// Returns true if this marks a missing source collection.
    pub fn is_collection_not_found(&self) -> bool {
        self.status_code == PersistedStatusCode::DoesNotExist
            && self.reason == PersistedReason::CollectionNotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_messages() {
        assert_eq!(
            StaleReason::UnexpectedError.format_message("boom"),
            "Replication stopped after an unexpected error: boom"
        );
        assert_eq!(
            StaleReason::UnexpectedError.format_message(""),
            "Replication stopped after an unexpected error"
        );
        assert!(StaleReason::DocsExceeded
            .format_message("ignored")
            .contains("maximum number of documents"));
    }

    #[test]
    fn collection_not_found_marker() {
        assert!(IndexStateInfo::collection_not_found().is_collection_not_found());
    }

    #[test]
    fn persisted_names_are_stable() {
        let json = serde_json::to_string(&IndexStateInfo::collection_not_found()).unwrap();
        assert_eq!(
            json,
            r#"{"status_code":"DOES_NOT_EXIST","reason":"COLLECTION_NOT_FOUND"}"#
        );
    }
}
