//! User-visible index status.

use crate::error::{ReplicationError, ReplicationResult};
use replix_commit::{IndexStateInfo, OpTime, PersistedReason, PersistedStatusCode};
use std::fmt;

/// Prefix of the status message of an index failed by replication.
pub const REPLICATION_FAILED_PREFIX: &str = "Replication failed: ";

/// Prefix of the status message of an index that exceeded a limit.
pub const EXCEEDED_LIMIT_PREFIX: &str = "Exceeded max limit: ";

/// Message of an index serving data while a replacement is built.
const RECOVERING_NON_TRANSIENT_MESSAGE: &str =
    "Index requires a rebuild; serving existing data until a replacement is ready";

/// Coarse state of an index as seen by queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Not yet known.
    Unknown,
    /// The index or its source does not exist.
    DoesNotExist,
    /// Replication has not started.
    NotStarted,
    /// The full copy is running.
    InitialSync,
    /// Frozen, serving its last indexed data.
    Stale,
    /// Serving queries while a transient error is retried.
    RecoveringTransient,
    /// Serving queries while a replacement index is needed.
    RecoveringNonTransient,
    /// Replicating normally.
    Steady,
    /// Replication stopped and will not recover without intervention.
    Failed,
}

impl StatusCode {
    /// Returns the upper-case name of the code.
    pub fn name(&self) -> &'static str {
        match self {
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::DoesNotExist => "DOES_NOT_EXIST",
            StatusCode::NotStarted => "NOT_STARTED",
            StatusCode::InitialSync => "INITIAL_SYNC",
            StatusCode::Stale => "STALE",
            StatusCode::RecoveringTransient => "RECOVERING_TRANSIENT",
            StatusCode::RecoveringNonTransient => "RECOVERING_NON_TRANSIENT",
            StatusCode::Steady => "STEADY",
            StatusCode::Failed => "FAILED",
        }
    }
}

/// Why an index is failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The manager could not start.
    InitializationFailed,
    /// The full copy failed.
    FullCopyFailed,
    /// Tailing failed.
    ChangeTailFailed,
    /// The source exceeded a configured limit.
    ExceededMaxLimit,
}

/// Why an index does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbsenceReason {
    /// The source collection could not be resolved.
    CollectionNotFound,
    /// The index was dropped.
    IndexDropped,
}

/// Reason attached to a failed or missing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusReason {
    /// See [`FailureReason`].
    Failure(FailureReason),
    /// See [`AbsenceReason`].
    Absence(AbsenceReason),
}

impl StatusReason {
    /// Returns the lower-case label used in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            StatusReason::Failure(FailureReason::InitializationFailed) => "initialization_failed",
            StatusReason::Failure(FailureReason::FullCopyFailed) => "full_copy_failed",
            StatusReason::Failure(FailureReason::ChangeTailFailed) => "change_tail_failed",
            StatusReason::Failure(FailureReason::ExceededMaxLimit) => "exceeded_max_limit",
            StatusReason::Absence(AbsenceReason::CollectionNotFound) => "collection_not_found",
            StatusReason::Absence(AbsenceReason::IndexDropped) => "index_dropped",
        }
    }

    fn allows(&self, code: StatusCode) -> bool {
        match self {
            StatusReason::Failure(_) => code == StatusCode::Failed,
            StatusReason::Absence(_) => code == StatusCode::DoesNotExist,
        }
    }
}

/// Status of an index, published through the Indexed Store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStatus {
    code: StatusCode,
    message: Option<String>,
    optime: Option<OpTime>,
    reason: Option<StatusReason>,
}

impl IndexStatus {
    /// Builds a status from its parts, rejecting reasons the code cannot carry.
    pub fn new(
        code: StatusCode,
        message: Option<String>,
        optime: Option<OpTime>,
        reason: Option<StatusReason>,
    ) -> ReplicationResult<Self> {
        if let Some(r) = reason {
            if !r.allows(code) {
                return Err(ReplicationError::InvalidStatus(format!(
                    "reason {} is not valid for status {}",
                    r.label(),
                    code.name()
                )));
            }
        }
        Ok(Self {
            code,
            message,
            optime,
            reason,
        })
    }

    fn bare(code: StatusCode) -> Self {
        Self {
            code,
            message: None,
            optime: None,
            reason: None,
        }
    }

    /// Status not yet known.
    pub fn unknown() -> Self {
        Self::bare(StatusCode::Unknown)
    }

    /// Replication has not started.
    pub fn not_started() -> Self {
        Self::bare(StatusCode::NotStarted)
    }

    /// The full copy is running.
    pub fn initial_sync() -> Self {
        Self::bare(StatusCode::InitialSync)
    }

    /// The full copy is running and something is worth reporting.
    pub fn initial_sync_with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare(StatusCode::InitialSync)
        }
    }

    /// Replicating normally.
    pub fn steady() -> Self {
        Self::bare(StatusCode::Steady)
    }

    /// Frozen at `optime`.
    pub fn stale(message: impl Into<String>, optime: OpTime) -> Self {
        Self {
            message: Some(message.into()),
            optime: Some(optime),
            ..Self::bare(StatusCode::Stale)
        }
    }

    /// Serving queries while a transient error is retried.
    pub fn recovering_transient(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare(StatusCode::RecoveringTransient)
        }
    }

    /// Serving data indexed up to `optime` while a replacement is needed.
    pub fn recovering_non_transient(optime: OpTime) -> Self {
        Self {
            message: Some(RECOVERING_NON_TRANSIENT_MESSAGE.to_string()),
            optime: Some(optime),
            ..Self::bare(StatusCode::RecoveringNonTransient)
        }
    }

    /// Failed without a specific reason.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare(StatusCode::Failed)
        }
    }

    /// Failed for `reason`.
    pub fn failed_with_reason(message: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            message: Some(message.into()),
            reason: Some(StatusReason::Failure(reason)),
            ..Self::bare(StatusCode::Failed)
        }
    }

    /// The index or its source does not exist.
    pub fn does_not_exist(reason: AbsenceReason) -> Self {
        Self {
            reason: Some(StatusReason::Absence(reason)),
            ..Self::bare(StatusCode::DoesNotExist)
        }
    }

    /// Status corresponding to a persisted marker.
    pub fn from_index_state(info: &IndexStateInfo) -> Self {
        let code = match info.status_code {
            PersistedStatusCode::DoesNotExist => StatusCode::DoesNotExist,
        };
        let reason = match info.reason {
            PersistedReason::CollectionNotFound => AbsenceReason::CollectionNotFound,
        };
        Self {
            reason: Some(StatusReason::Absence(reason)),
            ..Self::bare(code)
        }
    }

    /// Status code.
    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// Status message.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Operation time the status refers to.
    pub fn optime(&self) -> Option<OpTime> {
        self.optime
    }

    /// Reason for a failed or missing index.
    pub fn reason(&self) -> Option<StatusReason> {
        self.reason
    }

    /// Returns true if queries may be served.
    pub fn can_service_queries(&self) -> bool {
        matches!(
            self.code,
            StatusCode::Steady
                | StatusCode::RecoveringTransient
                | StatusCode::RecoveringNonTransient
                | StatusCode::Stale
        )
    }

    /// Returns true if the index was dropped, or is missing without a reason.
    pub fn is_index_dropped(&self) -> bool {
        self.code == StatusCode::DoesNotExist
            && self
                .reason
                .map_or(true, |r| r == StatusReason::Absence(AbsenceReason::IndexDropped))
    }

    /// Returns true if the source collection could not be resolved.
    pub fn is_collection_not_found(&self) -> bool {
        self.code == StatusCode::DoesNotExist
            && self.reason == Some(StatusReason::Absence(AbsenceReason::CollectionNotFound))
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message.as_deref().unwrap_or("");
        match self.code {
            StatusCode::Unknown => write!(f, "unknown"),
            StatusCode::NotStarted => write!(f, "not started"),
            StatusCode::InitialSync if message.is_empty() => write!(f, "initial sync"),
            StatusCode::InitialSync => write!(f, "initial sync: {message}"),
            StatusCode::Steady => write!(f, "steady"),
            StatusCode::Stale => match self.optime {
                Some(optime) => write!(f, "stale since {optime}: {message}"),
                None => write!(f, "stale: {message}"),
            },
            StatusCode::RecoveringTransient | StatusCode::RecoveringNonTransient => {
                write!(f, "recovering: {message}")
            }
            StatusCode::Failed => write!(f, "failed: {message}"),
            StatusCode::DoesNotExist => match self.reason {
                Some(reason) => write!(f, "does not exist: {}", reason.label()),
                None => write!(f, "does not exist"),
            },
        }
    }
}
