//! Failure taxonomy reported by the full-copy and change-tail engines.
//!
//! Each engine fails with a closed sum type, one variant per category the
//! manager knows how to react to. Anything else arrives as
//! [`EngineFailure::Unexpected`] and goes through the safety net.

use crate::metrics::ExceptionKey;
use replix_commit::{ChangeStreamResumeRecord, FullCopyResumeRecord};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The underlying cause attached to an engine failure.
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Label used in metrics when a field has no value.
pub(crate) const NONE_LABEL: &str = "None";

/// Error codes returned by the source server that the manager reacts to.
pub mod codes {
    /// A view definition cannot be resolved.
    pub const VIEW_DEPTH_LIMIT_EXCEEDED: i32 = 165;
    /// The command cannot run against a view.
    pub const COMMAND_NOT_SUPPORTED_ON_VIEW: i32 = 166;
    /// An option cannot be used against a view.
    pub const OPTION_NOT_SUPPORTED_ON_VIEW: i32 = 167;
    /// The view's pipeline is invalid.
    pub const INVALID_VIEW_DEFINITION: i32 = 182;
    /// The record a scan was asked to resume from no longer exists.
    pub const KEY_NOT_FOUND: i32 = 211;
    /// The server does not allow the requested query feature.
    pub const QUERY_FEATURE_NOT_ALLOWED: i32 = 224;
    /// No query plan could be built, e.g. under `notablescan`.
    pub const NO_QUERY_EXECUTION_PLANS: i32 = 291;
    /// The server rejected the request because of ingress rate limiting.
    pub const INGRESS_REQUEST_RATE_LIMIT_EXCEEDED: i32 = 462;
    /// A pipeline stage is not recognized.
    pub const UNRECOGNIZED_PIPELINE_STAGE: i32 = 40324;
    /// A command field is not recognized by the server.
    pub const IDL_UNKNOWN_FIELD: i32 = 40415;
}

/// Name of the change-stream option scoping update lookups to a collection id.
pub const COLLECTION_ID_FILTER_OPTION: &str = "matchCollectionUUIDForUpdateLookup";

/// Where a [`SourceError`] was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorOrigin {
    /// Returned by the source server.
    Server,
    /// Raised by the client driver.
    Driver,
}

/// An error raised talking to the source server.
#[derive(Debug, Clone, Error)]
#[error("{code_name} ({code}): {message}")]
pub struct SourceError {
    /// Numeric error code.
    pub code: i32,
    /// Symbolic error code name.
    pub code_name: String,
    /// Error message.
    pub message: String,
    /// Where the error was raised.
    pub origin: ErrorOrigin,
}

impl SourceError {
    /// Creates an error returned by the source server.
    pub fn server(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name: code_name.into(),
            message: message.into(),
            origin: ErrorOrigin::Server,
        }
    }

    /// Creates an error raised by the client driver.
    pub fn driver(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name: code_name.into(),
            message: message.into(),
            origin: ErrorOrigin::Driver,
        }
    }

    /// Wraps the error as a [`Cause`].
    pub fn into_cause(self) -> Cause {
        Arc::new(self)
    }
}

/// The server version cannot serve a requested feature.
#[derive(Debug, Clone, Error)]
#[error("unsupported source server version: {0}")]
pub struct UnsupportedServerVersion(pub String);

/// Memory was exhausted somewhere in the indexing pipeline.
#[derive(Debug, Clone, Error)]
#[error("out of memory: {0}")]
pub struct OutOfMemory(pub String);

/// Adds a message in front of an underlying cause.
#[derive(Debug, Clone, Error)]
#[error("{message}: {source}")]
pub struct ContextError {
    message: String,
    #[source]
    source: Cause,
}

impl ContextError {
    /// Wraps `source` with `message`.
    pub fn new(message: impl Into<String>, source: Cause) -> Self {
        Self {
            message: message.into(),
            source,
        }
    }

    /// Wraps the error as a [`Cause`].
    pub fn into_cause(self) -> Cause {
        Arc::new(self)
    }
}

/// Failure categories of the full-copy engine.
#[derive(Debug, Clone, Error)]
pub enum FullCopyError {
    /// The source collection was dropped.
    #[error("source collection dropped: {message}")]
    Dropped {
        /// Description from the engine.
        message: String,
    },

    /// The copy cannot succeed and must not be retried.
    #[error("full copy failed: {cause}")]
    Failed {
        /// Underlying cause.
        cause: Cause,
    },

    /// The source has more fields than the configured limit.
    #[error("{reason}")]
    FieldLimitExceeded {
        /// Limit description.
        reason: String,
    },

    /// The source has more documents than the configured limit.
    #[error("{cause}")]
    DocsLimitExceeded {
        /// Limit description.
        cause: Cause,
    },

    /// The copy queue, this manager or this index was paused or stopped.
    #[error("full copy shut down")]
    ShutDown,

    /// The copy must start over from scratch.
    #[error("full copy requires resync: {message}")]
    RequiresResync {
        /// Description from the engine.
        message: String,
        /// Underlying cause, if any.
        cause: Option<Cause>,
    },

    /// A transient error; the copy may continue from its last checkpoint.
    #[error("transient full copy error: {cause}")]
    ResumableTransient {
        /// Underlying cause.
        cause: Cause,
    },

    /// The server invalidated the copy's cursor.
    #[error("full copy cursor invalidated")]
    Invalidated {
        /// Where to continue from.
        resume: FullCopyResumeRecord,
    },

    /// The source collection could not be resolved.
    #[error("source collection not found: {message}")]
    CollectionNotFound {
        /// Description from the engine.
        message: String,
    },
}

impl FullCopyError {
    /// Creates a requires-resync error from a cause.
    pub fn requires_resync(cause: Cause) -> Self {
        Self::RequiresResync {
            message: cause.to_string(),
            cause: Some(cause),
        }
    }
}

impl FailureCategory for FullCopyError {
    const NAME: &'static str = "FullCopyError";

    fn category(&self) -> &'static str {
        match self {
            FullCopyError::Dropped { .. } => "DROPPED",
            FullCopyError::Failed { .. } => "FAILED",
            FullCopyError::FieldLimitExceeded { .. } => "FIELD_EXCEEDED",
            FullCopyError::DocsLimitExceeded { .. } => "DOCS_EXCEEDED",
            FullCopyError::ShutDown => SHUT_DOWN_CATEGORY,
            FullCopyError::RequiresResync { .. } => "REQUIRES_RESYNC",
            FullCopyError::ResumableTransient { .. } => "RESUMABLE_TRANSIENT",
            FullCopyError::Invalidated { .. } => "INVALIDATED",
            FullCopyError::CollectionNotFound { .. } => "DOES_NOT_EXIST",
        }
    }

    fn underlying_cause(&self) -> Option<&Cause> {
        match self {
            FullCopyError::Failed { cause }
            | FullCopyError::DocsLimitExceeded { cause }
            | FullCopyError::ResumableTransient { cause } => Some(cause),
            FullCopyError::RequiresResync { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }
}

/// Failure categories of the change-tail engine.
#[derive(Debug, Clone, Error)]
pub enum ChangeTailError {
    /// The source collection was dropped.
    #[error("source collection dropped: {message}")]
    Dropped {
        /// Description from the engine.
        message: String,
    },

    /// The stream cannot continue; the index must be rebuilt from a full copy.
    #[error("change tail requires resync: {message}")]
    RequiresResync {
        /// Description from the engine.
        message: String,
        /// Underlying cause, if any.
        cause: Option<Cause>,
    },

    /// A transient error; tailing may continue from its last checkpoint.
    #[error("transient change tail error: {cause}")]
    Transient {
        /// Underlying cause.
        cause: Cause,
    },

    /// A replacement index is needed but this one may keep serving.
    #[error("change tail requires a new index: {cause}")]
    NonInvalidatingResync {
        /// Underlying cause.
        cause: Cause,
    },

    /// The source has more fields than the configured limit.
    #[error("{reason}")]
    FieldLimitExceeded {
        /// Limit description.
        reason: String,
    },

    /// The source has more documents than the configured limit.
    #[error("{cause}")]
    DocsLimitExceeded {
        /// Limit description.
        cause: Cause,
    },

    /// The source collection was renamed.
    #[error("source collection renamed to {}", resume.namespace)]
    Renamed {
        /// Where to continue from; carries the new namespace.
        resume: ChangeStreamResumeRecord,
    },

    /// The server invalidated the change stream.
    #[error("change stream invalidated")]
    Invalidated {
        /// Where to continue from.
        resume: ChangeStreamResumeRecord,
    },

    /// The tailer or this index was stopped.
    #[error("change tail shut down")]
    ShutDown,
}

impl FailureCategory for ChangeTailError {
    const NAME: &'static str = "ChangeTailError";

    fn category(&self) -> &'static str {
        match self {
            ChangeTailError::Dropped { .. } => "DROPPED",
            ChangeTailError::RequiresResync { .. } => "REQUIRES_RESYNC",
            ChangeTailError::Transient { .. } => "TRANSIENT",
            ChangeTailError::NonInvalidatingResync { .. } => "NON_INVALIDATING_RESYNC",
            ChangeTailError::FieldLimitExceeded { .. } => "FIELD_EXCEEDED",
            ChangeTailError::DocsLimitExceeded { .. } => "DOCS_EXCEEDED",
            ChangeTailError::Renamed { .. } => "RENAMED",
            ChangeTailError::Invalidated { .. } => "INVALIDATED",
            ChangeTailError::ShutDown => SHUT_DOWN_CATEGORY,
        }
    }

    fn underlying_cause(&self) -> Option<&Cause> {
        match self {
            ChangeTailError::Transient { cause }
            | ChangeTailError::NonInvalidatingResync { cause }
            | ChangeTailError::DocsLimitExceeded { cause } => Some(cause),
            ChangeTailError::RequiresResync { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }
}

/// An engine failure as reported to the manager.
#[derive(Debug, Clone)]
pub enum EngineFailure<E> {
    /// One of the categories the manager knows how to handle.
    Classified(E),
    /// Anything else.
    Unexpected(Cause),
}

/// Category name shared by both engines for a requested stop.
const SHUT_DOWN_CATEGORY: &str = "SHUT_DOWN";

/// A closed failure taxonomy reported by one engine.
pub trait FailureCategory: fmt::Display {
    /// Name of the taxonomy, used as the error label in metrics.
    const NAME: &'static str;

    /// Returns the category name used in logs and metrics.
    fn category(&self) -> &'static str;

    /// Returns the underlying cause, if any.
    fn underlying_cause(&self) -> Option<&Cause>;
}

impl<E> From<E> for EngineFailure<E> {
    fn from(error: E) -> Self {
        EngineFailure::Classified(error)
    }
}

impl<E: fmt::Display> fmt::Display for EngineFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineFailure::Classified(error) => write!(f, "{error}"),
            EngineFailure::Unexpected(cause) => write!(f, "unexpected error: {cause}"),
        }
    }
}

impl<E: FailureCategory> EngineFailure<E> {
    /// Returns true if the engine stopped because it was asked to.
    pub fn is_shut_down(&self) -> bool {
        matches!(self, EngineFailure::Classified(e) if e.category() == SHUT_DOWN_CATEGORY)
    }

    /// Builds the key under which this failure is counted.
    pub fn exception_key(&self) -> ExceptionKey {
        match self {
            EngineFailure::Classified(e) => ExceptionKey {
                error: E::NAME.to_string(),
                category: e.category().to_string(),
                cause: e.underlying_cause().map_or_else(|| NONE_LABEL.to_string(), cause_label),
                cause_category: e.underlying_cause().map_or(NONE_LABEL, cause_category).to_string(),
            },
            EngineFailure::Unexpected(cause) => ExceptionKey {
                error: cause_label(cause),
                category: NONE_LABEL.to_string(),
                cause: NONE_LABEL.to_string(),
                cause_category: NONE_LABEL.to_string(),
            },
        }
    }
}

/// Iterates over `cause` and every error in its source chain.
///
/// A [`Cause`] held as a source reports itself through `Arc`'s forwarding
/// impl; each link is unwrapped so downcasts see the shared error.
fn chain(cause: &Cause) -> impl Iterator<Item = &(dyn StdError + 'static)> {
    let root: &(dyn StdError + 'static) = &**cause;
    std::iter::successors(Some(root), |&e| e.source()).map(unshare)
}

fn unshare<'a>(error: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    match error.downcast_ref::<Cause>() {
        Some(shared) => unshare(&**shared),
        None => error,
    }
}

/// Finds the first [`SourceError`] in the chain.
pub fn source_error(cause: &Cause) -> Option<&SourceError> {
    chain(cause).find_map(|e| e.downcast_ref::<SourceError>())
}

fn has_code(cause: &Cause, code: i32) -> bool {
    source_error(cause).is_some_and(|e| e.code == code)
}

/// Returns true if the source server rejected the request for ingress rate limiting.
pub fn is_ingress_rate_limit(cause: &Cause) -> bool {
    has_code(cause, codes::INGRESS_REQUEST_RATE_LIMIT_EXCEEDED)
}

/// Returns true if the error comes from resolving or running a view pipeline.
pub fn is_view_pipeline_related(cause: &Cause) -> bool {
    source_error(cause).is_some_and(|e| {
        matches!(
            e.code,
            codes::VIEW_DEPTH_LIMIT_EXCEEDED
                | codes::COMMAND_NOT_SUPPORTED_ON_VIEW
                | codes::OPTION_NOT_SUPPORTED_ON_VIEW
                | codes::INVALID_VIEW_DEFINITION
                | codes::UNRECOGNIZED_PIPELINE_STAGE
        )
    })
}

/// Renders a view-pipeline error for the index status.
pub fn view_pipeline_error_message(cause: &Cause) -> String {
    match source_error(cause) {
        Some(e) => format!("Error processing view pipeline: {}", e.message),
        None => format!("Error processing view pipeline: {cause}"),
    }
}

/// Returns true if the server cannot run a natural-order scan.
pub fn is_natural_order_scan_unsupported(cause: &Cause) -> bool {
    chain(cause).any(|e| e.is::<UnsupportedServerVersion>())
        || has_code(cause, codes::QUERY_FEATURE_NOT_ALLOWED)
}

/// Returns true if the record a resumed scan pointed at no longer matches.
pub fn is_resume_id_mismatch(cause: &Cause) -> bool {
    has_code(cause, codes::KEY_NOT_FOUND)
}

/// Returns true if the server rejected the collection-id update filter.
pub fn is_collection_id_filter_unsupported(cause: &Cause) -> bool {
    source_error(cause).is_some_and(|e| {
        e.code == codes::IDL_UNKNOWN_FIELD && e.message.contains(COLLECTION_ID_FILTER_OPTION)
    })
}

/// Returns true if no query plan could be built.
pub fn is_no_query_execution_plans(cause: &Cause) -> bool {
    has_code(cause, codes::NO_QUERY_EXECUTION_PLANS)
}

/// Returns true if the server refused a collection scan under `notablescan`.
pub fn is_notablescan(cause: &Cause) -> bool {
    source_error(cause).is_some_and(|e| {
        e.code == codes::NO_QUERY_EXECUTION_PLANS && e.message.contains("notablescan")
    })
}

/// Returns true if memory was exhausted anywhere in the chain.
pub fn is_out_of_memory(cause: &Cause) -> bool {
    chain(cause).any(|e| e.is::<OutOfMemory>())
}

/// Label of a cause for the exceptions metric.
pub(crate) fn cause_label(cause: &Cause) -> String {
    let root: &(dyn StdError + 'static) = &**cause;
    if let Some(e) = root.downcast_ref::<SourceError>() {
        format!("SourceError:{}", e.code)
    } else if root.is::<OutOfMemory>() {
        "OutOfMemory".to_string()
    } else if root.is::<UnsupportedServerVersion>() {
        "UnsupportedServerVersion".to_string()
    } else if root.is::<ContextError>() {
        "ContextError".to_string()
    } else {
        "Error".to_string()
    }
}

/// Category of a cause for the exceptions metric.
pub(crate) fn cause_category(cause: &Cause) -> &'static str {
    let root: &(dyn StdError + 'static) = &**cause;
    match root.downcast_ref::<SourceError>() {
        Some(SourceError {
            origin: ErrorOrigin::Driver,
            ..
        }) => "driver",
        Some(SourceError {
            origin: ErrorOrigin::Server,
            ..
        }) => "server",
        None => NONE_LABEL,
    }
}
