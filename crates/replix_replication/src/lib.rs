//! # Replix Replication
//!
//! Per-index replication lifecycle for Replix.
//!
//! This crate provides:
//! - The replication manager state machine (initializing → initial sync → steady state)
//! - Startup recovery from commit metadata
//! - Failure classification for the full-copy and change-tail engines
//! - Backoff policy with full jitter for rate-limited sources
//! - Teardown paths (drop, close, clear, stale, exceeded)
//! - In-memory collaborators for tests
//!
//! ## Architecture
//!
//! A manager owns one index generation. It runs a **copy-then-tail** model:
//! 1. Copy the source collection into an empty index
//! 2. Commit the change-stream position the copy ended at
//! 3. Tail the change stream from that position
//!
//! Engines report failures by category; the manager decides whether to
//! retry, resync, freeze or tear down the index.
//!
//! ## Key Invariants
//!
//! - At most one engine works on an index at a time
//! - A terminal state never schedules more work
//! - Steady is published only after the reader sees the copied data
//! - Status changes before cursors die, cursors die before data goes away
//! - A format mismatch on disk is fatal, never silently resynced

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod backoff;
mod capabilities;
mod collaborators;
mod completion;
mod config;
mod error;
mod failure;
mod fatal;
mod generation;
mod manager;
mod metrics;
pub mod mock;
mod recovery;
mod status;

pub use backoff::{full_jitter, BackoffContext, BackoffPolicy};
pub use capabilities::Capabilities;
pub use collaborators::{
    ChangeTailEngine, Collaborators, CursorRegistry, EngineFuture, FullCopyEngine, FullCopyRequest,
    IndexedStore, Indexer, OnStarted, PeriodicCommitter, SynonymSync, TailRequest,
};
pub use config::{FeatureFlags, ReplicationConfig};
pub use error::{ReplicationError, ReplicationResult};
pub use failure::{
    codes, is_collection_id_filter_unsupported, is_ingress_rate_limit,
    is_natural_order_scan_unsupported, is_no_query_execution_plans, is_notablescan,
    is_out_of_memory, is_resume_id_mismatch, is_view_pipeline_related, source_error,
    view_pipeline_error_message, Cause, ChangeTailError, ContextError, EngineFailure,
    ErrorOrigin, FailureCategory, FullCopyError, OutOfMemory, SourceError,
    UnsupportedServerVersion, COLLECTION_ID_FILTER_OPTION,
};
pub use fatal::{AbortOnFatal, FatalHandler};
pub use generation::{GenerationId, IndexDefinition, IndexGeneration, IndexId, ViewDefinition};
pub use manager::{LifecycleState, ReplicationIndexManager};
pub use metrics::{
    CounterKey, ExceptionKey, IndexMetrics, OpTimeGauge, OpTimeGaugeGuard, ReplicationMetrics,
    ReplicationMetricsSnapshot, UNKNOWN_DROP_REASON,
};
pub use recovery::{decide_startup, resolve_action, FormatVersionMismatch, RecoveryAction, StartupDecision};
pub use status::{
    AbsenceReason, FailureReason, IndexStatus, StatusCode, StatusReason, EXCEEDED_LIMIT_PREFIX,
    REPLICATION_FAILED_PREFIX,
};
