//! Interfaces of the components a replication manager drives.
//!
//! Storage-side operations are synchronous and are called while the
//! manager holds its state lock; they must not call back into the manager.
//! Engines register their work synchronously and hand back a future that
//! the manager runs as a task on the lifecycle executor.

use crate::error::ReplicationResult;
use crate::failure::{Cause, ChangeTailError, EngineFailure, FullCopyError};
use crate::generation::{GenerationId, IndexGeneration};
use crate::metrics::IndexMetrics;
use crate::status::IndexStatus;
use async_trait::async_trait;
use replix_commit::{ChangeStreamResumeRecord, EncodedMetadata, FullCopyResumeRecord};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The index a manager replicates into.
pub trait IndexedStore: Send + Sync {
    /// Current status.
    fn status(&self) -> IndexStatus;

    /// Publishes a new status.
    fn set_status(&self, status: IndexStatus);

    /// Makes everything committed so far visible to new readers.
    fn refresh_reader(&self) -> ReplicationResult<()>;

    /// Reads the metadata of the last commit.
    fn read_commit_metadata(&self) -> ReplicationResult<EncodedMetadata>;

    /// Closes the index, keeping its data.
    fn close(&self) -> ReplicationResult<()>;

    /// Deletes the index and its data.
    fn drop_index(&self) -> ReplicationResult<()>;

    /// Metrics handle of this index.
    fn metrics(&self) -> Arc<IndexMetrics>;
}

/// Writes documents and commits into the index.
pub trait Indexer: Send + Sync {
    /// Commits pending writes together with the current metadata.
    fn commit(&self) -> ReplicationResult<()>;

    /// Deletes every document and commits `metadata`.
    fn clear_index(&self, metadata: EncodedMetadata) -> ReplicationResult<()>;

    /// Replaces the metadata written by the next commit.
    fn update_commit_metadata(&self, metadata: EncodedMetadata) -> ReplicationResult<()>;
}

/// Tracks open query cursors.
pub trait CursorRegistry: Send + Sync {
    /// Kills every cursor reading `generation_id`. Returns once they are gone.
    fn kill_index_cursors(&self, generation_id: GenerationId) -> ReplicationResult<()>;
}

/// Keeps a synonym collection in sync for an index.
#[async_trait]
pub trait SynonymSync: Send + Sync {
    /// Stops syncing.
    async fn shutdown(&self);
}

/// Commits the index in the background.
pub trait PeriodicCommitter: Send + Sync {
    /// Stops committing. No commit starts after this returns.
    fn close(&self);
}

/// Hook an engine fires once its work actually starts.
pub struct OnStarted(Box<dyn FnOnce() + Send>);

impl OnStarted {
    /// Wraps `hook`.
    pub fn new(hook: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(hook))
    }

    /// A hook that does nothing.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Runs the hook.
    pub fn fire(self) {
        (self.0)()
    }
}

impl fmt::Debug for OnStarted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OnStarted")
    }
}

/// Everything a full copy needs.
pub struct FullCopyRequest {
    /// Generation being copied into.
    pub generation: IndexGeneration,
    /// Writer for the index.
    pub indexer: Arc<dyn Indexer>,
    /// Fired when the copy leaves the queue and starts.
    pub on_started: OnStarted,
    /// Metrics of the index.
    pub metrics: Arc<IndexMetrics>,
    /// Whether update lookups are scoped to the collection id.
    pub filter_by_collection_id: bool,
    /// Whether to scan in natural storage order.
    pub natural_order_scan: bool,
}

impl fmt::Debug for FullCopyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FullCopyRequest")
            .field("generation_id", &self.generation.generation_id())
            .field("filter_by_collection_id", &self.filter_by_collection_id)
            .field("natural_order_scan", &self.natural_order_scan)
            .finish_non_exhaustive()
    }
}

/// Everything a tailing session needs.
pub struct TailRequest {
    /// Generation being kept current.
    pub generation: IndexGeneration,
    /// Writer for the index.
    pub indexer: Arc<dyn Indexer>,
    /// Metrics of the index.
    pub metrics: Arc<IndexMetrics>,
    /// Where to open the change stream.
    pub resume: ChangeStreamResumeRecord,
    /// Whether update lookups are scoped to the collection id.
    pub filter_by_collection_id: bool,
}

impl fmt::Debug for TailRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailRequest")
            .field("generation_id", &self.generation.generation_id())
            .field("resume", &self.resume)
            .field("filter_by_collection_id", &self.filter_by_collection_id)
            .finish_non_exhaustive()
    }
}

/// Work an engine has accepted and will drive to completion.
pub type EngineFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Copies the source collection into an empty index.
///
/// `run` and `resume` are called under the manager's state lock. They must
/// register the copy before returning, so that a `cancel` issued right after
/// finds it, and must leave all waiting (including firing `on_started`) to
/// the returned future.
#[async_trait]
pub trait FullCopyEngine: Send + Sync {
    /// Queues a copy from scratch. Yields the change-stream position to tail from.
    fn run(
        &self,
        request: FullCopyRequest,
    ) -> EngineFuture<Result<ChangeStreamResumeRecord, EngineFailure<FullCopyError>>>;

    /// Queues the continuation of an interrupted copy from `resume`.
    fn resume(
        &self,
        request: FullCopyRequest,
        resume: FullCopyResumeRecord,
    ) -> EngineFuture<Result<ChangeStreamResumeRecord, EngineFailure<FullCopyError>>>;

    /// Cancels the copy of `generation_id`, if queued or running.
    async fn cancel(&self, generation_id: GenerationId);
}

/// Applies the source's change stream to the index.
///
/// `start` is called under the manager's state lock and must register the
/// session before returning, so that a `stop` issued right after finds it.
#[async_trait]
pub trait ChangeTailEngine: Send + Sync {
    /// Opens a session. The future tails until something goes wrong and
    /// never resolves successfully.
    fn start(&self, request: TailRequest) -> EngineFuture<EngineFailure<ChangeTailError>>;

    /// Stops tailing `generation_id` and yields where it stopped.
    async fn stop(&self, generation_id: GenerationId) -> Result<ChangeStreamResumeRecord, Cause>;
}

/// The set of collaborators a manager is built with.
#[derive(Clone)]
pub struct Collaborators {
    /// The index.
    pub store: Arc<dyn IndexedStore>,
    /// Writer for the index.
    pub indexer: Arc<dyn Indexer>,
    /// Full-copy engine.
    pub full_copy: Arc<dyn FullCopyEngine>,
    /// Change-tail engine.
    pub change_tail: Arc<dyn ChangeTailEngine>,
    /// Cursor registry.
    pub cursors: Arc<dyn CursorRegistry>,
    /// Synonym syncs of this index.
    pub synonyms: Vec<Arc<dyn SynonymSync>>,
    /// Background committer.
    pub committer: Arc<dyn PeriodicCommitter>,
}
