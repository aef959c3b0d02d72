//! In-memory collaborators for testing.
//!
//! Every collaborator appends to a shared [`EventLog`], so tests can assert
//! on the order of side effects. The engines are scripted: each call shows up
//! as an invocation that the test completes by hand.

use crate::collaborators::{
    ChangeTailEngine, Collaborators, CursorRegistry, EngineFuture, FullCopyEngine, FullCopyRequest,
    IndexedStore, Indexer, OnStarted, PeriodicCommitter, SynonymSync, TailRequest,
};
use crate::error::{ReplicationError, ReplicationResult};
use crate::failure::{Cause, ChangeTailError, EngineFailure, FullCopyError};
use crate::fatal::FatalHandler;
use crate::generation::GenerationId;
use crate::metrics::IndexMetrics;
use crate::status::{IndexStatus, StatusCode};
use async_trait::async_trait;
use parking_lot::Mutex;
use replix_commit::{
    ChangeStreamResumeRecord, CommitDataResult, CommitMetadata, EncodedMetadata,
    FullCopyResumeRecord,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// A side effect observed by the in-memory collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A status was published.
    SetStatus(StatusCode),
    /// The reader was refreshed.
    RefreshReader,
    /// Cursors were killed.
    KillCursors,
    /// The index was closed.
    Close,
    /// The index was dropped.
    Drop,
    /// Pending writes were committed.
    Commit,
    /// The index was cleared.
    ClearIndex,
    /// The next commit's metadata was replaced.
    UpdateCommitMetadata,
    /// The periodic committer was closed.
    CommitterClosed,
    /// A synonym sync was shut down.
    SynonymShutdown,
    /// A full copy started from scratch.
    FullCopyRun {
        /// Whether update lookups were scoped to the collection id.
        filter_by_collection_id: bool,
        /// Whether the scan ran in natural order.
        natural_order_scan: bool,
    },
    /// A full copy resumed.
    FullCopyResume,
    /// A full copy was cancelled.
    FullCopyCancel,
    /// Tailing started.
    TailStart {
        /// Whether update lookups were scoped to the collection id.
        filter_by_collection_id: bool,
    },
    /// Tailing was stopped.
    TailStop,
}

/// Shared, ordered record of [`Event`]s.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `event`.
    pub fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    /// Copy of every event so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Number of events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(*e)).count()
    }

    /// Position of the first event matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events.lock().iter().position(predicate)
    }

    /// Position of the last event matching `predicate`.
    pub fn last_position(&self, predicate: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events.lock().iter().rposition(predicate)
    }

    /// Forgets every event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// An in-memory index: both the [`IndexedStore`] and its [`Indexer`].
#[derive(Debug)]
pub struct MemoryIndex {
    log: EventLog,
    status: Mutex<IndexStatus>,
    history: Mutex<Vec<IndexStatus>>,
    pending: Mutex<EncodedMetadata>,
    committed: Mutex<EncodedMetadata>,
    metrics: Arc<IndexMetrics>,
    fail_reads: AtomicBool,
}

impl MemoryIndex {
    /// Creates an index that was never committed.
    pub fn new(log: EventLog) -> Self {
        Self::with_committed(log, EncodedMetadata::default())
    }

    /// Creates an index whose last commit carried `metadata`.
    pub fn with_committed(log: EventLog, metadata: EncodedMetadata) -> Self {
        Self {
            log,
            status: Mutex::new(IndexStatus::unknown()),
            history: Mutex::new(Vec::new()),
            pending: Mutex::new(metadata.clone()),
            committed: Mutex::new(metadata),
            metrics: Arc::new(IndexMetrics::new()),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Makes metadata reads fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Every status published, oldest first.
    pub fn status_history(&self) -> Vec<IndexStatus> {
        self.history.lock().clone()
    }

    /// Decodes the metadata of the last commit.
    pub fn committed_metadata(&self) -> CommitDataResult<CommitMetadata> {
        CommitMetadata::decode(&self.committed.lock())
    }

    /// Replaces the committed metadata, as a commit by an engine would.
    pub fn commit_metadata(&self, metadata: EncodedMetadata) {
        *self.pending.lock() = metadata.clone();
        *self.committed.lock() = metadata;
    }
}

impl IndexedStore for MemoryIndex {
    fn status(&self) -> IndexStatus {
        self.status.lock().clone()
    }

    fn set_status(&self, status: IndexStatus) {
        self.log.push(Event::SetStatus(status.code()));
        self.history.lock().push(status.clone());
        *self.status.lock() = status;
    }

    fn refresh_reader(&self) -> ReplicationResult<()> {
        self.log.push(Event::RefreshReader);
        Ok(())
    }

    fn read_commit_metadata(&self) -> ReplicationResult<EncodedMetadata> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ReplicationError::store("read_commit_metadata", "injected failure"));
        }
        Ok(self.committed.lock().clone())
    }

    fn close(&self) -> ReplicationResult<()> {
        self.log.push(Event::Close);
        self.metrics.replication_op_time().unset();
        Ok(())
    }

    fn drop_index(&self) -> ReplicationResult<()> {
        self.log.push(Event::Drop);
        Ok(())
    }

    fn metrics(&self) -> Arc<IndexMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl Indexer for MemoryIndex {
    fn commit(&self) -> ReplicationResult<()> {
        self.log.push(Event::Commit);
        *self.committed.lock() = self.pending.lock().clone();
        Ok(())
    }

    fn clear_index(&self, metadata: EncodedMetadata) -> ReplicationResult<()> {
        self.log.push(Event::ClearIndex);
        self.commit_metadata(metadata);
        Ok(())
    }

    fn update_commit_metadata(&self, metadata: EncodedMetadata) -> ReplicationResult<()> {
        self.log.push(Event::UpdateCommitMetadata);
        *self.pending.lock() = metadata;
        Ok(())
    }
}

/// Cursor registry that only records kills.
#[derive(Debug, Default)]
pub struct MemoryCursorRegistry {
    log: EventLog,
}

impl MemoryCursorRegistry {
    /// Creates a registry logging to `log`.
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl CursorRegistry for MemoryCursorRegistry {
    fn kill_index_cursors(&self, _generation_id: GenerationId) -> ReplicationResult<()> {
        self.log.push(Event::KillCursors);
        Ok(())
    }
}

/// Synonym sync that counts shutdowns.
#[derive(Debug, Default)]
pub struct MemorySynonymSync {
    log: EventLog,
    shutdowns: AtomicUsize,
}

impl MemorySynonymSync {
    /// Creates a sync logging to `log`.
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// Number of shutdowns.
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynonymSync for MemorySynonymSync {
    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.log.push(Event::SynonymShutdown);
    }
}

/// Periodic committer that records when it is closed.
#[derive(Debug, Default)]
pub struct MemoryCommitter {
    log: EventLog,
}

impl MemoryCommitter {
    /// Creates a committer logging to `log`.
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl PeriodicCommitter for MemoryCommitter {
    fn close(&self) {
        self.log.push(Event::CommitterClosed);
    }
}

/// Tracks how many engine invocations run at once.
#[derive(Debug, Clone, Default)]
pub struct ActiveTracker {
    counts: Arc<(AtomicUsize, AtomicUsize)>,
}

/// Marks one running invocation until dropped.
#[derive(Debug)]
pub struct ActiveGuard {
    counts: Arc<(AtomicUsize, AtomicUsize)>,
}

impl ActiveTracker {
    /// Creates a tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an invocation as running.
    pub fn enter(&self) -> ActiveGuard {
        let current = self.counts.0.fetch_add(1, Ordering::SeqCst) + 1;
        self.counts.1.fetch_max(current, Ordering::SeqCst);
        ActiveGuard {
            counts: Arc::clone(&self.counts),
        }
    }

    /// Invocations running now.
    pub fn current(&self) -> usize {
        self.counts.0.load(Ordering::SeqCst)
    }

    /// Most invocations ever running at once.
    pub fn max(&self) -> usize {
        self.counts.1.load(Ordering::SeqCst)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counts.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Which full-copy entry point was called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FullCopyKind {
    /// [`FullCopyEngine::run`].
    Run,
    /// [`FullCopyEngine::resume`].
    Resume(FullCopyResumeRecord),
}

type FullCopyOutcome = Result<ChangeStreamResumeRecord, EngineFailure<FullCopyError>>;

/// A pending full-copy call, completed by the test.
#[derive(Debug)]
pub struct FullCopyInvocation {
    /// Entry point.
    pub kind: FullCopyKind,
    /// Whether update lookups are scoped to the collection id.
    pub filter_by_collection_id: bool,
    /// Whether to scan in natural order.
    pub natural_order_scan: bool,
    on_started: Option<OnStarted>,
    responder: oneshot::Sender<FullCopyOutcome>,
}

impl FullCopyInvocation {
    /// Fires the started hook, as a copy leaving the queue would.
    pub fn start(&mut self) {
        if let Some(hook) = self.on_started.take() {
            hook.fire();
        }
    }

    /// Finishes the copy at `record`.
    pub fn succeed(self, record: ChangeStreamResumeRecord) {
        let _ = self.responder.send(Ok(record));
    }

    /// Fails the copy.
    pub fn fail(self, failure: impl Into<EngineFailure<FullCopyError>>) {
        let _ = self.responder.send(Err(failure.into()));
    }
}

/// Full-copy engine driven by the test.
///
/// A call blocks until the test completes its [`FullCopyInvocation`] or the
/// copy is cancelled, in which case it fails with `ShutDown`.
#[derive(Debug)]
pub struct ScriptedFullCopy {
    log: EventLog,
    active: ActiveTracker,
    tx: mpsc::UnboundedSender<FullCopyInvocation>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FullCopyInvocation>>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
    cancels: AtomicUsize,
}

impl ScriptedFullCopy {
    /// Creates an engine logging to `log`.
    pub fn new(log: EventLog, active: ActiveTracker) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            log,
            active,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            cancel: Mutex::new(None),
            cancels: AtomicUsize::new(0),
        }
    }

    /// Waits for the next call.
    pub async fn next_invocation(&self) -> Option<FullCopyInvocation> {
        self.rx.lock().await.recv().await
    }

    /// Returns a call that already arrived, if any.
    pub fn try_next_invocation(&self) -> Option<FullCopyInvocation> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Number of cancels received.
    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn invoke(&self, request: FullCopyRequest, kind: FullCopyKind) -> EngineFuture<FullCopyOutcome> {
        let active = self.active.enter();
        let (responder, outcome) = oneshot::channel();
        let (cancel_tx, cancelled) = oneshot::channel();
        *self.cancel.lock() = Some(cancel_tx);

        let invocation = FullCopyInvocation {
            kind,
            filter_by_collection_id: request.filter_by_collection_id,
            natural_order_scan: request.natural_order_scan,
            on_started: Some(request.on_started),
            responder,
        };
        let sent = self.tx.send(invocation).is_ok();

        Box::pin(async move {
            let _active = active;
            if !sent {
                return Err(FullCopyError::ShutDown.into());
            }
            tokio::select! {
                result = outcome => result.unwrap_or(Err(FullCopyError::ShutDown.into())),
                _ = cancelled => Err(FullCopyError::ShutDown.into()),
            }
        })
    }
}

#[async_trait]
impl FullCopyEngine for ScriptedFullCopy {
    fn run(&self, request: FullCopyRequest) -> EngineFuture<FullCopyOutcome> {
        self.log.push(Event::FullCopyRun {
            filter_by_collection_id: request.filter_by_collection_id,
            natural_order_scan: request.natural_order_scan,
        });
        self.invoke(request, FullCopyKind::Run)
    }

    fn resume(
        &self,
        request: FullCopyRequest,
        resume: FullCopyResumeRecord,
    ) -> EngineFuture<FullCopyOutcome> {
        self.log.push(Event::FullCopyResume);
        self.invoke(request, FullCopyKind::Resume(resume))
    }

    async fn cancel(&self, _generation_id: GenerationId) {
        self.log.push(Event::FullCopyCancel);
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if let Some(cancel) = self.cancel.lock().take() {
            let _ = cancel.send(());
        }
    }
}

/// A pending tailing session, failed by the test.
#[derive(Debug)]
pub struct TailInvocation {
    /// Where the change stream was opened.
    pub resume: ChangeStreamResumeRecord,
    /// Whether update lookups are scoped to the collection id.
    pub filter_by_collection_id: bool,
    responder: oneshot::Sender<EngineFailure<ChangeTailError>>,
}

impl TailInvocation {
    /// Ends the session with `failure`.
    pub fn fail(self, failure: impl Into<EngineFailure<ChangeTailError>>) {
        let _ = self.responder.send(failure.into());
    }
}

/// Returned by [`ScriptedChangeTail::stop`] when tailing never started.
#[derive(Debug, Error)]
#[error("change tail was never started")]
pub struct NeverStarted;

/// Change-tail engine driven by the test.
#[derive(Debug)]
pub struct ScriptedChangeTail {
    log: EventLog,
    active: ActiveTracker,
    tx: mpsc::UnboundedSender<TailInvocation>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TailInvocation>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    last_resume: Mutex<Option<ChangeStreamResumeRecord>>,
    next_stop: Mutex<Option<Result<ChangeStreamResumeRecord, Cause>>>,
    stops: AtomicUsize,
}

impl ScriptedChangeTail {
    /// Creates an engine logging to `log`.
    pub fn new(log: EventLog, active: ActiveTracker) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            log,
            active,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            stop: Mutex::new(None),
            last_resume: Mutex::new(None),
            next_stop: Mutex::new(None),
            stops: AtomicUsize::new(0),
        }
    }

    /// Waits for the next session.
    pub async fn next_invocation(&self) -> Option<TailInvocation> {
        self.rx.lock().await.recv().await
    }

    /// Returns a session that already started, if any.
    pub fn try_next_invocation(&self) -> Option<TailInvocation> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Makes the next stop yield `result` instead of the last resume point.
    pub fn set_next_stop(&self, result: Result<ChangeStreamResumeRecord, Cause>) {
        *self.next_stop.lock() = Some(result);
    }

    /// Number of stops received.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeTailEngine for ScriptedChangeTail {
    fn start(&self, request: TailRequest) -> EngineFuture<EngineFailure<ChangeTailError>> {
        self.log.push(Event::TailStart {
            filter_by_collection_id: request.filter_by_collection_id,
        });
        let active = self.active.enter();
        *self.last_resume.lock() = Some(request.resume.clone());

        let (responder, failure) = oneshot::channel();
        let (stop_tx, stopped) = oneshot::channel();
        *self.stop.lock() = Some(stop_tx);

        let invocation = TailInvocation {
            resume: request.resume,
            filter_by_collection_id: request.filter_by_collection_id,
            responder,
        };
        let sent = self.tx.send(invocation).is_ok();

        Box::pin(async move {
            let _active = active;
            if !sent {
                return ChangeTailError::ShutDown.into();
            }
            tokio::select! {
                result = failure => result.unwrap_or(EngineFailure::Classified(ChangeTailError::ShutDown)),
                _ = stopped => ChangeTailError::ShutDown.into(),
            }
        })
    }

    async fn stop(&self, _generation_id: GenerationId) -> Result<ChangeStreamResumeRecord, Cause> {
        self.log.push(Event::TailStop);
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }

        if let Some(result) = self.next_stop.lock().take() {
            return result;
        }
        self.last_resume
            .lock()
            .clone()
            .ok_or_else(|| Arc::new(NeverStarted) as Cause)
    }
}

/// Fatal handler that records instead of aborting.
#[derive(Debug, Default)]
pub struct RecordingFatalHook {
    crashes: Mutex<Vec<String>>,
}

impl RecordingFatalHook {
    /// Creates a hook with no recorded crashes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reasons of every crash, oldest first.
    pub fn crashes(&self) -> Vec<String> {
        self.crashes.lock().clone()
    }

    /// Number of crashes.
    pub fn count(&self) -> usize {
        self.crashes.lock().len()
    }
}

impl FatalHandler for RecordingFatalHook {
    fn crash(&self, reason: &str, cause: Option<&Cause>) {
        let entry = match cause {
            Some(cause) => format!("{reason}: {cause}"),
            None => reason.to_string(),
        };
        self.crashes.lock().push(entry);
    }
}

/// A full set of in-memory collaborators sharing one [`EventLog`].
#[derive(Debug, Clone)]
pub struct MemoryCollaborators {
    /// Shared event log.
    pub log: EventLog,
    /// Index and indexer.
    pub index: Arc<MemoryIndex>,
    /// Cursor registry.
    pub cursors: Arc<MemoryCursorRegistry>,
    /// Synonym syncs.
    pub synonyms: Vec<Arc<MemorySynonymSync>>,
    /// Periodic committer.
    pub committer: Arc<MemoryCommitter>,
    /// Full-copy engine.
    pub full_copy: Arc<ScriptedFullCopy>,
    /// Change-tail engine.
    pub change_tail: Arc<ScriptedChangeTail>,
    /// Concurrent engine invocations, across both engines.
    pub active: ActiveTracker,
}

impl MemoryCollaborators {
    /// Creates collaborators over an index committed with `metadata`.
    pub fn new(metadata: EncodedMetadata, synonyms: usize) -> Self {
        let log = EventLog::new();
        let active = ActiveTracker::new();
        Self {
            index: Arc::new(MemoryIndex::with_committed(log.clone(), metadata)),
            cursors: Arc::new(MemoryCursorRegistry::new(log.clone())),
            synonyms: (0..synonyms)
                .map(|_| Arc::new(MemorySynonymSync::new(log.clone())))
                .collect(),
            committer: Arc::new(MemoryCommitter::new(log.clone())),
            full_copy: Arc::new(ScriptedFullCopy::new(log.clone(), active.clone())),
            change_tail: Arc::new(ScriptedChangeTail::new(log.clone(), active.clone())),
            active,
            log,
        }
    }

    /// The trait-object view a manager is built with.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.index.clone(),
            indexer: self.index.clone(),
            full_copy: self.full_copy.clone(),
            change_tail: self.change_tail.clone(),
            cursors: self.cursors.clone(),
            synonyms: self
                .synonyms
                .iter()
                .map(|s| Arc::clone(s) as Arc<dyn SynonymSync>)
                .collect(),
            committer: self.committer.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{IndexDefinition, IndexGeneration, IndexId};
    use replix_commit::IndexFormatVersion;

    #[test]
    fn event_log_positions() {
        let log = EventLog::new();
        log.push(Event::KillCursors);
        log.push(Event::Close);
        log.push(Event::KillCursors);

        assert_eq!(log.position(|e| *e == Event::KillCursors), Some(0));
        assert_eq!(log.last_position(|e| *e == Event::KillCursors), Some(2));
        assert_eq!(log.count(|e| *e == Event::Close), 1);
    }

    #[test]
    fn commit_publishes_pending_metadata() {
        let index = MemoryIndex::new(EventLog::new());
        let encoded = CommitMetadata::exceeded("limit").encode().unwrap();
        index.update_commit_metadata(encoded).unwrap();
        assert!(index.committed_metadata().unwrap().is_empty());

        index.commit().unwrap();
        assert_eq!(
            index.committed_metadata().unwrap().exceeded_limit_reason(),
            Some("limit")
        );
    }

    #[test]
    fn tracker_records_peak() {
        let tracker = ActiveTracker::new();
        let first = tracker.enter();
        let second = tracker.enter();
        drop(first);
        drop(second);
        let _third = tracker.enter();
        assert_eq!(tracker.current(), 1);
        assert_eq!(tracker.max(), 2);
    }

    fn request(index: &Arc<MemoryIndex>) -> FullCopyRequest {
        let definition = IndexDefinition::new(
            IndexId::new_random(),
            "default",
            "shop",
            "orders",
            uuid::Uuid::new_v4(),
        );
        FullCopyRequest {
            generation: IndexGeneration::new(definition, 0, IndexFormatVersion::CURRENT),
            indexer: index.clone(),
            on_started: OnStarted::noop(),
            metrics: index.metrics(),
            filter_by_collection_id: true,
            natural_order_scan: false,
        }
    }

    #[tokio::test]
    async fn cancel_ends_a_pending_copy() {
        let log = EventLog::new();
        let active = ActiveTracker::new();
        let index = Arc::new(MemoryIndex::new(log.clone()));
        let engine = ScriptedFullCopy::new(log.clone(), active.clone());

        let running = tokio::spawn(engine.run(request(&index)));
        let invocation = engine.next_invocation().await.unwrap();
        assert_eq!(invocation.kind, FullCopyKind::Run);
        assert!(invocation.filter_by_collection_id);
        assert_eq!(active.current(), 1);

        engine
            .cancel(GenerationId::new(IndexId::new_random(), 0))
            .await;
        let failure = running.await.unwrap().unwrap_err();
        assert!(failure.is_shut_down());
        assert_eq!(engine.cancels(), 1);
        assert_eq!(active.current(), 0);
        assert_eq!(
            log.events(),
            vec![
                Event::FullCopyRun {
                    filter_by_collection_id: true,
                    natural_order_scan: false,
                },
                Event::FullCopyCancel,
            ]
        );
    }

    #[tokio::test]
    async fn copy_is_cancellable_before_it_is_polled() {
        let index = Arc::new(MemoryIndex::new(EventLog::new()));
        let active = ActiveTracker::new();
        let engine = ScriptedFullCopy::new(EventLog::new(), active.clone());

        let pending = engine.run(request(&index));
        assert_eq!(active.current(), 1);
        engine
            .cancel(GenerationId::new(IndexId::new_random(), 0))
            .await;

        assert!(pending.await.unwrap_err().is_shut_down());
        assert_eq!(active.current(), 0);
    }

    #[tokio::test]
    async fn session_is_stoppable_before_it_is_polled() {
        let index = Arc::new(MemoryIndex::new(EventLog::new()));
        let active = ActiveTracker::new();
        let engine = ScriptedChangeTail::new(EventLog::new(), active.clone());
        let resume = ChangeStreamResumeRecord::new(
            replix_commit::Namespace::new("shop", "orders"),
            replix_commit::ResumeToken::from_op_time(replix_commit::OpTime::new(7, 1)),
        );
        let copy_request = request(&index);
        let tail_request = TailRequest {
            generation: copy_request.generation,
            indexer: copy_request.indexer,
            metrics: copy_request.metrics,
            resume: resume.clone(),
            filter_by_collection_id: true,
        };

        let pending = engine.start(tail_request);
        let stopped = engine
            .stop(GenerationId::new(IndexId::new_random(), 0))
            .await
            .unwrap();

        assert_eq!(stopped, resume);
        assert!(pending.await.is_shut_down());
        assert_eq!(active.current(), 0);
    }

    #[tokio::test]
    async fn stop_yields_last_resume_point() {
        let engine = ScriptedChangeTail::new(EventLog::new(), ActiveTracker::new());
        let err = engine
            .stop(GenerationId::new(IndexId::new_random(), 0))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "change tail was never started");
        assert_eq!(engine.stops(), 1);
    }
}
