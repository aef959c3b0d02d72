//! Replication lifecycle manager for one index generation.
//!
//! The manager owns a small state machine:
//!
//! ```text
//! Initializing -> InitialSync <-> InitialSyncBackoff
//!                     |
//!                     v
//!               SteadyState <-> SteadyStateShuttingDown
//!                     |
//!                     v
//!          ShutDown | Failed | FailedExceeded
//! ```
//!
//! Every transition happens under one lock. Engines and backoff timers run
//! as tasks on the lifecycle runtime and report back by taking the lock
//! again. Each dispatch bumps an epoch; a completion whose epoch is no
//! longer current, or that arrives after a terminal state, is ignored.

use crate::backoff::{BackoffContext, BackoffPolicy};
use crate::capabilities::Capabilities;
use crate::collaborators::{
    ChangeTailEngine, Collaborators, CursorRegistry, FullCopyEngine, FullCopyRequest,
    IndexedStore, Indexer, OnStarted, PeriodicCommitter, SynonymSync, TailRequest,
};
use crate::completion::{completion, Completion};
use crate::config::{FeatureFlags, ReplicationConfig};
use crate::error::{ReplicationError, ReplicationResult};
use crate::failure::{
    is_collection_id_filter_unsupported, is_no_query_execution_plans,
    is_natural_order_scan_unsupported, is_notablescan, is_out_of_memory, is_resume_id_mismatch,
    is_view_pipeline_related, view_pipeline_error_message, Cause, ChangeTailError,
    EngineFailure, FullCopyError,
};
use crate::fatal::FatalHandler;
use crate::generation::IndexGeneration;
use crate::metrics::{ReplicationMetrics, ReplicationMetricsSnapshot, UNKNOWN_DROP_REASON};
use crate::recovery::{decide_startup, RecoveryAction, StartupDecision};
use crate::status::{
    AbsenceReason, FailureReason, IndexStatus, StatusCode, EXCEEDED_LIMIT_PREFIX,
    REPLICATION_FAILED_PREFIX,
};
use parking_lot::Mutex;
use replix_commit::{
    ChangeStreamResumeRecord, CommitMetadata, FullCopyResumeRecord, IndexStateInfo, OpTime,
    StaleReason, StaleStateInfo,
};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument, Span};

/// Lifecycle state of a replication manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Waiting for `init` to decide how to start.
    Initializing,
    /// A full copy is queued or running.
    InitialSync,
    /// Waiting to retry a full copy.
    InitialSyncBackoff,
    /// Tailing the change stream.
    SteadyState,
    /// Tailing failed and is being stopped.
    SteadyStateShuttingDown,
    /// Replication stopped; the index may still serve queries.
    ShutDown,
    /// Replication failed.
    Failed,
    /// The source exceeded a configured limit.
    FailedExceeded,
}

impl LifecycleState {
    /// Returns the upper-case name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Initializing => "INITIALIZING",
            LifecycleState::InitialSync => "INITIAL_SYNC",
            LifecycleState::InitialSyncBackoff => "INITIAL_SYNC_BACKOFF",
            LifecycleState::SteadyState => "STEADY_STATE",
            LifecycleState::SteadyStateShuttingDown => "STEADY_STATE_SHUT_DOWN",
            LifecycleState::ShutDown => "SHUT_DOWN",
            LifecycleState::Failed => "FAILED",
            LifecycleState::FailedExceeded => "FAILED_EXCEEDED",
        }
    }

    /// Returns true if no further work may be scheduled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::ShutDown | LifecycleState::Failed | LifecycleState::FailedExceeded
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type ShutdownFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct ManagerState {
    lifecycle: LifecycleState,
    capabilities: Capabilities,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
    engine: Option<JoinHandle<()>>,
    init_done: Completion,
    tail_stop: Option<Completion>,
}

impl ManagerState {
    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    fn is_current(&self, epoch: u64) -> bool {
        !self.lifecycle.is_terminal() && self.epoch == epoch
    }
}

struct Inner {
    generation: IndexGeneration,
    store: Arc<dyn IndexedStore>,
    indexer: Arc<dyn Indexer>,
    full_copy: Arc<dyn FullCopyEngine>,
    change_tail: Arc<dyn ChangeTailEngine>,
    cursors: Arc<dyn CursorRegistry>,
    synonyms: Vec<Arc<dyn SynonymSync>>,
    committer: Arc<dyn PeriodicCommitter>,
    flags: FeatureFlags,
    backoff: BackoffPolicy,
    fatal: Arc<dyn FatalHandler>,
    metrics: ReplicationMetrics,
    runtime: Handle,
    span: Span,
    state: Mutex<ManagerState>,
}

/// Drives replication of one index generation.
///
/// Created once per generation. Initialization starts immediately on the
/// lifecycle runtime; [`ReplicationIndexManager::init_future`] resolves when
/// it has finished. The index must not be touched by its owner until
/// [`ReplicationIndexManager::shutdown`] resolves.
#[derive(Clone)]
pub struct ReplicationIndexManager {
    inner: Arc<Inner>,
}

impl ReplicationIndexManager {
    /// Creates a manager and schedules its initialization on `runtime`.
    pub fn create(
        generation: IndexGeneration,
        collaborators: Collaborators,
        config: &ReplicationConfig,
        flags: FeatureFlags,
        fatal: Arc<dyn FatalHandler>,
        runtime: Handle,
    ) -> Self {
        let generation_id = generation.generation_id();
        let span = info_span!(
            "replication_index_manager",
            index_id = %generation_id.index_id,
            generation_id = %generation_id,
        );
        let (init_tx, init_done) = completion();

        let inner = Arc::new(Inner {
            generation,
            store: collaborators.store,
            indexer: collaborators.indexer,
            full_copy: collaborators.full_copy,
            change_tail: collaborators.change_tail,
            cursors: collaborators.cursors,
            synonyms: collaborators.synonyms,
            committer: collaborators.committer,
            flags,
            backoff: BackoffPolicy::from_config(config),
            fatal,
            metrics: ReplicationMetrics::new(),
            runtime,
            span,
            state: Mutex::new(ManagerState {
                lifecycle: LifecycleState::Initializing,
                capabilities: Capabilities::from_config(config),
                epoch: 0,
                timer: None,
                engine: None,
                init_done,
                tail_stop: None,
            }),
        });

        let task = Arc::clone(&inner);
        inner.spawn(async move {
            task.run_init();
            init_tx.complete();
        });

        Self { inner }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.inner.state.lock().lifecycle
    }

    /// Capabilities the next engine invocation will use.
    pub fn capabilities(&self) -> Capabilities {
        self.inner.state.lock().capabilities
    }

    /// Returns true while a backoff timer is pending.
    pub fn has_pending_backoff(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }

    /// The generation this manager replicates.
    pub fn generation(&self) -> &IndexGeneration {
        &self.inner.generation
    }

    /// Snapshot of this manager's counters.
    pub fn metrics(&self) -> ReplicationMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Resolves once initialization has finished, successfully or not.
    pub fn init_future(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.state.lock().init_done.clone().wait()
    }

    /// Stops replication.
    ///
    /// The state becomes `ShutDown` before this returns, so no completion
    /// schedules new work afterwards. The returned future resolves once the
    /// active engine or pending initialization has stopped and every synonym
    /// sync has shut down. Calling this again is harmless and never cancels
    /// an engine twice.
    pub fn shutdown(&self) -> impl Future<Output = ()> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let cancel = {
            let _entered = inner.span.enter();
            let mut st = inner.state.lock();
            inner.begin_shutdown(&mut st)
        };
        let synonyms = inner.synonyms.clone();
        let span = inner.span.clone();

        async move {
            cancel.await;
            for synonym in synonyms {
                synonym.shutdown().await;
            }
        }
        .instrument(span)
    }

    /// Stops replication, then drops the index and its data.
    pub fn drop_index(&self) -> impl Future<Output = ()> + Send + 'static {
        let shutdown = self.shutdown();
        let inner = Arc::clone(&self.inner);
        let span = inner.span.clone();

        async move {
            shutdown.await;
            inner.drop_after_shutdown();
        }
        .instrument(span)
    }
}

impl fmt::Debug for ReplicationIndexManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationIndexManager")
            .field("generation_id", &self.inner.generation.generation_id())
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future.instrument(self.span.clone()))
    }

    fn transition(&self, st: &mut ManagerState, to: LifecycleState) {
        let from = st.lifecycle;
        if from == to {
            return;
        }

        if from == LifecycleState::InitialSync
            && matches!(to, LifecycleState::SteadyState | LifecycleState::ShutDown)
        {
            self.store.metrics().reset_full_copy_resyncs();
        }

        self.metrics.record_transition(from.name(), to.name());
        info!(%from, %to, "transitioning");
        st.lifecycle = to;
    }

    fn crash(&self, reason: &str, cause: Option<&Cause>) -> ReplicationError {
        self.fatal.crash(reason, cause);
        ReplicationError::Fatal {
            reason: reason.to_string(),
        }
    }

    /// Treats a failure of `result` as fatal.
    fn must<T>(&self, result: ReplicationResult<T>, reason: &str) -> ReplicationResult<T> {
        result.map_err(|e| {
            if e.is_fatal() {
                return e;
            }
            let cause: Cause = Arc::new(e);
            self.crash(reason, Some(&cause))
        })
    }

    /// Ends a handler; anything it could not handle is fatal.
    fn finish(&self, result: ReplicationResult<()>, context: &str) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {}
            Err(e) => {
                let cause: Cause = Arc::new(e);
                self.fatal.crash(context, Some(&cause));
            }
        }
    }

    fn crash_on_out_of_memory(&self, cause: &Cause) -> ReplicationResult<()> {
        if is_out_of_memory(cause) {
            return Err(self.crash("out of memory during replication", Some(cause)));
        }
        Ok(())
    }

    fn read_commit_metadata(&self) -> ReplicationResult<CommitMetadata> {
        let encoded = self.store.read_commit_metadata()?;
        Ok(CommitMetadata::decode(&encoded)?)
    }

    // ---- initialization -------------------------------------------------

    fn run_init(self: &Arc<Self>) {
        let mut st = self.state.lock();
        let error = match self.init(&mut st) {
            Ok(()) => return,
            Err(e) if e.is_fatal() => return,
            Err(e) => e,
        };

        let message = error.to_string();
        let result = if self.flags.retain_failed_index_data {
            self.fail_and_close(&mut st, &message, FailureReason::InitializationFailed)
        } else {
            self.fail_and_drop(&mut st, &message, FailureReason::InitializationFailed)
        };
        self.finish(result, "failed to fail index after initialization error");
    }

    fn init(self: &Arc<Self>, st: &mut ManagerState) -> ReplicationResult<()> {
        if st.lifecycle.is_terminal() {
            return Ok(());
        }
        if st.lifecycle != LifecycleState::Initializing {
            return Err(ReplicationError::invalid_state("init", st.lifecycle));
        }

        let declared = self.generation.format_version();
        if !declared.is_supported() {
            return Err(ReplicationError::UnsupportedFormat(declared));
        }

        let metadata = self.read_commit_metadata()?;
        let decision = match decide_startup(
            &metadata,
            declared,
            self.flags.shut_down_when_collection_missing,
        ) {
            Ok(decision) => decision,
            Err(mismatch) => {
                let reason = format!("index {}: {mismatch}", self.generation.generation_id());
                return Err(self.crash(&reason, None));
            }
        };

        info!(decision = decision.name(), "initializing replication");
        match decision {
            StartupDecision::FailExceeded(reason) => self.exceeded(st, &reason),
            StartupDecision::ServeStale(info) => {
                self.serve_stale(st, &info);
                Ok(())
            }
            StartupDecision::CollectionNotFound => self.shut_down_collection_missing(st),
            StartupDecision::Replicate(RecoveryAction::RunFullCopy) => {
                self.enqueue_full_copy(st, IndexStatus::initial_sync())
            }
            StartupDecision::Replicate(RecoveryAction::ResumeFullCopy(record)) => {
                self.enqueue_full_copy_resume(st, record)
            }
            StartupDecision::Replicate(RecoveryAction::ResumeTailing(record)) => {
                self.resume_steady_state(st, record)
            }
        }
    }

    // ---- full copy ------------------------------------------------------

    fn enqueue_full_copy(
        self: &Arc<Self>,
        st: &mut ManagerState,
        status: IndexStatus,
    ) -> ReplicationResult<()> {
        if status.code() != StatusCode::InitialSync {
            return Err(ReplicationError::InvalidStatus(format!(
                "full copy cannot start with status {status}"
            )));
        }
        if st.lifecycle.is_terminal() {
            return Ok(());
        }

        self.transition(st, LifecycleState::InitialSync);
        self.clear_index(IndexStatus::not_started(), CommitMetadata::empty())?;

        info!("enqueueing full copy");
        self.dispatch_full_copy(st, status, None, None);
        Ok(())
    }

    fn enqueue_full_copy_resume(
        self: &Arc<Self>,
        st: &mut ManagerState,
        record: FullCopyResumeRecord,
    ) -> ReplicationResult<()> {
        if st.lifecycle.is_terminal() {
            return Ok(());
        }

        self.kill_cursors(IndexStatus::not_started())?;
        self.transition(st, LifecycleState::InitialSync);

        info!(natural_order = record.is_natural_order(), "enqueueing full copy resume");
        self.dispatch_full_copy(st, IndexStatus::initial_sync(), Some(record), None);
        Ok(())
    }

    fn dispatch_full_copy(
        self: &Arc<Self>,
        st: &mut ManagerState,
        status: IndexStatus,
        resume: Option<FullCopyResumeRecord>,
        filter_by_collection_id: Option<bool>,
    ) {
        let epoch = st.next_epoch();
        let request = FullCopyRequest {
            generation: self.generation.clone(),
            indexer: Arc::clone(&self.indexer),
            on_started: self.on_started(epoch, status),
            metrics: self.store.metrics(),
            filter_by_collection_id: filter_by_collection_id
                .unwrap_or(st.capabilities.filter_by_collection_id()),
            natural_order_scan: st.capabilities.natural_order_scan(),
        };

        // Registered with the engine before the lock is released, so a
        // shutdown that follows always has something to cancel.
        let copy = match resume {
            Some(record) => self.full_copy.resume(request, record),
            None => self.full_copy.run(request),
        };
        let inner = Arc::clone(self);
        st.engine = Some(self.spawn(async move {
            let result = copy.await;
            inner.on_full_copy_complete(epoch, result);
        }));
    }

    /// Publishes `status` when the engine starts, unless the attempt was superseded.
    fn on_started(self: &Arc<Self>, epoch: u64, status: IndexStatus) -> OnStarted {
        let inner = Arc::downgrade(self);
        OnStarted::new(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let st = inner.state.lock();
            if st.is_current(epoch) {
                inner.store.set_status(status);
            }
        })
    }

    fn on_full_copy_complete(
        self: &Arc<Self>,
        epoch: u64,
        result: Result<ChangeStreamResumeRecord, EngineFailure<FullCopyError>>,
    ) {
        let mut st = self.state.lock();
        let outcome = match result {
            Ok(record) if st.is_current(epoch) => self.resume_steady_state(&mut st, record),
            Ok(_) => Ok(()),
            Err(failure) => self.handle_full_copy_failure(&mut st, epoch, failure),
        };
        self.finish(outcome, "failed handling full copy result");
    }

    fn handle_full_copy_failure(
        self: &Arc<Self>,
        st: &mut ManagerState,
        epoch: u64,
        failure: EngineFailure<FullCopyError>,
    ) -> ReplicationResult<()> {
        self.metrics.record_exception(failure.exception_key());

        if !st.is_current(epoch) {
            if !failure.is_shut_down() {
                info!(error = %failure, "full copy failed after shut down, not scheduling more work");
            }
            return Ok(());
        }

        let error = match failure {
            EngineFailure::Unexpected(cause) => {
                self.crash_on_out_of_memory(&cause)?;
                return self.fail_and_drop(st, &cause.to_string(), FailureReason::FullCopyFailed);
            }
            EngineFailure::Classified(error) => error,
        };

        self.store.metrics().record_full_copy_exception();
        match error {
            FullCopyError::Dropped { message } => {
                info!(%message, "source collection dropped, dropping index");
                self.drop_dropped_collection(st)
            }
            FullCopyError::Failed { ref cause } => {
                if is_notablescan(cause) {
                    self.metrics.increment("full_copy_failed_notablescan", Vec::new());
                }
                self.fail_and_drop(st, &error.to_string(), FailureReason::FullCopyFailed)
            }
            FullCopyError::FieldLimitExceeded { reason } => self.exceeded(st, &reason),
            FullCopyError::DocsLimitExceeded { cause } => self.exceeded(st, &cause.to_string()),
            FullCopyError::ShutDown => {
                info!("full copy was shut down, not scheduling more work");
                self.transition(st, LifecycleState::ShutDown);
                Ok(())
            }
            FullCopyError::RequiresResync { message, cause } => {
                self.handle_full_copy_resync(st, &message, cause.as_ref())
            }
            FullCopyError::ResumableTransient { cause } => {
                let wait = self
                    .backoff
                    .duration(BackoffContext::FullCopyResync, Some(&cause));
                if is_collection_id_filter_unsupported(&cause) {
                    self.metrics
                        .increment("collection_id_filter_unsupported", Vec::new());
                    st.capabilities = st.capabilities.without_collection_id_filter();
                }
                self.schedule_resumable_resync(st, &cause, wait);
                Ok(())
            }
            FullCopyError::Invalidated { resume } => {
                let reconciled = st.capabilities.reconciled_with(&resume);
                if reconciled != st.capabilities {
                    st.capabilities = reconciled;
                    self.metrics.increment(
                        "natural_order_scan_retry",
                        vec![
                            ("reason", "incompatible_resume_record".to_string()),
                            ("natural_order_scan", reconciled.natural_order_scan().to_string()),
                        ],
                    );
                }
                self.schedule_full_copy_resume_now(st, resume);
                Ok(())
            }
            FullCopyError::CollectionNotFound { message } => {
                if self.flags.shut_down_when_collection_missing {
                    self.shut_down_collection_missing(st)
                } else {
                    info!(%message, "source collection not found, retrying full copy");
                    self.schedule_collection_retry(st)
                }
            }
        }
    }

    fn handle_full_copy_resync(
        self: &Arc<Self>,
        st: &mut ManagerState,
        message: &str,
        cause: Option<&Cause>,
    ) -> ReplicationResult<()> {
        if cause.is_some_and(is_resume_id_mismatch) {
            self.metrics.increment(
                "natural_order_scan_retry",
                vec![
                    ("reason", "resume_id_mismatch".to_string()),
                    (
                        "natural_order_scan",
                        st.capabilities.natural_order_scan().to_string(),
                    ),
                ],
            );
            return self.schedule_resync(st, message, IndexStatus::initial_sync());
        }

        if cause.is_some_and(is_natural_order_scan_unsupported) {
            st.capabilities = st.capabilities.without_natural_order_scan();
            self.metrics.increment(
                "natural_order_scan_retry",
                vec![
                    ("reason", "server_query_failed".to_string()),
                    ("natural_order_scan", false.to_string()),
                ],
            );
            return self.schedule_resync(st, message, IndexStatus::initial_sync());
        }

        let has_view = self.generation.definition().view().is_some();
        if let Some(cause) = cause.filter(|c| has_view && is_view_pipeline_related(c)) {
            self.metrics
                .increment("view_pipeline_full_copy_retry", Vec::new());
            // Kept through the retry so the message clears only once steady.
            let status = IndexStatus::initial_sync_with_message(view_pipeline_error_message(cause));
            self.store.set_status(status.clone());
            return self.schedule_resync(st, message, status);
        }

        if cause.is_some_and(is_no_query_execution_plans) {
            self.metrics
                .increment("full_copy_retried_no_query_plans", Vec::new());
        }
        self.schedule_resync(st, message, IndexStatus::initial_sync())
    }

    fn schedule_resync(
        self: &Arc<Self>,
        st: &mut ManagerState,
        message: &str,
        status: IndexStatus,
    ) -> ReplicationResult<()> {
        if status.code() != StatusCode::InitialSync {
            return Err(ReplicationError::InvalidStatus(format!(
                "full copy cannot be rescheduled with status {status}"
            )));
        }

        let wait = self.backoff.fixed(BackoffContext::FullCopyResync);
        info!(
            error = %message,
            backoff_secs = wait.as_secs(),
            "full copy must start over, retrying after backoff"
        );
        self.transition(st, LifecycleState::InitialSyncBackoff);
        self.store.metrics().record_full_copy_resync();

        self.schedule(st, wait, "failed enqueueing full copy", move |inner, st| {
            inner.enqueue_full_copy(st, status)
        });
        Ok(())
    }

    fn schedule_resumable_resync(self: &Arc<Self>, st: &mut ManagerState, cause: &Cause, wait: Duration) {
        info!(
            error = %cause,
            backoff_ms = wait.as_millis() as u64,
            "transient full copy error, resuming after backoff"
        );
        self.transition(st, LifecycleState::InitialSyncBackoff);
        self.schedule(st, wait, "failed resuming full copy", |inner, st| {
            inner.resume_full_copy(st)
        });
    }

    /// Resumes from the last committed checkpoint, or starts over without one.
    fn resume_full_copy(self: &Arc<Self>, st: &mut ManagerState) -> ReplicationResult<()> {
        let metadata = self.must(self.read_commit_metadata(), "failed reading commit metadata")?;
        match metadata.full_copy_resume_record() {
            Some(record) => self.enqueue_full_copy_resume(st, record.clone()),
            None => self.enqueue_full_copy(st, IndexStatus::initial_sync()),
        }
    }

    fn schedule_full_copy_resume_now(self: &Arc<Self>, st: &mut ManagerState, record: FullCopyResumeRecord) {
        info!("full copy cursor invalidated, resuming now");
        self.schedule(st, Duration::ZERO, "failed resuming full copy", move |inner, st| {
            inner.enqueue_full_copy_resume(st, record)
        });
    }

    fn schedule_collection_retry(self: &Arc<Self>, st: &mut ManagerState) -> ReplicationResult<()> {
        if st.lifecycle != LifecycleState::InitialSync {
            return Err(ReplicationError::invalid_state("retry full copy", st.lifecycle));
        }

        self.store
            .set_status(IndexStatus::does_not_exist(AbsenceReason::CollectionNotFound));

        let wait = self.backoff.fixed(BackoffContext::FullCopyResync);
        self.schedule(st, wait, "failed enqueueing full copy retry", |inner, st| {
            info!("retrying full copy of missing collection");
            inner.dispatch_full_copy(st, IndexStatus::initial_sync(), None, Some(true));
            Ok(())
        });
        Ok(())
    }

    // ---- steady state ---------------------------------------------------

    fn resume_steady_state(
        self: &Arc<Self>,
        st: &mut ManagerState,
        record: ChangeStreamResumeRecord,
    ) -> ReplicationResult<()> {
        if st.lifecycle.is_terminal() {
            return Ok(());
        }

        // Steady must never be visible before the data is.
        self.must(self.store.refresh_reader(), "failed to refresh reader")?;

        info!("resuming steady state replication");
        let resume_op_time = self.must(
            record.resume_token.op_time().map_err(ReplicationError::from),
            "failed to parse resume token",
        )?;
        let last_indexed = resume_op_time.last_applied_before();

        let metrics = self.store.metrics();
        {
            let mut gauge = metrics.replication_op_time().lock();
            gauge.set(last_indexed);
            self.transition(st, LifecycleState::SteadyState);
            self.store.set_status(IndexStatus::steady());
        }

        let epoch = st.next_epoch();
        let request = TailRequest {
            generation: self.generation.clone(),
            indexer: Arc::clone(&self.indexer),
            metrics,
            resume: record,
            filter_by_collection_id: st.capabilities.filter_by_collection_id(),
        };
        let session = self.change_tail.start(request);
        let inner = Arc::clone(self);
        st.engine = Some(self.spawn(async move {
            let failure = session.await;
            inner.on_tail_failure(epoch, failure);
        }));
        Ok(())
    }

    fn on_tail_failure(self: &Arc<Self>, epoch: u64, failure: EngineFailure<ChangeTailError>) {
        let mut st = self.state.lock();
        self.metrics.record_exception(failure.exception_key());

        if !st.is_current(epoch) {
            if !failure.is_shut_down() {
                info!(error = %failure, "tailing failed after shut down, not scheduling more work");
            }
            return;
        }

        info!(error = %failure, "tailing failed, stopping change tail");
        self.transition(&mut st, LifecycleState::SteadyStateShuttingDown);

        let (stopped_tx, stopped) = completion();
        st.tail_stop = Some(stopped);

        let engine = Arc::clone(&self.change_tail);
        let generation_id = self.generation.generation_id();
        let inner = Arc::clone(self);
        self.spawn(async move {
            let stopped = engine.stop(generation_id).await;
            inner.on_tail_stopped(epoch, failure, stopped);
            stopped_tx.complete();
        });
    }

    fn on_tail_stopped(
        self: &Arc<Self>,
        epoch: u64,
        failure: EngineFailure<ChangeTailError>,
        stopped: Result<ChangeStreamResumeRecord, Cause>,
    ) {
        let mut st = self.state.lock();
        info!("change tail stopped, handling failure");

        if !st.is_current(epoch) {
            return;
        }

        let outcome = match stopped {
            Ok(resume) => self.handle_tail_failure(&mut st, failure, resume),
            Err(cause) => Err(self.crash("failed stopping change tail", Some(&cause))),
        };
        self.finish(outcome, "failed handling change tail failure");
    }

    fn handle_tail_failure(
        self: &Arc<Self>,
        st: &mut ManagerState,
        failure: EngineFailure<ChangeTailError>,
        resume: ChangeStreamResumeRecord,
    ) -> ReplicationResult<()> {
        let error = match failure {
            EngineFailure::Unexpected(cause) => {
                self.crash_on_out_of_memory(&cause)?;
                let message = cause.to_string();
                return if self.flags.stale_on_unexpected_steady_state_error {
                    self.stale_index(st, StaleReason::UnexpectedError, &message)
                } else if self.flags.retain_failed_index_data {
                    self.fail_and_close(st, &message, FailureReason::ChangeTailFailed)
                } else {
                    self.fail_and_drop(st, &message, FailureReason::ChangeTailFailed)
                };
            }
            EngineFailure::Classified(error) => error,
        };

        self.store.metrics().record_change_tail_exception();
        match error {
            ChangeTailError::Dropped { message } => {
                info!(%message, "source collection dropped, dropping index");
                self.drop_dropped_collection(st)
            }
            ChangeTailError::RequiresResync { message, .. } => {
                info!(error = %message, "tailing requires a full resync");
                self.enqueue_full_copy(st, IndexStatus::initial_sync())
            }
            ChangeTailError::Transient { cause } => {
                let wait = self
                    .backoff
                    .duration(BackoffContext::SteadyStateTransient, Some(&cause));
                info!(
                    error = %cause,
                    backoff_ms = wait.as_millis() as u64,
                    "transient tailing error, resuming after backoff"
                );

                if self.generation.definition().view().is_some() && is_view_pipeline_related(&cause) {
                    self.metrics.increment("view_pipeline_tail_retry", Vec::new());
                    self.store.set_status(IndexStatus::recovering_transient(
                        view_pipeline_error_message(&cause),
                    ));
                }

                if is_collection_id_filter_unsupported(&cause) {
                    self.metrics
                        .increment("collection_id_filter_unsupported", Vec::new());
                    st.capabilities = st.capabilities.without_collection_id_filter();
                }

                self.schedule(st, wait, "failed resuming steady state", move |inner, st| {
                    inner.resume_steady_state(st, resume)
                });
                Ok(())
            }
            ChangeTailError::NonInvalidatingResync { cause } => {
                info!(
                    error = %cause,
                    "tailing requires a new index, committing and marking current index as recovering"
                );
                self.must(self.indexer.commit(), "failed to commit index")?;
                let last_optime = self.last_optime()?;
                self.store
                    .set_status(IndexStatus::recovering_non_transient(last_optime));
                Ok(())
            }
            ChangeTailError::FieldLimitExceeded { reason } => self.exceeded(st, &reason),
            ChangeTailError::DocsLimitExceeded { .. } => {
                self.stale_index(st, StaleReason::DocsExceeded, "")
            }
            ChangeTailError::Renamed { resume: renamed } => {
                let definition = self.generation.definition();
                info!(
                    from = %definition.last_observed_collection_name(),
                    to = %renamed.namespace.collection,
                    "source collection renamed, resuming now"
                );
                definition.set_last_observed_collection_name(renamed.namespace.collection.clone());
                self.resume_steady_state(st, renamed)
            }
            ChangeTailError::Invalidated { resume: reopened } => {
                info!("change stream invalidated, opening a new one");
                self.resume_steady_state(st, reopened)
            }
            ChangeTailError::ShutDown => {
                info!("tailing was shut down, not scheduling more work");
                self.transition(st, LifecycleState::ShutDown);
                Ok(())
            }
        }
    }

    // ---- scheduling -----------------------------------------------------

    /// Runs `action` under the lock after `delay`, unless superseded first.
    fn schedule<F>(self: &Arc<Self>, st: &mut ManagerState, delay: Duration, context: &'static str, action: F)
    where
        F: FnOnce(&Arc<Inner>, &mut ManagerState) -> ReplicationResult<()> + Send + 'static,
    {
        let epoch = st.next_epoch();
        let inner = Arc::clone(self);
        let timer = self.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut st = inner.state.lock();
            if !st.is_current(epoch) {
                return;
            }
            st.timer = None;
            let result = action(&inner, &mut *st);
            inner.finish(result, context);
        });
        st.timer = Some(timer);
    }

    // ---- terminal paths -------------------------------------------------

    fn exceeded(&self, st: &mut ManagerState, reason: &str) -> ReplicationResult<()> {
        info!(reason, "failing index that exceeded limits");
        self.transition(st, LifecycleState::FailedExceeded);
        self.clear_index(
            IndexStatus::failed_with_reason(
                format!("{EXCEEDED_LIMIT_PREFIX}{reason}"),
                FailureReason::ExceededMaxLimit,
            ),
            CommitMetadata::exceeded(reason),
        )
    }

    fn shut_down_collection_missing(&self, st: &mut ManagerState) -> ReplicationResult<()> {
        info!("source collection not found, shutting down replication");
        let info = IndexStateInfo::collection_not_found();
        self.transition(st, LifecycleState::ShutDown);
        self.store.set_status(IndexStatus::from_index_state(&info));
        self.persist(
            CommitMetadata::from_index_state(info),
            "failed to commit index status",
        )
    }

    fn serve_stale(&self, st: &mut ManagerState, info: &StaleStateInfo) {
        warn!(
            last_optime = %info.last_optime,
            message = %info.message,
            "stopping replication and serving stale data"
        );
        let metrics = self.store.metrics();
        let mut gauge = metrics.replication_op_time().lock();
        gauge.set(info.last_optime);
        self.transition(st, LifecycleState::ShutDown);
        self.store
            .set_status(IndexStatus::stale(info.message.clone(), info.last_optime));
    }

    fn stale_index(
        &self,
        st: &mut ManagerState,
        reason: StaleReason,
        detail: &str,
    ) -> ReplicationResult<()> {
        let last_optime = self.last_optime()?;
        let message = reason.format_message(detail);
        warn!(%message, %last_optime, "transitioning index to stale");

        let info = StaleStateInfo::new(last_optime, reason, message);
        self.serve_stale(st, &info);
        // Comes back stale after a restart.
        self.persist(CommitMetadata::stale(info), "failed to commit stale status")
    }

    /// Op time of the last committed change-stream position.
    fn last_optime(&self) -> ReplicationResult<OpTime> {
        let metadata = self.must(self.read_commit_metadata(), "failed reading commit metadata")?;
        match metadata.change_stream_resume_record() {
            Some(record) => self.must(
                record.resume_token.op_time().map_err(ReplicationError::from),
                "failed to parse resume token",
            ),
            None => Err(self.crash("failed to get last optime", None)),
        }
    }

    fn persist(&self, metadata: CommitMetadata, reason: &str) -> ReplicationResult<()> {
        let encoded = self.must(
            metadata.encode().map_err(ReplicationError::from),
            "failed to encode commit metadata",
        )?;
        self.must(
            self.indexer.update_commit_metadata(encoded),
            "failed to update commit metadata",
        )?;
        self.must(self.indexer.commit(), reason)
    }

    fn fail_and_drop(
        &self,
        st: &mut ManagerState,
        message: &str,
        reason: FailureReason,
    ) -> ReplicationResult<()> {
        error!(error = %message, "failing index after unexpected error");
        self.transition(st, LifecycleState::Failed);
        self.drop_index_with(IndexStatus::failed_with_reason(
            format!("{REPLICATION_FAILED_PREFIX}{message}"),
            reason,
        ))
    }

    fn fail_and_close(
        &self,
        st: &mut ManagerState,
        message: &str,
        reason: FailureReason,
    ) -> ReplicationResult<()> {
        error!(error = %message, "failing index after unexpected error");
        self.transition(st, LifecycleState::Failed);
        self.kill_cursors(IndexStatus::failed_with_reason(
            format!("{REPLICATION_FAILED_PREFIX}{message}"),
            reason,
        ))?;
        self.must(self.store.close(), "failed to close index")?;
        self.detach_synonym_shutdowns();
        Ok(())
    }

    fn drop_dropped_collection(&self, st: &mut ManagerState) -> ReplicationResult<()> {
        self.transition(st, LifecycleState::ShutDown);
        self.drop_index_with(IndexStatus::does_not_exist(AbsenceReason::IndexDropped))
    }

    fn drop_after_shutdown(&self) {
        let mut st = self.state.lock();
        self.transition(&mut st, LifecycleState::ShutDown);
        let result = self.drop_index_with(IndexStatus::does_not_exist(AbsenceReason::IndexDropped));
        self.finish(result, "failed to drop index");
    }

    // ---- teardown -------------------------------------------------------
    //
    // Status first, then cursors, then contents: a query routed before the
    // status change is killed before the data it reads goes away.

    fn kill_cursors(&self, status: IndexStatus) -> ReplicationResult<()> {
        self.store.set_status(status);
        self.must(
            self.cursors
                .kill_index_cursors(self.generation.generation_id()),
            "failed to kill index cursors",
        )
    }

    fn clear_index(&self, status: IndexStatus, metadata: CommitMetadata) -> ReplicationResult<()> {
        info!("clearing index");
        self.kill_cursors(status)?;
        let encoded = self.must(
            metadata.encode().map_err(ReplicationError::from),
            "failed to encode commit metadata",
        )?;
        self.must(self.indexer.clear_index(encoded), "failed to clear index")
    }

    fn drop_index_with(&self, status: IndexStatus) -> ReplicationResult<()> {
        let reason = status
            .reason()
            .map_or(UNKNOWN_DROP_REASON, |reason| reason.label());
        self.metrics.record_index_dropped(reason);

        self.kill_cursors(status)?;
        self.must(self.store.close(), "failed to close index")?;
        self.must(self.store.drop_index(), "failed to drop index")?;
        self.detach_synonym_shutdowns();
        Ok(())
    }

    fn detach_synonym_shutdowns(&self) {
        for synonym in &self.synonyms {
            let synonym = Arc::clone(synonym);
            self.spawn(async move { synonym.shutdown().await });
        }
    }

    // ---- shutdown -------------------------------------------------------

    fn begin_shutdown(&self, st: &mut ManagerState) -> ShutdownFuture {
        self.committer.close();

        let current = st.lifecycle;
        self.transition(st, LifecycleState::ShutDown);
        if let Some(timer) = st.timer.take() {
            timer.abort();
        }

        let generation_id = self.generation.generation_id();
        let engine_task = st.engine.take();
        match current {
            LifecycleState::Initializing => Box::pin(st.init_done.clone().wait()),
            LifecycleState::InitialSync => {
                let engine = Arc::clone(&self.full_copy);
                Box::pin(async move {
                    engine.cancel(generation_id).await;
                    join_engine(engine_task).await;
                })
            }
            LifecycleState::SteadyState => {
                let engine = Arc::clone(&self.change_tail);
                Box::pin(async move {
                    if let Err(e) = engine.stop(generation_id).await {
                        warn!(error = %e, "change tail failed to stop cleanly");
                    }
                    join_engine(engine_task).await;
                })
            }
            LifecycleState::SteadyStateShuttingDown => match st.tail_stop.clone() {
                Some(stopped) => Box::pin(stopped.wait()),
                None => Box::pin(Completion::done().wait()),
            },
            LifecycleState::InitialSyncBackoff
            | LifecycleState::ShutDown
            | LifecycleState::Failed
            | LifecycleState::FailedExceeded => Box::pin(std::future::ready(())),
        }
    }
}

/// Waits for an engine task to hand its result back.
async fn join_engine(task: Option<JoinHandle<()>>) {
    let Some(task) = task else {
        return;
    };
    if let Err(e) = task.await {
        warn!(error = %e, "engine task ended abnormally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{IndexDefinition, IndexId};
    use crate::mock::{Event, MemoryCollaborators, RecordingFatalHook};
    use replix_commit::{EncodedMetadata, IndexFormatVersion};
    use uuid::Uuid;

    fn manager(mocks: &MemoryCollaborators) -> (ReplicationIndexManager, Arc<RecordingFatalHook>) {
        let definition =
            IndexDefinition::new(IndexId::new_random(), "default", "shop", "orders", Uuid::new_v4());
        let fatal = Arc::new(RecordingFatalHook::new());
        let manager = ReplicationIndexManager::create(
            IndexGeneration::new(definition, 0, IndexFormatVersion::CURRENT),
            mocks.collaborators(),
            &ReplicationConfig::default(),
            FeatureFlags::default(),
            fatal.clone(),
            Handle::current(),
        );
        (manager, fatal)
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = [
            LifecycleState::Initializing,
            LifecycleState::InitialSync,
            LifecycleState::InitialSyncBackoff,
            LifecycleState::SteadyState,
            LifecycleState::SteadyStateShuttingDown,
            LifecycleState::ShutDown,
            LifecycleState::Failed,
            LifecycleState::FailedExceeded,
        ]
        .into_iter()
        .filter(LifecycleState::is_terminal)
        .collect();

        assert_eq!(
            terminal,
            vec![
                LifecycleState::ShutDown,
                LifecycleState::Failed,
                LifecycleState::FailedExceeded
            ]
        );
        assert_eq!(LifecycleState::SteadyStateShuttingDown.to_string(), "STEADY_STATE_SHUT_DOWN");
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_twice_drops_once_per_call() {
        let mocks = MemoryCollaborators::new(EncodedMetadata::default(), 0);
        let (manager, fatal) = manager(&mocks);
        manager.init_future().await;

        manager.drop_index().await;
        assert_eq!(manager.state(), LifecycleState::ShutDown);
        assert_eq!(mocks.full_copy.cancels(), 1);
        assert_eq!(mocks.log.count(|e| *e == Event::Drop), 1);

        manager.drop_index().await;
        assert_eq!(mocks.full_copy.cancels(), 1);
        assert_eq!(mocks.log.count(|e| *e == Event::Drop), 2);
        assert_eq!(manager.metrics().indexes_dropped.get("index_dropped"), Some(&2));
        assert_eq!(fatal.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_start_hook_does_not_publish() {
        let mocks = MemoryCollaborators::new(EncodedMetadata::default(), 0);
        let (manager, _fatal) = manager(&mocks);
        let mut copy = mocks.full_copy.next_invocation().await.unwrap();

        manager.shutdown().await;
        let before = mocks.index.status_history().len();
        copy.start();
        assert_eq!(mocks.index.status_history().len(), before);
    }
}
