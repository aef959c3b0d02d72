//! A replication manager wired to in-memory collaborators.
//!
//! The harness runs on the current tokio runtime. Tests are expected to use
//! paused time (`#[tokio::test(start_paused = true)]`) so that backoffs
//! elapse instantly while waiting.

use crate::fixtures::{encode, generation};
use replix_commit::{CommitMetadata, EncodedMetadata};
use replix_replication::mock::{FullCopyInvocation, MemoryCollaborators, RecordingFatalHook, TailInvocation};
use replix_replication::{
    FeatureFlags, IndexGeneration, IndexStatus, LifecycleState, ReplicationConfig,
    ReplicationIndexManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Paused-time step between polls.
const POLL_STEP: Duration = Duration::from_millis(10);

/// Polls before giving up; covers several minutes of paused time.
const MAX_POLLS: usize = 60_000;

/// Builds a [`Harness`].
#[derive(Debug)]
pub struct HarnessBuilder {
    generation: IndexGeneration,
    committed: EncodedMetadata,
    config: ReplicationConfig,
    flags: FeatureFlags,
    synonyms: usize,
}

impl HarnessBuilder {
    /// A never-committed index with default settings and one synonym sync.
    pub fn new() -> Self {
        Self {
            generation: generation(),
            committed: EncodedMetadata::default(),
            config: ReplicationConfig::default(),
            flags: FeatureFlags::default(),
            synonyms: 1,
        }
    }

    /// Replicates `generation`.
    pub fn with_generation(mut self, generation: IndexGeneration) -> Self {
        self.generation = generation;
        self
    }

    /// Starts from an index whose last commit carried `metadata`.
    pub fn with_committed(mut self, metadata: &CommitMetadata) -> Self {
        self.committed = encode(metadata);
        self
    }

    /// Uses `config`.
    pub fn with_config(mut self, config: ReplicationConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `flags`.
    pub fn with_flags(mut self, flags: FeatureFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Uses `count` synonym syncs.
    pub fn with_synonyms(mut self, count: usize) -> Self {
        self.synonyms = count;
        self
    }

    /// Creates the manager on the current runtime.
    pub fn start(self) -> Harness {
        let mocks = MemoryCollaborators::new(self.committed, self.synonyms);
        let fatal = Arc::new(RecordingFatalHook::new());
        let manager = ReplicationIndexManager::create(
            self.generation,
            mocks.collaborators(),
            &self.config,
            self.flags,
            fatal.clone(),
            Handle::current(),
        );
        Harness {
            mocks,
            fatal,
            manager,
        }
    }
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running manager and its collaborators.
#[derive(Debug)]
pub struct Harness {
    /// In-memory collaborators.
    pub mocks: MemoryCollaborators,
    /// Fatal handler recording crashes.
    pub fatal: Arc<RecordingFatalHook>,
    /// Manager under test.
    pub manager: ReplicationIndexManager,
}

impl Harness {
    /// Starts a never-committed index with default settings.
    pub fn start() -> Self {
        HarnessBuilder::new().start()
    }

    /// Waits for the next full-copy call.
    pub async fn next_full_copy(&self) -> FullCopyInvocation {
        self.mocks
            .full_copy
            .next_invocation()
            .await
            .expect("Full-copy engine closed")
    }

    /// Waits for the next tailing session.
    pub async fn next_tail(&self) -> TailInvocation {
        self.mocks
            .change_tail
            .next_invocation()
            .await
            .expect("Change-tail engine closed")
    }

    /// Waits until the manager reaches `state`.
    pub async fn wait_for_state(&self, state: LifecycleState) {
        self.wait_until(|h| h.manager.state() == state)
            .await
            .unwrap_or_else(|| panic!("Timed out waiting for {state}, still {}", self.manager.state()));
    }

    /// Waits until `condition` holds, or gives up and returns `None`.
    pub async fn wait_until(&self, condition: impl Fn(&Harness) -> bool) -> Option<()> {
        for _ in 0..MAX_POLLS {
            if condition(self) {
                return Some(());
            }
            tokio::time::sleep(POLL_STEP).await;
        }
        None
    }

    /// Lets spawned tasks run without advancing past `duration`.
    pub async fn settle(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Status currently published.
    pub fn status(&self) -> IndexStatus {
        use replix_replication::IndexedStore;
        self.mocks.index.status()
    }

    /// Decodes the committed metadata.
    pub fn committed(&self) -> CommitMetadata {
        self.mocks
            .index
            .committed_metadata()
            .expect("Committed metadata is corrupt")
    }
}
