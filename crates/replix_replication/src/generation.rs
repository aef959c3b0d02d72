//! Index generation identity and definition.

use parking_lot::RwLock;
use replix_commit::{IndexFormatVersion, Namespace};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identifies an index across all of its generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexId(Uuid);

impl IndexId {
    /// Creates a random index id.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one generation of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationId {
    /// The index.
    pub index_id: IndexId,
    /// Generation number, increasing with each definition change.
    pub generation: u64,
}

impl GenerationId {
    /// Creates a generation id.
    pub fn new(index_id: IndexId, generation: u64) -> Self {
        Self {
            index_id,
            generation,
        }
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-g{}", self.index_id, self.generation)
    }
}

/// A source view the index reads through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDefinition {
    /// View name.
    pub name: String,
    /// Pipeline stages, as the server reports them.
    pub pipeline: Vec<String>,
}

/// What an index replicates.
#[derive(Debug)]
pub struct IndexDefinition {
    index_id: IndexId,
    name: String,
    database: String,
    collection_uuid: Uuid,
    view: Option<ViewDefinition>,
    partitions: u32,
    last_observed_collection_name: RwLock<String>,
}

impl IndexDefinition {
    /// Creates a definition over `database.collection`.
    pub fn new(
        index_id: IndexId,
        name: impl Into<String>,
        database: impl Into<String>,
        collection: impl Into<String>,
        collection_uuid: Uuid,
    ) -> Self {
        Self {
            index_id,
            name: name.into(),
            database: database.into(),
            collection_uuid,
            view: None,
            partitions: 1,
            last_observed_collection_name: RwLock::new(collection.into()),
        }
    }

    /// Reads the collection through `view`.
    pub fn with_view(mut self, view: ViewDefinition) -> Self {
        self.view = Some(view);
        self
    }

    /// Sets the number of index partitions.
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    /// Index id.
    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    /// Index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source database.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// UUID of the source collection.
    pub fn collection_uuid(&self) -> Uuid {
        self.collection_uuid
    }

    /// Source view, if any.
    pub fn view(&self) -> Option<&ViewDefinition> {
        self.view.as_ref()
    }

    /// Number of index partitions.
    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Collection name as last seen in the change stream.
    pub fn last_observed_collection_name(&self) -> String {
        self.last_observed_collection_name.read().clone()
    }

    /// Records a rename of the source collection.
    pub fn set_last_observed_collection_name(&self, name: impl Into<String>) {
        *self.last_observed_collection_name.write() = name.into();
    }

    /// Namespace currently replicated.
    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.database.clone(), self.last_observed_collection_name())
    }
}

/// One generation of an index, owned by a single replication manager.
#[derive(Debug, Clone)]
pub struct IndexGeneration {
    generation_id: GenerationId,
    format_version: IndexFormatVersion,
    definition: Arc<IndexDefinition>,
}

impl IndexGeneration {
    /// Creates a generation of `definition`.
    pub fn new(
        definition: IndexDefinition,
        generation: u64,
        format_version: IndexFormatVersion,
    ) -> Self {
        Self {
            generation_id: GenerationId::new(definition.index_id(), generation),
            format_version,
            definition: Arc::new(definition),
        }
    }

    /// Generation id.
    pub fn generation_id(&self) -> GenerationId {
        self.generation_id
    }

    /// Declared index format version.
    pub fn format_version(&self) -> IndexFormatVersion {
        self.format_version
    }

    /// Shared definition.
    pub fn definition(&self) -> &Arc<IndexDefinition> {
        &self.definition
    }
}
