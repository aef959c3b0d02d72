//! Index and metadata fixtures.
//!
//! Every fixture replicates `shop.orders` unless stated otherwise.

use replix_commit::{
    ChangeStreamResumeRecord, CommitMetadata, EncodedMetadata, FullCopyResumeRecord,
    IndexFormatVersion, Namespace, OpTime, ResumeToken,
};
use replix_replication::{IndexDefinition, IndexGeneration, IndexId, ViewDefinition};
use std::io::Write;
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Source database of the fixtures.
pub const DATABASE: &str = "shop";

/// Source collection of the fixtures.
pub const COLLECTION: &str = "orders";

/// Namespace of the fixtures.
pub fn namespace() -> Namespace {
    Namespace::new(DATABASE, COLLECTION)
}

/// A definition over `shop.orders`.
pub fn index_definition() -> IndexDefinition {
    IndexDefinition::new(IndexId::new_random(), "default", DATABASE, COLLECTION, Uuid::new_v4())
}

/// A definition reading `shop.orders` through a view.
pub fn view_index_definition() -> IndexDefinition {
    index_definition().with_view(ViewDefinition {
        name: "open_orders".to_string(),
        pipeline: vec![r#"{"$match": {"status": "open"}}"#.to_string()],
    })
}

/// Generation 0 of `definition` at the current format version.
pub fn generation_of(definition: IndexDefinition) -> IndexGeneration {
    IndexGeneration::new(definition, 0, IndexFormatVersion::CURRENT)
}

/// Generation 0 of [`index_definition`].
pub fn generation() -> IndexGeneration {
    generation_of(index_definition())
}

/// A change-stream position at `Timestamp(seconds, increment)`.
pub fn resume_record(seconds: u32, increment: u32) -> ChangeStreamResumeRecord {
    ChangeStreamResumeRecord::new(
        namespace(),
        ResumeToken::from_op_time(OpTime::new(seconds, increment)),
    )
}

/// A natural-order full-copy checkpoint.
pub fn natural_order_record(seconds: u32) -> FullCopyResumeRecord {
    FullCopyResumeRecord::NaturalOrder {
        namespace: namespace(),
        high_water_mark: OpTime::new(seconds, 0),
        scan_resume_token: format!("scan-{seconds}"),
    }
}

/// An `_id`-order full-copy checkpoint.
pub fn id_order_record(seconds: u32) -> FullCopyResumeRecord {
    FullCopyResumeRecord::IdOrder {
        namespace: namespace(),
        high_water_mark: OpTime::new(seconds, 0),
        last_scanned_id: format!("id-{seconds}"),
    }
}

/// Encodes `metadata`, panicking on failure.
pub fn encode(metadata: &CommitMetadata) -> EncodedMetadata {
    metadata.encode().expect("Failed to encode commit metadata")
}

/// Writes `metadata` to a temporary file, as an index commit would hold it.
pub fn metadata_file(metadata: &CommitMetadata) -> NamedTempFile {
    bytes_file(encode(metadata).as_bytes())
}

/// Writes raw `bytes` to a temporary file.
pub fn bytes_file(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(bytes).expect("Failed to write temp file");
    file.flush().expect("Failed to flush temp file");
    file
}
