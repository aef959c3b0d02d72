//! Resume records for the full-copy and change-tail engines.

use crate::error::{CommitDataError, CommitDataResult};
use crate::optime::OpTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Leading type byte of a resume token carrying a timestamp.
const TIMESTAMP_TYPE_BYTE: &str = "82";

/// Hex digits following the type byte: seconds and increment, 8 each.
const TIMESTAMP_HEX_LEN: usize = 16;

/// A database/collection pair on the source server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name.
    pub database: String,
    /// Collection name.
    pub collection: String,
}

impl Namespace {
    /// Creates a namespace.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// An opaque change-stream resume token.
///
/// The token is the upstream `_data` hex string. Its first byte tags the
/// cluster time that follows as two big-endian 32-bit words.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    /// Wraps raw `_data` hex.
    pub fn from_data(data: impl Into<String>) -> Self {
        Self(data.into())
    }

    /// Builds a token positioned at `op_time`.
    pub fn from_op_time(op_time: OpTime) -> Self {
        Self(format!(
            "{TIMESTAMP_TYPE_BYTE}{:08X}{:08X}",
            op_time.seconds, op_time.increment
        ))
    }

    /// Returns the raw `_data` hex.
    pub fn data(&self) -> &str {
        &self.0
    }

    /// Reads the cluster time encoded in the token.
    pub fn op_time(&self) -> CommitDataResult<OpTime> {
        let data = self.0.as_str();
        let rest = data.strip_prefix(TIMESTAMP_TYPE_BYTE).ok_or_else(|| {
            CommitDataError::invalid_resume_token(data, "missing timestamp type byte")
        })?;
        let digits = rest.get(..TIMESTAMP_HEX_LEN).ok_or_else(|| {
            CommitDataError::invalid_resume_token(data, "truncated timestamp")
        })?;

        let word = |range: std::ops::Range<usize>| {
            let hex = digits.get(range).ok_or_else(|| {
                CommitDataError::invalid_resume_token(data, "non-ascii timestamp")
            })?;
            u32::from_str_radix(hex, 16).map_err(|e| {
                CommitDataError::invalid_resume_token(data, format!("bad timestamp hex: {e}"))
            })
        };

        Ok(OpTime::new(word(0..8)?, word(8..16)?))
    }
}

/// Checkpoint from which the change-tail engine can reopen its stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStreamResumeRecord {
    /// Namespace the stream was watching when the record was taken.
    pub namespace: Namespace,
    /// Token positioned one past the last applied event.
    pub resume_token: ResumeToken,
}

impl ChangeStreamResumeRecord {
    /// Creates a change-stream resume record.
    pub fn new(namespace: Namespace, resume_token: ResumeToken) -> Self {
        Self {
            namespace,
            resume_token,
        }
    }
}

/// Checkpoint from which an interrupted full copy can continue.
///
/// The variant records which scan order produced it; a resume must use the
/// same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullCopyResumeRecord {
    /// Scan ordered by document id.
    IdOrder {
        /// Namespace being copied.
        namespace: Namespace,
        /// Change-stream position captured when the copy started.
        high_water_mark: OpTime,
        /// Encoded id of the last document copied.
        last_scanned_id: String,
    },
    /// Scan in the source's natural storage order.
    NaturalOrder {
        /// Namespace being copied.
        namespace: Namespace,
        /// Change-stream position captured when the copy started.
        high_water_mark: OpTime,
        /// Server-issued token for the next scan batch.
        scan_resume_token: String,
    },
}

impl FullCopyResumeRecord {
    /// Returns true if the record was produced by an id-ordered scan.
    pub fn is_id_order(&self) -> bool {
        matches!(self, FullCopyResumeRecord::IdOrder { .. })
    }

    /// Returns true if the record was produced by a natural-order scan.
    pub fn is_natural_order(&self) -> bool {
        matches!(self, FullCopyResumeRecord::NaturalOrder { .. })
    }

    /// Returns the namespace being copied.
    pub fn namespace(&self) -> &Namespace {
        match self {
            FullCopyResumeRecord::IdOrder { namespace, .. }
            | FullCopyResumeRecord::NaturalOrder { namespace, .. } => namespace,
        }
    }

    /// Returns the change-stream position captured when the copy started.
    pub fn high_water_mark(&self) -> OpTime {
        match self {
            FullCopyResumeRecord::IdOrder {
                high_water_mark, ..
            }
            | FullCopyResumeRecord::NaturalOrder {
                high_water_mark, ..
            } => *high_water_mark,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_op_time() {
        let token = ResumeToken::from_op_time(OpTime::new(1_700_000_000, 12));
        assert_eq!(token.op_time().unwrap(), OpTime::new(1_700_000_000, 12));
    }

    #[test]
    fn token_with_trailing_key_string() {
        // Real tokens carry the event's document key after the timestamp.
        let token = ResumeToken::from_data("8265A8B5C00000000C2B022C0100296E5A1004");
        assert_eq!(
            token.op_time().unwrap(),
            OpTime::new(0x65A8_B5C0, 0x0000_000C)
        );
    }

    #[test]
    fn token_errors() {
        assert!(ResumeToken::from_data("").op_time().is_err());
        assert!(ResumeToken::from_data("8300000001").op_time().is_err());
        assert!(ResumeToken::from_data("82000001").op_time().is_err());
        assert!(ResumeToken::from_data("82ZZZZZZZZ00000001").op_time().is_err());
    }

    #[test]
    fn full_copy_record_order() {
        let ns = Namespace::new("db", "coll");
        let id_order = FullCopyResumeRecord::IdOrder {
            namespace: ns.clone(),
            high_water_mark: OpTime::new(5, 1),
            last_scanned_id: "42".into(),
        };
        let natural = FullCopyResumeRecord::NaturalOrder {
            namespace: ns.clone(),
            high_water_mark: OpTime::new(5, 1),
            scan_resume_token: "r1".into(),
        };

        assert!(id_order.is_id_order());
        assert!(!id_order.is_natural_order());
        assert!(natural.is_natural_order());
        assert_eq!(natural.namespace(), &ns);
        assert_eq!(natural.high_water_mark(), OpTime::new(5, 1));
    }

    #[test]
    fn namespace_display() {
        assert_eq!(Namespace::new("shop", "orders").to_string(), "shop.orders");
    }
}
