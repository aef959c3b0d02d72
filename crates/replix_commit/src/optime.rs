//! Source-server operation times.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in the source server's operation log.
///
/// Ordered first by wall-clock seconds, then by the intra-second ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct OpTime {
    /// Seconds since the Unix epoch.
    pub seconds: u32,
    /// Ordinal of the operation within `seconds`.
    pub increment: u32,
}

impl OpTime {
    /// Creates an operation time.
    pub const fn new(seconds: u32, increment: u32) -> Self {
        Self { seconds, increment }
    }

    /// Packs the operation time into a single comparable integer.
    pub const fn value(&self) -> u64 {
        ((self.seconds as u64) << 32) | self.increment as u64
    }

    /// Unpacks an operation time produced by [`OpTime::value`].
    pub const fn from_value(value: u64) -> Self {
        Self {
            seconds: (value >> 32) as u32,
            increment: value as u32,
        }
    }

    /// Returns the operation time of the last event applied before a resume
    /// point at `self`.
    ///
    /// A change-stream resume token points one past the last applied event,
    /// so the ordinal is stepped back by one, never below zero.
    pub const fn last_applied_before(&self) -> Self {
        Self {
            seconds: self.seconds,
            increment: self.increment.saturating_sub(1),
        }
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.seconds, self.increment)
    }
}
