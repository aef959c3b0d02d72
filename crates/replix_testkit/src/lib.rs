//! # Replix Testkit
//!
//! Test utilities for Replix replication.
//!
//! This crate provides:
//! - Index definition and resume record fixtures
//! - A harness that wires a replication manager to in-memory collaborators
//! - Property-based generators for commit metadata using proptest
//! - Temporary metadata files for CLI tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use replix_testkit::prelude::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn copies_then_tails() {
//!     let harness = HarnessBuilder::new().start();
//!     let copy = harness.next_full_copy().await;
//!     copy.succeed(resume_record(10, 1));
//!     harness.wait_for_state(LifecycleState::SteadyState).await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use replix_replication::LifecycleState;
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;
