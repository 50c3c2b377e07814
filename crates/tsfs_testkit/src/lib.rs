//! # tsfs Testkit
//!
//! Test utilities for tsfs.
//!
//! This crate provides:
//! - Scratch stores that can be reopened to exercise recovery
//! - A crash harness built on the engine's `fault-injection` hooks
//! - A scriptable [`TransactionService`](tsfs_core::TransactionService)
//!   double and a two-phase coordinator driving several services
//! - Concurrent load helpers
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tsfs_testkit::prelude::*;
//!
//! #[test]
//! fn committed_series_survive_reopen() {
//!     let mut store = TestStore::new();
//!     commit_ints(store.backend(), "/a/b", 0, &[1, 2, 3], 7).unwrap();
//!     store.reopen().unwrap();
//!     assert_eq!(read_ints(store.backend(), "/a/b", 0, 2).unwrap().ints(), vec![1, 2, 3]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod coordinator;
pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::coordinator::*;
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use coordinator::*;
pub use crash::*;
pub use fixtures::*;
pub use stress::*;
