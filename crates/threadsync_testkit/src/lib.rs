//! # threadsync Testkit
//!
//! Test utilities for threadsync.
//!
//! This crate provides:
//! - A [`TestHarness`] wiring an engine to an in-memory remote, an on-disk
//!   state store and a temporary workspace
//! - Scripted fault plans for the in-memory remote
//! - Property-based generators for remote histories and local edits
//!
//! ## Usage
//!
//! ```rust,ignore
//! use threadsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn mirrors_remote() {
//!     let harness = TestHarness::new();
//!     harness.remote.put_file("a.txt", "hello");
//!     harness.engine().sync_now().await.unwrap();
//!     assert_eq!(harness.read_local("a.txt").unwrap(), b"hello");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
