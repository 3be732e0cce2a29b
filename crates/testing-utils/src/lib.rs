//! # Scheduler Testing Utils
//!
//! Shared testing utilities for the transactional task scheduler.
//! This crate provides hand-written mock participants, task bodies and
//! ownership maps, plus builders and helpers used by the integration tests
//! of the other crates in the workspace.
//!
//! ## Usage
//!
//! Add this crate as a dev-dependency:
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```
//!
//! Then use the mocks in your tests:
//!
//! ```rust,ignore
//! use scheduler_testing_utils::{CountingBody, StaticOwnership, TaskBuilder};
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

// Re-export commonly used items
pub use builders::*;
pub use helpers::*;
pub use mocks::*;
