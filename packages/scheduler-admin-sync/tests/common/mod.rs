//! Common test utilities for scheduler-admin-sync
//!
//! Shared fixtures, assertions and builders for the integration suites.

#![allow(dead_code)]

mod assertions;
mod builders;
mod fixtures;

// Re-export all utilities
pub use assertions::*;
pub use builders::*;
pub use fixtures::*;
