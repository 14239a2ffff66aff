//! Integration test infrastructure for the portctl engine
//!
//! Provides:
//! - Simulated fleets sized from a handful of ports up to thousands
//! - Engine harnesses wired to in-memory audit sinks and stores
//! - Fault and timing helpers for lifecycle scenarios
//! - Verification helpers for ordering, transitions and audit coverage

pub mod fixtures;
mod verification;

pub use fixtures::*;
pub use verification::*;
