//! # lodestar-test
//!
//! Integration tests for the Lodestar driver.
//!
//! This crate contains:
//! - Fixtures building in-memory replica sets and sessions over them
//! - End-to-end tests of sessions, writes, queries, cursors and indexes

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Test fixtures and helpers
pub mod fixtures;
