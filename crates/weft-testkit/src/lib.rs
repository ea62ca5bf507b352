//! # weft-testkit
//!
//! Shared fixtures for integration tests: deterministic identities,
//! pre-built cores, and wired node pairs.

pub mod fixtures;

pub use fixtures::{connect, parties, party, plain_map_core, settle, TestParty};
