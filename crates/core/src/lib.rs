//! Shared types and pure helpers for the forgefleet job dispatch platform.
//!
//! Nothing in this crate performs I/O. It is depended on by every other
//! workspace crate.

pub mod error;
pub mod hashing;
pub mod job_events;
pub mod model_match;
pub mod progress;
pub mod types;
