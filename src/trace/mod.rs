//! Shared trace data types.
//!
//! These are the types every stage agrees on: the collector produces them from
//! a session directory, the merger orders them and the replayer turns them into
//! a call tree.
//!
//! # Module Organization
//!
//! - [`models`]: Event, task and captured-value types
//! - [`constants`]: File names, protocol limits and shared regex patterns

pub mod constants;
pub mod models;

// Re-export commonly used types
pub use models::*;
