//! calltree library - recording session model and replay engine.
//!
//! A recorder leaves a session directory behind (or streams it to `recv`);
//! this crate validates it, merges the per-task streams into one timeline and
//! rebuilds the nested call tree from it.
//!
//! # Modules
//!
//! - [`session`] - session directory layout: metadata, task registry, streams
//! - [`collector`] - ingestion and validation of local or received sessions
//! - [`net`] - wire protocol, network receiver and session sender
//! - [`filter`] - patterns, triggers, capture selectors and replay options
//! - [`merge`] - lazy k-way merge of task streams
//! - [`replay`] - call-tree reconstruction
//! - [`output`] - text, trace-event JSON and raw dump encoders
//!
//! # Example
//!
//! ```no_run
//! use calltree::{collector::Collector, filter::ReplayConfig, merge, output, replay};
//! use std::path::Path;
//!
//! let session = Collector::ingest_dir(Path::new("calltree.data"))?;
//! let config = ReplayConfig::default();
//! let events = merge::merge(&session, &merge::MergeOptions::default());
//! let tree = replay::replay(&session, events, &config);
//! let mut encoder = output::TextEncoder::new(std::io::stdout().lock(), &config);
//! output::encode(&mut encoder, &session, &tree)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod collector;
pub mod error;
pub mod filter;
pub mod merge;
pub mod net;
pub mod output;
pub mod replay;
pub mod session;
pub mod trace;

pub use collector::{Collector, Source};
pub use error::TraceError;
pub use filter::{ReplayConfig, ReplayOptions};
pub use merge::{merge, MergeOptions, Merger};
pub use replay::{replay, CallTree, HookContext, Replayer, ScriptHook};
pub use session::Session;
