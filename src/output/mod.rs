//! Output encoders for replayed call trees.
//!
//! Encoders receive the replayed lines one at a time through the
//! [`TraceEncoder`] trait and do not care how the tree was built:
//!
//! - [`text::TextEncoder`]: indented call graph with durations
//! - [`chrome::ChromeEncoder`]: trace-event JSON for generic trace viewers
//!
//! [`dump`] prints the raw merged timeline and bypasses the replayer.

pub mod chrome;
pub mod dump;
pub mod text;

pub use chrome::ChromeEncoder;
pub use dump::dump_events;
pub use text::TextEncoder;

use anyhow::Result;

use crate::replay::{CallTree, Line};
use crate::session::Session;

/// Sink for one replayed session.
pub trait TraceEncoder {
    /// Called once before the first line.
    fn begin(&mut self, session: &Session) -> Result<()>;

    /// Called for every line in replay order.
    fn line(&mut self, line: &Line<'_>) -> Result<()>;

    /// Called once after the last line.
    fn end(&mut self, session: &Session, tree: &CallTree) -> Result<()>;
}

/// Drive `encoder` over a replayed tree.
pub fn encode(encoder: &mut dyn TraceEncoder, session: &Session, tree: &CallTree) -> Result<()> {
    encoder.begin(session)?;
    for line in tree.lines() {
        encoder.line(&line)?;
    }
    encoder.end(session, tree)
}

const UNITS: [(u64, &str); 5] = [
    (1_000, "us"),
    (1_000_000, "ms"),
    (1_000_000_000, " s"),
    (60_000_000_000, " m"),
    (3_600_000_000_000, " h"),
];

/// Format a duration in the 10-column `%3u.%03u unit` layout. Zero and
/// unknown durations are blank.
pub fn format_duration(ns: Option<u64>) -> String {
    let Some(ns) = ns.filter(|&ns| ns > 0) else {
        return " ".repeat(10);
    };
    let mut unit = UNITS[0];
    for next in &UNITS[1..] {
        if ns < next.0 {
            break;
        }
        unit = *next;
    }
    let (scale, name) = unit;
    let whole = ns / scale;
    let frac = (ns % scale) * 1000 / scale;
    format!("{whole:3}.{frac:03} {name}")
}

/// `sec.nsec` timestamp as printed by the dump output.
pub fn format_timestamp(ns: u64) -> String {
    format!("{}.{:09}", ns / 1_000_000_000, ns % 1_000_000_000)
}
