//! Raw dump of the merged timeline, one event per line.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;

use super::format_timestamp;
use crate::session::Session;
use crate::trace::Event;

/// Write `<ts> <tid>: [<kind>] <name>(<depth>)` for every event.
///
/// Depth is the per-task stack depth as recorded, before any filtering.
pub fn dump_events<W, I>(out: &mut W, session: &Session, events: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = Event>,
{
    let mut depths: HashMap<u32, usize> = HashMap::new();
    for event in events {
        let depth = depths.entry(event.task_id).or_default();
        let shown = if event.kind.is_exit() {
            *depth = depth.saturating_sub(1);
            *depth
        } else if event.kind.is_entry() {
            *depth += 1;
            *depth - 1
        } else {
            *depth
        };
        let tid = session
            .task(event.task_id)
            .map_or(event.task_id as i32, |t| t.tid);
        write!(
            out,
            "{} {:>6}: [{}] {}({})",
            format_timestamp(event.timestamp),
            tid,
            event.kind,
            event.function_ref,
            shown
        )?;
        if let Some(retval) = &event.retval {
            write!(out, " = {}", retval.render_plain())?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}
