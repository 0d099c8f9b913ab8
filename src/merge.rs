//! Lazy k-way merge of task streams into one timeline.
//!
//! Every task contributes one cursor that already interleaves its user and
//! kernel sub-streams. Cursors sit in a min-heap keyed by
//! `(timestamp, tie rank, task id)`, so at equal timestamps exits of one task
//! come out before entries of another and the task id settles the rest.
//!
//! A forked child is held back until its parent has produced every event
//! older than the child's registry creation time. The replayer then sees the
//! parent's call site open when the child starts.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::TraceError;
use crate::session::{Session, StreamReader};
use crate::trace::{Event, EventKind, StreamState, Task};

#[derive(Clone, Debug, Default)]
pub struct MergeOptions {
    /// Only merge tasks with these OS thread ids (all when empty).
    pub tids: Vec<i32>,
    /// Poll streams that have no end marker for up to this long.
    pub follow: Option<Duration>,
}

/// Order of two events of the same task at the same timestamp: kernel
/// activity nests inside the user frame around it.
fn task_rank(kind: EventKind) -> u8 {
    match kind {
        EventKind::KernelExit => 0,
        EventKind::Exit => 1,
        EventKind::EventMark => 2,
        EventKind::Entry => 3,
        EventKind::KernelEntry => 4,
    }
}

struct TaskCursor {
    user: Option<StreamReader>,
    kernel: Option<StreamReader>,
    /// Next unread event of each sub-stream with its record index.
    user_head: Option<(Event, usize)>,
    kernel_head: Option<(Event, usize)>,
}

fn open_reader(task: &Task, path: Option<&Path>, follow: Option<Duration>) -> Option<StreamReader> {
    let path = path?;
    let follow = if task.state == StreamState::Closed {
        None
    } else {
        follow
    };
    match StreamReader::open(task.task_id, path, follow) {
        Ok(reader) => Some(reader),
        Err(err) => {
            warn!("task {}: {:#}", task.task_id, err);
            None
        }
    }
}

fn read_head(reader: &mut Option<StreamReader>) -> Option<(Event, usize)> {
    let reader = reader.as_mut()?;
    let event = reader.next_event()?;
    Some((event, reader.record_index()))
}

impl TaskCursor {
    fn open(task: &Task, follow: Option<Duration>) -> Self {
        let mut user = open_reader(task, task.stream.as_deref(), follow);
        let mut kernel = open_reader(task, task.kernel_stream.as_deref(), follow);
        let user_head = read_head(&mut user);
        let kernel_head = read_head(&mut kernel);
        Self {
            user,
            kernel,
            user_head,
            kernel_head,
        }
    }

    fn kernel_first(&self) -> Option<bool> {
        match (&self.user_head, &self.kernel_head) {
            (None, None) => None,
            (Some(_), None) => Some(false),
            (None, Some(_)) => Some(true),
            (Some((u, _)), Some((k, _))) => {
                let u_key = (u.timestamp, task_rank(u.kind));
                let k_key = (k.timestamp, task_rank(k.kind));
                Some(k_key < u_key)
            }
        }
    }

    /// Next event of this task in per-task order, with its record index.
    fn pop(&mut self) -> Option<(Event, usize)> {
        if self.kernel_first()? {
            let next = read_head(&mut self.kernel);
            std::mem::replace(&mut self.kernel_head, next)
        } else {
            let next = read_head(&mut self.user);
            std::mem::replace(&mut self.user_head, next)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    timestamp: u64,
    rank: u8,
    task_id: u32,
}

struct TaskSlot {
    cursor: TaskCursor,
    head: Option<Event>,
    parent: Option<u32>,
    creation_time: u64,
    released: bool,
}

/// Single-pass iterator over the merged timeline of one session.
pub struct Merger<'a> {
    session: &'a Session,
    slots: BTreeMap<u32, TaskSlot>,
    heap: BinaryHeap<Reverse<HeapKey>>,
    /// Children waiting for their parent, keyed by parent task id.
    gated: BTreeMap<u32, Vec<u32>>,
}

impl<'a> Merger<'a> {
    pub fn new(session: &'a Session, options: &MergeOptions) -> Self {
        let selected: BTreeMap<u32, &Task> = session
            .tasks()
            .filter(|t| options.tids.is_empty() || options.tids.contains(&t.tid))
            .map(|t| (t.task_id, t))
            .collect();

        let mut merger = Self {
            session,
            slots: BTreeMap::new(),
            heap: BinaryHeap::new(),
            gated: BTreeMap::new(),
        };
        for (task_id, task) in &selected {
            let parent = task.parent_task_id.filter(|p| selected.contains_key(p));
            merger.slots.insert(
                *task_id,
                TaskSlot {
                    cursor: TaskCursor::open(task, options.follow),
                    head: None,
                    parent,
                    creation_time: task.creation_time,
                    released: false,
                },
            );
            if let Some(parent) = parent {
                merger.gated.entry(parent).or_default().push(*task_id);
            }
        }

        let roots: Vec<u32> = merger
            .slots
            .iter()
            .filter(|(_, slot)| slot.parent.is_none())
            .map(|(id, _)| *id)
            .collect();
        for task_id in roots {
            merger.release(task_id);
        }
        debug!(
            "merging {} tasks, {} held back behind their parent",
            merger.slots.len(),
            merger.gated.values().map(Vec::len).sum::<usize>()
        );
        merger
    }

    /// Pull the next valid event of `task_id` into its slot and the heap.
    fn advance(&mut self, task_id: u32) {
        let Some(slot) = self.slots.get_mut(&task_id) else {
            return;
        };
        slot.head = None;
        while let Some((event, record)) = slot.cursor.pop() {
            if event.task_id == task_id {
                self.heap.push(Reverse(HeapKey {
                    timestamp: event.timestamp,
                    rank: event.kind.tie_rank(),
                    task_id,
                }));
                slot.head = Some(event);
                break;
            }
            if self.session.task(event.task_id).is_none() {
                warn!(
                    "{}",
                    TraceError::UnknownTask {
                        task_id: event.task_id,
                        record,
                    }
                );
            } else {
                warn!(
                    "{}",
                    TraceError::corrupt(
                        Some(task_id),
                        Some(record),
                        format!("event of task {} in the wrong stream, dropped", event.task_id),
                    )
                );
            }
        }
        self.release_children(task_id);
    }

    fn release(&mut self, task_id: u32) {
        if let Some(slot) = self.slots.get_mut(&task_id) {
            if slot.released {
                return;
            }
            slot.released = true;
        }
        self.advance(task_id);
    }

    /// Release the children whose creation time the parent has passed.
    fn release_children(&mut self, parent: u32) {
        let Some(waiting) = self.gated.get(&parent) else {
            return;
        };
        let parent_head = self
            .slots
            .get(&parent)
            .and_then(|slot| slot.head.as_ref())
            .map(|e| e.timestamp);
        let (ready, still_waiting): (Vec<u32>, Vec<u32>) =
            waiting.iter().copied().partition(|child| {
                let created = self.slots.get(child).map_or(0, |s| s.creation_time);
                parent_head.map_or(true, |ts| ts >= created)
            });
        if still_waiting.is_empty() {
            self.gated.remove(&parent);
        } else {
            self.gated.insert(parent, still_waiting);
        }
        for child in ready {
            debug!("releasing task {} behind parent {}", child, parent);
            self.release(child);
        }
    }
}

impl Iterator for Merger<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            if let Some(Reverse(key)) = self.heap.pop() {
                let event = self
                    .slots
                    .get_mut(&key.task_id)
                    .and_then(|slot| slot.head.take());
                self.advance(key.task_id);
                return event;
            }
            if self.gated.is_empty() {
                return None;
            }
            // Nothing left that could release the waiting tasks.
            let stranded: Vec<u32> = std::mem::take(&mut self.gated)
                .into_values()
                .flatten()
                .collect();
            warn!(
                "{}",
                TraceError::corrupt(
                    None,
                    None,
                    format!("tasks {stranded:?} wait on a parent that never ran, releasing them"),
                )
            );
            for task_id in stranded {
                self.release(task_id);
            }
        }
    }
}

/// Merge a whole session.
pub fn merge<'a>(session: &'a Session, options: &MergeOptions) -> Merger<'a> {
    Merger::new(session, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use crate::session::stream::{encode_end, encode_event};
    use crate::session::writer::stream_path;
    use crate::session::{RegistryRecord, SessionInfo, SessionWriter};
    use tempfile::TempDir;

    fn record(
        writer: &mut SessionWriter,
        task_id: u32,
        tid: i32,
        created: u64,
        parent: Option<u32>,
        events: &[(EventKind, u64, &str)],
    ) {
        let mut rec = RegistryRecord::new(task_id, tid, created, "sid");
        if let Some(parent) = parent {
            rec = rec.with_parent(parent);
        }
        writer.add_task(&rec).unwrap();
        let mut last = created;
        for (kind, ts, name) in events {
            let event = Event::new(task_id, *kind, *ts, name);
            if kind.is_kernel() {
                writer.write_kernel_event(&event).unwrap();
            } else {
                writer.write_event(&event).unwrap();
            }
            last = *ts;
        }
        writer.end_task(task_id, last).unwrap();
    }

    fn merged(dir: &Path, options: &MergeOptions) -> Vec<(u32, u64, String)> {
        let session = Collector::ingest_dir(dir).unwrap();
        merge(&session, options)
            .map(|e| (e.task_id, e.timestamp, e.function_ref))
            .collect()
    }

    #[test]
    fn test_timestamp_order_across_tasks() {
        let dir = TempDir::new().unwrap();
        let mut writer = SessionWriter::create(dir.path(), SessionInfo::new("t", "now")).unwrap();
        record(&mut writer, 1, 100, 0, None, &[
            (EventKind::Entry, 10, "a"),
            (EventKind::Exit, 40, "a"),
        ]);
        record(&mut writer, 2, 200, 0, None, &[
            (EventKind::Entry, 20, "b"),
            (EventKind::Exit, 30, "b"),
        ]);
        writer.finish().unwrap();

        let ts: Vec<u64> = merged(dir.path(), &MergeOptions::default())
            .into_iter()
            .map(|(_, ts, _)| ts)
            .collect();
        assert_eq!(ts, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_exit_before_entry_at_equal_timestamps() {
        let dir = TempDir::new().unwrap();
        let mut writer = SessionWriter::create(dir.path(), SessionInfo::new("t", "now")).unwrap();
        record(&mut writer, 1, 100, 0, None, &[
            (EventKind::Entry, 5, "outer"),
            (EventKind::Entry, 10, "next"),
            (EventKind::Exit, 11, "next"),
            (EventKind::Exit, 12, "outer"),
        ]);
        record(&mut writer, 2, 200, 0, None, &[
            (EventKind::Entry, 1, "work"),
            (EventKind::Exit, 10, "work"),
        ]);
        writer.finish().unwrap();

        let events = merged(dir.path(), &MergeOptions::default());
        let at_ten: Vec<_> = events.iter().filter(|(_, ts, _)| *ts == 10).collect();
        assert_eq!(at_ten[0].2, "work");
        assert_eq!(at_ten[1].2, "next");
    }

    #[test]
    fn test_task_id_breaks_full_ties() {
        let dir = TempDir::new().unwrap();
        let mut writer = SessionWriter::create(dir.path(), SessionInfo::new("t", "now")).unwrap();
        record(&mut writer, 2, 200, 0, None, &[(EventKind::Entry, 10, "x")]);
        record(&mut writer, 1, 100, 0, None, &[(EventKind::Entry, 10, "y")]);
        writer.finish().unwrap();

        let ids: Vec<u32> = merged(dir.path(), &MergeOptions::default())
            .into_iter()
            .map(|(id, _, _)| id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_kernel_events_nest_inside_user_frames() {
        let dir = TempDir::new().unwrap();
        let mut writer = SessionWriter::create(dir.path(), SessionInfo::new("t", "now")).unwrap();
        record(&mut writer, 1, 100, 0, None, &[
            (EventKind::Entry, 10, "fopen"),
            (EventKind::KernelEntry, 10, "sys_open"),
            (EventKind::KernelExit, 20, "sys_open"),
            (EventKind::Exit, 20, "fopen"),
        ]);
        writer.finish().unwrap();

        let names: Vec<String> = merged(dir.path(), &MergeOptions::default())
            .into_iter()
            .map(|(_, _, name)| name)
            .collect();
        assert_eq!(names, vec!["fopen", "sys_open", "sys_open", "fopen"]);
    }

    #[test]
    fn test_child_waits_for_parent_call_site() {
        let dir = TempDir::new().unwrap();
        let mut writer = SessionWriter::create(dir.path(), SessionInfo::new("t", "now")).unwrap();
        record(&mut writer, 1, 100, 0, None, &[
            (EventKind::Entry, 10, "main"),
            (EventKind::Entry, 20, "fork"),
            (EventKind::Exit, 50, "fork"),
            (EventKind::Exit, 60, "main"),
        ]);
        // The child clock runs slightly behind the parent's.
        record(&mut writer, 2, 101, 30, Some(1), &[
            (EventKind::Exit, 5, "fork"),
            (EventKind::Entry, 40, "child"),
            (EventKind::Exit, 45, "child"),
        ]);
        writer.finish().unwrap();

        let events = merged(dir.path(), &MergeOptions::default());
        let first_child = events.iter().position(|(id, _, _)| *id == 2).unwrap();
        let fork_entry = events
            .iter()
            .position(|(id, ts, _)| *id == 1 && *ts == 20)
            .unwrap();
        assert!(fork_entry < first_child);
        assert_eq!(events.len(), 7);
    }

    #[test]
    fn test_tasks_without_a_root_are_still_merged() {
        let dir = TempDir::new().unwrap();
        let mut writer = SessionWriter::create(dir.path(), SessionInfo::new("t", "now")).unwrap();
        record(&mut writer, 1, 100, 0, None, &[
            (EventKind::Entry, 10, "a"),
            (EventKind::Exit, 20, "a"),
        ]);
        record(&mut writer, 2, 200, 0, None, &[
            (EventKind::Entry, 15, "b"),
            (EventKind::Exit, 25, "b"),
        ]);
        writer.finish().unwrap();

        let mut session = Collector::ingest_dir(dir.path()).unwrap();
        for (task_id, parent) in [(1, 2), (2, 1)] {
            if let Some(task) = session.tasks.get_mut(&task_id) {
                task.parent_task_id = Some(parent);
            }
        }
        let ts: Vec<u64> = merge(&session, &MergeOptions::default())
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(ts, vec![10, 15, 20, 25]);
    }

    #[test]
    fn test_tid_filter() {
        let dir = TempDir::new().unwrap();
        let mut writer = SessionWriter::create(dir.path(), SessionInfo::new("t", "now")).unwrap();
        record(&mut writer, 1, 100, 0, None, &[(EventKind::Entry, 10, "a")]);
        record(&mut writer, 2, 200, 0, None, &[(EventKind::Entry, 20, "b")]);
        writer.finish().unwrap();

        let options = MergeOptions {
            tids: vec![200],
            ..Default::default()
        };
        let events = merged(dir.path(), &options);
        assert_eq!(events, vec![(2, 20, "b".to_string())]);
    }

    #[test]
    fn test_foreign_events_are_dropped() {
        let dir = TempDir::new().unwrap();
        let mut writer = SessionWriter::create(dir.path(), SessionInfo::new("t", "now")).unwrap();
        writer.add_task(&RegistryRecord::new(1, 100, 0, "sid")).unwrap();
        writer.finish().unwrap();

        // Task 1's stream carries a record that claims to be task 7.
        let lines = [
            encode_event(&Event::new(1, EventKind::Entry, 1, "a")).unwrap(),
            encode_event(&Event::new(7, EventKind::Entry, 2, "ghost")).unwrap(),
            encode_event(&Event::new(1, EventKind::Exit, 3, "a")).unwrap(),
            encode_end(4),
        ];
        std::fs::write(stream_path(dir.path(), 1), lines.join("\n") + "\n").unwrap();

        let names: Vec<String> = merged(dir.path(), &MergeOptions::default())
            .into_iter()
            .map(|(_, _, name)| name)
            .collect();
        assert_eq!(names, vec!["a", "a"]);
    }
}
