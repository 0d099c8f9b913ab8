//! Helpers shared by the integration tests: session fixtures on disk and a
//! runner for the `calltree` binary.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use calltree::session::{RegistryRecord, SessionInfo, SessionWriter};
use calltree::trace::{Event, EventKind};

/// One registry entry: `(task_id, tid, parent_task_id, creation_time)`.
pub type TaskSpec = (u32, i32, Option<u32>, u64);

/// Write a complete session under `dir`. Every task gets an end marker at its
/// last event timestamp.
pub fn write_session(dir: &Path, tasks: &[TaskSpec], events: &[Event]) -> PathBuf {
    let mut writer =
        SessionWriter::create(dir, SessionInfo::new("t-abc", "Mon Oct 19 10:00:00 2026")).unwrap();
    add_tasks(&mut writer, tasks, events);
    for &(task_id, ..) in tasks {
        let last = events
            .iter()
            .filter(|e| e.task_id == task_id)
            .map(|e| e.timestamp)
            .max()
            .unwrap_or_default();
        writer.end_task(task_id, last).unwrap();
    }
    writer.finish().unwrap();
    dir.to_path_buf()
}

/// Register `tasks` and append `events` without ending any stream.
pub fn add_tasks(writer: &mut SessionWriter, tasks: &[TaskSpec], events: &[Event]) {
    let sid = writer.info().session_id.clone();
    for &(task_id, tid, parent, ts) in tasks {
        let mut record = RegistryRecord::new(task_id, tid, ts, &sid);
        if let Some(parent) = parent {
            record = record.with_parent(parent);
        }
        writer.add_task(&record).unwrap();
    }
    for event in events {
        writer.write_event(event).unwrap();
    }
}

pub fn entry(task_id: u32, ts: u64, name: &str) -> Event {
    Event::new(task_id, EventKind::Entry, ts, name)
}

pub fn exit(task_id: u32, ts: u64, name: &str) -> Event {
    Event::new(task_id, EventKind::Exit, ts, name)
}

/// `main -> a -> b -> c -> getpid`, with a..getpid shaped like the classic
/// `t-abc` test program.
pub fn abc(task_id: u32) -> Vec<Event> {
    vec![
        entry(task_id, 0, "main"),
        entry(task_id, 1_000, "a"),
        entry(task_id, 1_100, "b"),
        entry(task_id, 1_300, "c"),
        entry(task_id, 1_500, "getpid"),
        exit(task_id, 2_253, "getpid"),
        exit(task_id, 2_730, "c"),
        exit(task_id, 3_015, "b"),
        exit(task_id, 3_405, "a"),
        exit(task_id, 4_000, "main"),
    ]
}

pub fn abc_session(dir: &Path) -> PathBuf {
    write_session(dir, &[(1, 28141, None, 0)], &abc(1))
}

/// Run the binary and return stdout, panicking with stderr on failure.
pub fn calltree(args: &[&str]) -> String {
    let output = Command::new(env!("CARGO_BIN_EXE_calltree"))
        .args(args)
        .output()
        .expect("Failed to run calltree");
    if !output.status.success() {
        panic!(
            "calltree {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    String::from_utf8(output.stdout).expect("non-utf8 output")
}

/// Run the binary expecting failure, returning stderr.
pub fn calltree_err(args: &[&str]) -> String {
    let output = Command::new(env!("CARGO_BIN_EXE_calltree"))
        .args(args)
        .output()
        .expect("Failed to run calltree");
    assert!(!output.status.success(), "calltree {args:?} unexpectedly succeeded");
    String::from_utf8_lossy(&output.stderr).to_string()
}
