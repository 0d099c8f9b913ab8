//! Session collector.
//!
//! Turns a source (a directory already written by a recorder, or a live
//! connection from a remote recorder) into a validated, closed [`Session`].
//! Per-task problems are logged and the task is dropped or flagged; only
//! problems with the session as a whole (no directory, no metadata, no
//! registry) fail ingestion.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::error::TraceError;
use crate::net::receiver::{Connection, RegistryTable};
use crate::session::stream::probe_tail;
use crate::session::{Registry, Session, SessionInfo};
use crate::trace::constants::{NET_READ_TIMEOUT, STREAM_FILE_RE};
use crate::trace::{StreamState, Task};

/// Where a session comes from.
pub enum Source {
    /// A session directory on disk.
    Local(PathBuf),
    /// A connection from a remote recorder; the session is materialized
    /// under `dest` before it is validated.
    Network { stream: TcpStream, dest: PathBuf },
}

#[derive(Default)]
struct StreamFiles {
    user: Option<PathBuf>,
    kernel: Option<PathBuf>,
}

fn scan_streams(dir: &Path) -> Result<BTreeMap<u32, StreamFiles>> {
    let mut streams: BTreeMap<u32, StreamFiles> = BTreeMap::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(caps) = STREAM_FILE_RE.captures(name) else {
            continue;
        };
        let Ok(task_id) = caps[1].parse::<u32>() else {
            warn!("ignoring stream file with out of range task id: {}", name);
            continue;
        };
        let files = streams.entry(task_id).or_default();
        if caps.get(2).is_some() {
            files.kernel = Some(entry.path());
        } else {
            files.user = Some(entry.path());
        }
    }
    Ok(streams)
}

fn stream_state(task_id: u32, files: &StreamFiles) -> StreamState {
    let Some(path) = files.user.as_ref().or(files.kernel.as_ref()) else {
        return StreamState::Missing;
    };
    match probe_tail(path) {
        Ok(state) => state,
        Err(err) => {
            warn!("task {}: cannot inspect {}: {:#}", task_id, path.display(), err);
            StreamState::Truncated
        }
    }
}

/// Clear the parent link of any task whose ancestor chain leads back to
/// itself. Without a root such tasks would never be released by the merger.
fn break_parent_cycles(tasks: &mut BTreeMap<u32, Task>) {
    let ids: Vec<u32> = tasks.keys().copied().collect();
    for task_id in ids {
        let mut seen = BTreeSet::new();
        let mut cursor = tasks.get(&task_id).and_then(|t| t.parent_task_id);
        while let Some(ancestor) = cursor {
            if ancestor == task_id {
                warn!(
                    "{}",
                    TraceError::corrupt(
                        Some(task_id),
                        None,
                        "parent links form a cycle, treating as root"
                    )
                );
                if let Some(task) = tasks.get_mut(&task_id) {
                    task.parent_task_id = None;
                }
                break;
            }
            if !seen.insert(ancestor) {
                break;
            }
            cursor = tasks.get(&ancestor).and_then(|t| t.parent_task_id);
        }
    }
}

pub struct Collector;

impl Collector {
    pub fn ingest(source: Source) -> Result<Session> {
        match source {
            Source::Local(dir) => Self::ingest_dir(&dir),
            Source::Network { stream, dest } => {
                let peer = stream
                    .peer_addr()
                    .map_or_else(|_| "unknown".to_string(), |a| a.to_string());
                stream.set_read_timeout(Some(NET_READ_TIMEOUT))?;
                let mut conn = Connection::new(stream, &peer, &dest, Arc::new(RegistryTable::default()));
                match conn.receive_session()? {
                    Some(dir) => Self::ingest_dir(&dir),
                    None => bail!("{} closed the connection before a session started", peer),
                }
            }
        }
    }

    /// Validate a session directory and build the task table.
    pub fn ingest_dir(dir: &Path) -> Result<Session> {
        if !dir.is_dir() {
            bail!("session directory {} not found", dir.display());
        }
        let info = SessionInfo::load(dir)?;
        let registry = Registry::load(dir)?;
        let mut streams = scan_streams(dir)?;

        let mut dropped_tasks = Vec::new();
        let orphans: Vec<u32> = streams
            .keys()
            .filter(|id| !registry.tasks.contains_key(id))
            .copied()
            .collect();
        for task_id in orphans {
            warn!(
                "{}",
                TraceError::corrupt(
                    Some(task_id),
                    None,
                    "stream has no registry entry, dropping task"
                )
            );
            streams.remove(&task_id);
            dropped_tasks.push(task_id);
        }

        let mut tasks = BTreeMap::new();
        for (task_id, record) in &registry.tasks {
            let files = streams.remove(task_id).unwrap_or_default();
            let state = stream_state(*task_id, &files);
            match state {
                StreamState::Missing => debug!("task {} has no stream", task_id),
                StreamState::Open | StreamState::Truncated => {
                    info!("task {} stream is incomplete ({})", task_id, state.as_str())
                }
                StreamState::Closed => {}
            }

            let mut parent_task_id = record.parent_task_id;
            if let Some(parent) = parent_task_id {
                if parent == *task_id || !registry.tasks.contains_key(&parent) {
                    warn!(
                        "{}",
                        TraceError::corrupt(
                            Some(*task_id),
                            None,
                            format!("unknown parent task {parent}, treating as root"),
                        )
                    );
                    parent_task_id = None;
                }
            }

            tasks.insert(
                *task_id,
                Task {
                    task_id: *task_id,
                    parent_task_id,
                    pid: record.pid,
                    tid: record.tid,
                    creation_time: record.timestamp,
                    session_id: record.session_id.clone(),
                    exename: record.exename.clone(),
                    state,
                    stream: files.user,
                    kernel_stream: files.kernel,
                },
            );
        }

        break_parent_cycles(&mut tasks);

        let session = Session {
            dir: dir.to_path_buf(),
            info,
            tasks,
            dropped_tasks,
        };
        if session.incomplete() {
            info!("session {} is incomplete", dir.display());
        }
        debug!(
            "ingested session {} with {} tasks",
            dir.display(),
            session.tasks.len()
        );
        Ok(session)
    }

    /// Ingest a session and every nested child session below it.
    pub fn ingest_tree(dir: &Path) -> Result<Vec<Session>> {
        let root = Self::ingest_dir(dir)?;
        let mut sessions = Vec::new();
        for child in root.child_dirs() {
            match Self::ingest_tree(&child) {
                Ok(children) => sessions.extend(children),
                Err(err) => warn!("skipping child session {}: {:#}", child.display(), err),
            }
        }
        sessions.insert(0, root);
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::writer::stream_path;
    use crate::session::{RegistryRecord, SessionWriter};
    use crate::trace::{Event, EventKind};
    use tempfile::TempDir;

    fn sample_session(dir: &Path) -> SessionWriter {
        let info = SessionInfo::new("t-abc", "now");
        let sid = info.session_id.clone();
        let mut writer = SessionWriter::create(dir, info).unwrap();
        writer.add_task(&RegistryRecord::new(1, 4131, 1, &sid)).unwrap();
        writer
            .write_event(&Event::new(1, EventKind::Entry, 10, "main"))
            .unwrap();
        writer
            .write_event(&Event::new(1, EventKind::Exit, 20, "main"))
            .unwrap();
        writer.end_task(1, 30).unwrap();
        writer
    }

    #[test]
    fn test_ingest_local() {
        let dir = TempDir::new().unwrap();
        sample_session(dir.path()).finish().unwrap();

        let session = Collector::ingest(Source::Local(dir.path().to_path_buf())).unwrap();
        assert_eq!(session.tasks.len(), 1);
        let task = session.task(1).unwrap();
        assert_eq!(task.tid, 4131);
        assert_eq!(task.state, StreamState::Closed);
        assert!(!session.incomplete());
    }

    #[test]
    fn test_stream_without_registry_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mut writer = sample_session(dir.path());
        writer
            .write_event(&Event::new(9, EventKind::Entry, 10, "stray"))
            .unwrap();
        writer.finish().unwrap();

        let session = Collector::ingest_dir(dir.path()).unwrap();
        assert_eq!(session.tasks.len(), 1);
        assert_eq!(session.dropped_tasks, vec![9]);
    }

    #[test]
    fn test_truncated_task_marks_session_incomplete() {
        let dir = TempDir::new().unwrap();
        let mut writer = sample_session(dir.path());
        writer.add_task(&RegistryRecord::new(2, 4132, 2, "sid")).unwrap();
        writer.finish().unwrap();
        std::fs::write(stream_path(dir.path(), 2), "{\"ts\":1,\"kind\":\"ent").unwrap();

        let session = Collector::ingest_dir(dir.path()).unwrap();
        assert_eq!(session.task(2).unwrap().state, StreamState::Truncated);
        assert!(session.incomplete());
    }

    #[test]
    fn test_parent_cycle_is_broken() {
        let dir = TempDir::new().unwrap();
        let mut writer = sample_session(dir.path());
        for (task_id, parent) in [(2, 3), (3, 2)] {
            let record = RegistryRecord::new(task_id, 4130 + task_id as i32, 5, "sid");
            writer.add_task(&record.with_parent(parent)).unwrap();
            writer
                .write_event(&Event::new(task_id, EventKind::Entry, 10, "spin"))
                .unwrap();
            writer.end_task(task_id, 10).unwrap();
        }
        writer.finish().unwrap();

        let session = Collector::ingest_dir(dir.path()).unwrap();
        // The lower id becomes the root, the other stays its child.
        assert_eq!(session.task(2).unwrap().parent_task_id, None);
        assert_eq!(session.task(3).unwrap().parent_task_id, Some(2));
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        assert!(Collector::ingest_dir(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_missing_registry_is_fatal() {
        let dir = TempDir::new().unwrap();
        SessionInfo::new("x", "now").store(dir.path()).unwrap();
        assert!(Collector::ingest_dir(dir.path()).is_err());
    }

    #[test]
    fn test_ingest_tree_includes_children() {
        let dir = TempDir::new().unwrap();
        let mut writer = sample_session(dir.path());
        let child = writer
            .add_child_session("child", SessionInfo::new("t-child", "now"))
            .unwrap();
        child.finish().unwrap();
        writer.finish().unwrap();

        let sessions = Collector::ingest_tree(dir.path()).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].info.command_line, "t-child");
    }
}
