//! Session directory model.
//!
//! A session directory holds one recording:
//!
//! - `info`: metadata ([`SessionInfo`])
//! - `task.txt`: the task registry ([`registry`])
//! - `<task_id>.dat` / `<task_id>.kernel.dat`: task streams ([`stream`])
//! - optional subdirectories for nested child sessions
//!
//! A [`Session`] is only ever built by the collector and is read-only from
//! then on, so any number of replays may share it.

pub mod info;
pub mod registry;
pub mod stream;
pub mod writer;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use info::SessionInfo;
pub use registry::{Registry, RegistryRecord, RegistryWriter};
pub use stream::StreamReader;
pub use writer::SessionWriter;

use crate::trace::Task;

#[derive(Clone, Debug)]
pub struct Session {
    pub dir: PathBuf,
    pub info: SessionInfo,
    pub tasks: BTreeMap<u32, Task>,
    /// Task ids that had streams but were dropped during validation.
    pub dropped_tasks: Vec<u32>,
}

impl Session {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn task(&self, task_id: u32) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// A session is incomplete when the recorder said so or any task stream
    /// did not end with its end marker.
    pub fn incomplete(&self) -> bool {
        self.info.incomplete || self.tasks.values().any(|t| t.incomplete())
    }

    /// Directories of nested child sessions that exist on disk.
    pub fn child_dirs(&self) -> Vec<PathBuf> {
        self.info
            .child_sessions
            .iter()
            .map(|name| self.dir.join(name))
            .filter(|path| path.is_dir())
            .collect()
    }
}
