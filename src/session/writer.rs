//! Session directory writer.
//!
//! This is the producer side of the session layout: instrumentation glue (or a
//! test) feeds it registry records and events and it lays out the `info`,
//! `task.txt` and per-task stream files the collector expects.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::info::SessionInfo;
use super::registry::{RegistryRecord, RegistryWriter};
use super::stream::{encode_end, encode_event};
use crate::trace::constants::{KERNEL_STREAM_SUFFIX, STREAM_EXT};
use crate::trace::Event;

/// Path of a task's user stream.
pub fn stream_path(dir: &Path, task_id: u32) -> PathBuf {
    dir.join(format!("{task_id}.{STREAM_EXT}"))
}

/// Path of a task's kernel stream.
pub fn kernel_stream_path(dir: &Path, task_id: u32) -> PathBuf {
    dir.join(format!("{task_id}.{KERNEL_STREAM_SUFFIX}"))
}

pub struct SessionWriter {
    dir: PathBuf,
    info: SessionInfo,
    registry: RegistryWriter,
    // (task_id, kernel) -> open stream
    streams: BTreeMap<(u32, bool), BufWriter<File>>,
}

impl SessionWriter {
    pub fn create(dir: &Path, info: SessionInfo) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create session directory {}", dir.display()))?;
        info.store(dir)?;
        let registry = RegistryWriter::open(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            info,
            registry,
            streams: BTreeMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn add_task(&mut self, record: &RegistryRecord) -> Result<()> {
        self.registry.append(record)
    }

    fn stream(&mut self, task_id: u32, kernel: bool) -> Result<&mut BufWriter<File>> {
        if !self.streams.contains_key(&(task_id, kernel)) {
            let path = if kernel {
                kernel_stream_path(&self.dir, task_id)
            } else {
                stream_path(&self.dir, task_id)
            };
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open stream {}", path.display()))?;
            self.streams.insert((task_id, kernel), BufWriter::new(file));
        }
        self.streams
            .get_mut(&(task_id, kernel))
            .ok_or_else(|| anyhow::anyhow!("stream for task {task_id} vanished"))
    }

    /// Append an event to its task's stream.
    pub fn write_event(&mut self, event: &Event) -> Result<()> {
        let line = encode_event(event)?;
        let stream = self.stream(event.task_id, false)?;
        writeln!(stream, "{line}")?;
        Ok(())
    }

    /// Append an event to its task's separate kernel stream.
    pub fn write_kernel_event(&mut self, event: &Event) -> Result<()> {
        let line = encode_event(event)?;
        let stream = self.stream(event.task_id, true)?;
        writeln!(stream, "{line}")?;
        Ok(())
    }

    /// Write the end marker for a task, closing its streams.
    pub fn end_task(&mut self, task_id: u32, timestamp: u64) -> Result<()> {
        let stream = self.stream(task_id, false)?;
        writeln!(stream, "{}", encode_end(timestamp))?;
        stream.flush()?;
        self.streams.remove(&(task_id, false));
        if let Some(mut kernel) = self.streams.remove(&(task_id, true)) {
            writeln!(kernel, "{}", encode_end(timestamp))?;
            kernel.flush()?;
        }
        Ok(())
    }

    /// Create a nested session in a subdirectory and record it in this
    /// session's metadata.
    pub fn add_child_session(&mut self, name: &str, info: SessionInfo) -> Result<SessionWriter> {
        let child = SessionWriter::create(&self.dir.join(name), info)?;
        self.info.add_child_session(name);
        self.info.store(&self.dir)?;
        Ok(child)
    }

    pub fn set_exit_status(&mut self, status: i32) -> Result<()> {
        self.info.exit_status = Some(status);
        self.info.store(&self.dir)
    }

    pub fn flush(&mut self) -> Result<()> {
        for stream in self.streams.values_mut() {
            stream.flush()?;
        }
        Ok(())
    }

    /// Flush everything. Tasks that were never ended keep streams without an
    /// end marker.
    pub fn finish(mut self) -> Result<()> {
        self.flush()
    }
}
