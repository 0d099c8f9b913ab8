//! Task registry (`task.txt`).
//!
//! One line per record, a tag followed by `key=value` fields:
//!
//! ```text
//! SESS timestamp=1000 task=1 pid=4131 tgid=4131 parent=- sid=9a3f... exename="/usr/bin/t-abc"
//! ```
//!
//! Older recorders wrote the thread id as `tid=` instead of `pid=`. Both
//! spellings are folded into [`RegistryRecord::tid`] here so nothing past
//! ingestion needs to care.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::error::TraceError;
use crate::trace::constants::REGISTRY_FILE;

/// A normalized SESS record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryRecord {
    pub task_id: u32,
    pub tid: i32,
    pub pid: i32,
    pub parent_task_id: Option<u32>,
    /// Creation time in nanoseconds.
    pub timestamp: u64,
    pub session_id: String,
    pub exename: Option<String>,
}

impl RegistryRecord {
    pub fn new(task_id: u32, tid: i32, timestamp: u64, session_id: &str) -> Self {
        Self {
            task_id,
            tid,
            pid: tid,
            parent_task_id: None,
            timestamp,
            session_id: session_id.to_string(),
            exename: None,
        }
    }

    pub fn with_parent(mut self, parent_task_id: u32) -> Self {
        self.parent_task_id = Some(parent_task_id);
        self
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_exename(mut self, exename: &str) -> Self {
        self.exename = Some(exename.to_string());
        self
    }

    /// Serialize as a registry line (without the trailing newline).
    pub fn to_line(&self) -> String {
        let parent = self
            .parent_task_id
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        let mut line = format!(
            "SESS timestamp={} task={} pid={} tgid={} parent={} sid={}",
            self.timestamp, self.task_id, self.tid, self.pid, parent, self.session_id
        );
        if let Some(exename) = &self.exename {
            line.push_str(&format!(" exename=\"{exename}\""));
        }
        line
    }
}

/// Result of parsing one registry line.
#[derive(Debug, PartialEq, Eq)]
pub enum RegistryLine {
    Sess(RegistryRecord),
    /// A record tag this version does not use (TASK, FORK, DLOP, ...).
    Other(String),
    Blank,
}

/// Split `TAG k=v k="quoted v"` into the tag and its fields.
fn tokenize(line: &str) -> Option<(&str, HashMap<&str, String>)> {
    let line = line.trim();
    let (tag, mut rest) = match line.split_once(char::is_whitespace) {
        Some((tag, rest)) => (tag, rest.trim_start()),
        None => (line, ""),
    };

    let mut fields = HashMap::new();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let key = key.trim();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"')?;
            (quoted[..end].to_string(), &quoted[end + 1..])
        } else {
            match after.split_once(char::is_whitespace) {
                Some((value, remaining)) => (value.to_string(), remaining),
                None => (after.to_string(), ""),
            }
        };
        fields.insert(key, value);
        rest = remaining.trim_start();
    }
    Some((tag, fields))
}

/// Parse `ns` or `sec.nsec` timestamps.
fn parse_timestamp(value: &str) -> Option<u64> {
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    match value.split_once('.') {
        Some((sec, nsec)) => {
            if !digits(sec) || !digits(nsec) || nsec.len() > 9 {
                return None;
            }
            let sec: u64 = sec.parse().ok()?;
            let scale = 10u64.pow(9 - nsec.len() as u32);
            let nsec: u64 = nsec.parse().ok()?;
            sec.checked_mul(1_000_000_000)?.checked_add(nsec * scale)
        }
        None if digits(value) => value.parse().ok(),
        None => None,
    }
}

pub fn parse_line(line: &str, lineno: usize) -> Result<RegistryLine, TraceError> {
    if line.trim().is_empty() {
        return Ok(RegistryLine::Blank);
    }
    let corrupt = |task_id: Option<u32>, msg: String| TraceError::corrupt(task_id, Some(lineno), msg);

    let (tag, fields) =
        tokenize(line).ok_or_else(|| corrupt(None, format!("unparsable registry line {line:?}")))?;
    if tag != "SESS" {
        return Ok(RegistryLine::Other(tag.to_string()));
    }

    let task_id: u32 = fields
        .get("task")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| corrupt(None, "SESS record without a valid task id".to_string()))?;

    let parse_id = |key: &str| -> Result<Option<i32>, TraceError> {
        match fields.get(key) {
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| corrupt(Some(task_id), format!("invalid {key}={v}"))),
            None => Ok(None),
        }
    };
    let tid = match (parse_id("pid")?, parse_id("tid")?) {
        (Some(pid), Some(tid)) if pid != tid => {
            return Err(corrupt(
                Some(task_id),
                format!("conflicting pid={pid} and tid={tid}"),
            ))
        }
        (Some(id), _) | (None, Some(id)) => id,
        (None, None) => {
            return Err(corrupt(Some(task_id), "SESS record without pid/tid".to_string()));
        }
    };
    let pid = parse_id("tgid")?.unwrap_or(tid);

    let parent_task_id = match fields.get("parent").map(String::as_str) {
        None | Some("-") | Some("") => None,
        Some(v) => Some(
            v.parse()
                .map_err(|_| corrupt(Some(task_id), format!("invalid parent={v}")))?,
        ),
    };

    let timestamp = match fields.get("timestamp") {
        Some(v) => parse_timestamp(v)
            .ok_or_else(|| corrupt(Some(task_id), format!("invalid timestamp={v}")))?,
        None => return Err(corrupt(Some(task_id), "SESS record without timestamp".to_string())),
    };

    Ok(RegistryLine::Sess(RegistryRecord {
        task_id,
        tid,
        pid,
        parent_task_id,
        timestamp,
        session_id: fields.get("sid").cloned().unwrap_or_default(),
        exename: fields.get("exename").cloned(),
    }))
}

/// Normalize a raw line: parse it and re-serialize SESS records in the
/// canonical spelling. Other record tags are kept verbatim.
pub fn normalize_line(line: &str, lineno: usize) -> Result<Option<String>, TraceError> {
    match parse_line(line, lineno)? {
        RegistryLine::Sess(record) => Ok(Some(record.to_line())),
        RegistryLine::Other(_) => Ok(Some(line.trim_end().to_string())),
        RegistryLine::Blank => Ok(None),
    }
}

/// Registry contents keyed by task id.
#[derive(Debug, Default)]
pub struct Registry {
    pub tasks: BTreeMap<u32, RegistryRecord>,
    /// Number of malformed records that were skipped.
    pub skipped: usize,
}

impl Registry {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(REGISTRY_FILE);
        let buf = fs::read_to_string(&path)
            .with_context(|| format!("failed to read task registry {}", path.display()))?;
        Ok(Self::parse(&buf))
    }

    pub fn parse(buf: &str) -> Self {
        let mut registry = Registry::default();
        for (lineno, line) in buf.lines().enumerate() {
            match parse_line(line, lineno) {
                Ok(RegistryLine::Sess(record)) => {
                    if registry.tasks.contains_key(&record.task_id) {
                        debug!(
                            "duplicate SESS record for task {} at line {}, keeping the first",
                            record.task_id, lineno
                        );
                        continue;
                    }
                    registry.tasks.insert(record.task_id, record);
                }
                Ok(RegistryLine::Other(tag)) => {
                    debug!("skipping registry record {} at line {}", tag, lineno);
                }
                Ok(RegistryLine::Blank) => {}
                Err(err) => {
                    warn!("{}", err);
                    registry.skipped += 1;
                }
            }
        }
        registry
    }
}

/// Append-only registry writer.
///
/// Several writers (local recorder threads, receiver connections from more
/// than one host) may share one registry; each record is written as a single
/// `write_all` under the lock so lines never interleave.
#[derive(Debug)]
pub struct RegistryWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl RegistryWriter {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(REGISTRY_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open task registry {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &RegistryRecord) -> Result<()> {
        self.append_line(&record.to_line())
    }

    pub fn append_line(&self, line: &str) -> Result<()> {
        let mut buf = line.trim_end().as_bytes().to_vec();
        buf.push(b'\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("registry writer lock poisoned"))?;
        file.write_all(&buf)
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.flush()?;
        Ok(())
    }
}
