//! Trace data model shared by the collector, merger and replayer.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::constants::EVENT_NAME_RE;

/// What a single event records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Entry,
    Exit,
    KernelEntry,
    KernelExit,
    /// Point-in-time fact (scheduler transition, task exit) with no matching exit.
    EventMark,
}

impl EventKind {
    pub fn is_entry(self) -> bool {
        matches!(self, EventKind::Entry | EventKind::KernelEntry)
    }

    pub fn is_exit(self) -> bool {
        matches!(self, EventKind::Exit | EventKind::KernelExit)
    }

    pub fn is_kernel(self) -> bool {
        matches!(self, EventKind::KernelEntry | EventKind::KernelExit)
    }

    /// Ordering rank used when two different tasks have events at the same
    /// timestamp: exits first so a child close shows before the parent resumes.
    pub fn tie_rank(self) -> u8 {
        match self {
            EventKind::Exit | EventKind::KernelExit => 0,
            EventKind::EventMark => 1,
            EventKind::Entry | EventKind::KernelEntry => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Entry => "entry",
            EventKind::Exit => "exit",
            EventKind::KernelEntry => "kernel-entry",
            EventKind::KernelExit => "kernel-exit",
            EventKind::EventMark => "event",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured argument or return value, tagged with how it was captured.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    Int(i64),
    Uint(u64),
    Ptr(u64),
    Str(String),
    Float(f64),
}

/// Display override requested by a capture selector (`arg1/x`, `retval/s`...).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgFormat {
    #[default]
    Auto,
    Decimal,
    Hex,
    String,
    Pointer,
}

impl ArgFormat {
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "d" | "i" => Some(ArgFormat::Decimal),
            "x" => Some(ArgFormat::Hex),
            "s" => Some(ArgFormat::String),
            "p" => Some(ArgFormat::Pointer),
            _ => None,
        }
    }
}

impl ArgValue {
    /// Render the value for text output.
    ///
    /// Strings are quoted unless the selector explicitly asked for `/s`, which
    /// is what script hooks see as well.
    pub fn render(&self, format: ArgFormat) -> String {
        match (self, format) {
            (ArgValue::Str(s), ArgFormat::String) => s.clone(),
            (ArgValue::Str(s), _) => format!("\"{s}\""),
            (ArgValue::Int(v), ArgFormat::Hex) => format!("{:#x}", *v as u64),
            (ArgValue::Uint(v), ArgFormat::Hex) | (ArgValue::Ptr(v), ArgFormat::Hex) => {
                format!("{v:#x}")
            }
            (ArgValue::Int(v), ArgFormat::Pointer) => format!("{:#x}", *v as u64),
            (ArgValue::Uint(v), ArgFormat::Pointer) => format!("{v:#x}"),
            (ArgValue::Ptr(v), ArgFormat::Decimal) => v.to_string(),
            (ArgValue::Ptr(v), _) => format!("{v:#x}"),
            (ArgValue::Int(v), _) => v.to_string(),
            (ArgValue::Uint(v), _) => v.to_string(),
            (ArgValue::Float(v), _) => format!("{v:.6}"),
        }
    }

    /// Plain rendering handed to hooks and JSON output.
    pub fn render_plain(&self) -> String {
        match self {
            ArgValue::Str(s) => s.clone(),
            other => other.render(ArgFormat::Auto),
        }
    }
}

/// One entry, exit or mark on one task.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub task_id: u32,
    pub kind: EventKind,
    /// Monotonic nanoseconds, non-decreasing within one stream.
    pub timestamp: u64,
    pub function_ref: String,
    pub args: Option<Vec<ArgValue>>,
    pub retval: Option<ArgValue>,
    /// Trigger action tagged at record time (e.g. `finish`).
    pub trigger: Option<String>,
}

impl Event {
    pub fn new(task_id: u32, kind: EventKind, timestamp: u64, function_ref: &str) -> Self {
        Self {
            task_id,
            kind,
            timestamp,
            function_ref: function_ref.to_string(),
            args: None,
            retval: None,
            trigger: None,
        }
    }

    pub fn with_args(mut self, args: Vec<ArgValue>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_retval(mut self, retval: ArgValue) -> Self {
        self.retval = Some(retval);
        self
    }

    pub fn with_trigger(mut self, action: &str) -> Self {
        self.trigger = Some(action.to_string());
        self
    }

    /// `provider:event` names (e.g. `linux:schedule`) describe events, not calls.
    pub fn is_event_name(&self) -> bool {
        is_event_name(&self.function_ref)
    }
}

pub fn is_event_name(name: &str) -> bool {
    EVENT_NAME_RE.is_match(name)
}

/// How a task's stream ended when it was collected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Explicit end marker found.
    Closed,
    /// Stream ends on a record boundary but without an end marker.
    Open,
    /// Stream ends in the middle of a record.
    Truncated,
    /// Registry knows the task but no stream file exists.
    #[default]
    Missing,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Closed => "closed",
            StreamState::Open => "open",
            StreamState::Truncated => "truncated",
            StreamState::Missing => "missing",
        }
    }
}

/// One traced thread or process.
///
/// # Fields
/// - `task_id`: Session-unique id (distinct from OS ids)
/// - `parent_task_id`: Task that forked/cloned this one, `None` for the root
/// - `pid`: OS process id (thread group)
/// - `tid`: OS thread id, normalized from either registry spelling
/// - `creation_time`: Registry timestamp in nanoseconds
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Task {
    pub task_id: u32,
    pub parent_task_id: Option<u32>,
    pub pid: i32,
    pub tid: i32,
    pub creation_time: u64,
    pub session_id: String,
    pub exename: Option<String>,
    pub state: StreamState,
    pub stream: Option<PathBuf>,
    pub kernel_stream: Option<PathBuf>,
}

impl Task {
    /// True when the stream did not end with an explicit end marker.
    pub fn incomplete(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::Truncated)
    }
}
