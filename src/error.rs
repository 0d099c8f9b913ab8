//! Error kinds raised while collecting and replaying sessions.
//!
//! Everything is propagated through `anyhow`, but the kinds below are kept as a
//! concrete enum so callers can `downcast_ref::<TraceError>()` and decide
//! whether a failure is scoped to one task, one connection, or the whole run.

use std::fmt;

/// Failure kinds for session ingestion, network transport and replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    /// A registry or stream entry is missing or malformed. The affected task
    /// is dropped, the rest of the session survives.
    CorruptSession {
        task_id: Option<u32>,
        record: Option<usize>,
        message: String,
    },
    /// A stream ended in the middle of a record.
    TruncatedStream {
        task_id: u32,
        offset: u64,
        message: String,
    },
    /// An event references a task the registry does not know about.
    UnknownTask { task_id: u32, record: usize },
    /// Malformed framing on a network connection.
    ProtocolError { peer: String, message: String },
    /// Invalid filter, trigger, selector or time specification.
    ConfigError { option: String, message: String },
}

impl TraceError {
    pub fn corrupt(task_id: Option<u32>, record: Option<usize>, message: impl Into<String>) -> Self {
        TraceError::CorruptSession {
            task_id,
            record,
            message: message.into(),
        }
    }

    pub fn protocol(peer: impl Into<String>, message: impl Into<String>) -> Self {
        TraceError::ProtocolError {
            peer: peer.into(),
            message: message.into(),
        }
    }

    pub fn config(option: impl Into<String>, message: impl Into<String>) -> Self {
        TraceError::ConfigError {
            option: option.into(),
            message: message.into(),
        }
    }

    /// Whether the error only affects a single task or connection.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TraceError::ConfigError { .. })
    }
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::CorruptSession {
                task_id,
                record,
                message,
            } => {
                write!(f, "corrupt session")?;
                if let Some(task_id) = task_id {
                    write!(f, " (task {task_id}")?;
                    if let Some(record) = record {
                        write!(f, ", record {record}")?;
                    }
                    write!(f, ")")?;
                }
                write!(f, ": {message}")
            }
            TraceError::TruncatedStream {
                task_id,
                offset,
                message,
            } => {
                write!(
                    f,
                    "truncated stream for task {task_id} at byte {offset}: {message}"
                )
            }
            TraceError::UnknownTask { task_id, record } => {
                write!(f, "record {record} references unknown task {task_id}")
            }
            TraceError::ProtocolError { peer, message } => {
                write!(f, "protocol error from {peer}: {message}")
            }
            TraceError::ConfigError { option, message } => {
                write!(f, "invalid {option}: {message}")
            }
        }
    }
}

impl std::error::Error for TraceError {}
