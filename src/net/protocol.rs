//! Wire format between a remote recorder and `recv`.
//!
//! Every message is a frame: a 4-byte big-endian payload length followed by a
//! JSON-encoded [`Message`]. Per session the sender emits
//!
//! ```text
//! session_start, (registry | task_chunk | child_session_start ... child_session_end)*, session_end
//! ```
//!
//! and may follow it with further sessions on the same connection.

use std::io::{self, Read, Write};
use std::path::{Component, Path};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::TraceError;
use crate::session::SessionInfo;
use crate::trace::constants::MAX_FRAME_SIZE;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    SessionStart {
        name: String,
        info: SessionInfo,
    },
    /// Opens a nested session below the current one.
    ChildSessionStart {
        name: String,
        info: SessionInfo,
    },
    /// One raw registry line.
    Registry {
        record: String,
    },
    /// A piece of a task stream, whole lines only.
    TaskChunk {
        task_id: u32,
        #[serde(default)]
        kernel: bool,
        data: String,
    },
    ChildSessionEnd,
    SessionEnd,
}

pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        anyhow::bail!(
            "message of {} bytes exceeds the {} byte frame limit",
            payload.len(),
            MAX_FRAME_SIZE
        );
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}

fn io_error(peer: &str, what: &str, err: io::Error) -> TraceError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            TraceError::protocol(peer, format!("timed out waiting for {what}"))
        }
        io::ErrorKind::UnexpectedEof => {
            TraceError::protocol(peer, format!("connection closed in the middle of {what}"))
        }
        _ => TraceError::protocol(peer, format!("failed to read {what}: {err}")),
    }
}

/// Read the next message. `Ok(None)` means the peer closed the connection
/// cleanly on a frame boundary.
pub fn read_message<R: Read>(reader: &mut R, peer: &str) -> Result<Option<Message>, TraceError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(TraceError::protocol(
                    peer,
                    "connection closed in the middle of a frame header",
                ))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(io_error(peer, "a frame header", err)),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TraceError::protocol(
            peer,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|err| io_error(peer, "a frame payload", err))?;
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|err| TraceError::protocol(peer, format!("malformed message: {err}")))
}

/// Session names become directories on the receiver, so only plain relative
/// paths are allowed.
pub fn validate_name(name: &str, peer: &str) -> Result<(), TraceError> {
    let path = Path::new(name);
    let ok = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(TraceError::protocol(
            peer,
            format!("invalid session name {name:?}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frames_in_sequence() {
        let mut buf = Vec::new();
        let messages = vec![
            Message::SessionStart {
                name: "xxx".into(),
                info: SessionInfo::new("t-abc", "now"),
            },
            Message::TaskChunk {
                task_id: 1,
                kernel: false,
                data: "{\"ts\":1,\"kind\":\"end\"}\n".into(),
            },
            Message::SessionEnd,
        ];
        for m in &messages {
            write_message(&mut buf, m).unwrap();
        }

        let mut cursor = Cursor::new(buf);
        for m in &messages {
            assert_eq!(read_message(&mut cursor, "test").unwrap().as_ref(), Some(m));
        }
        assert_eq!(read_message(&mut cursor, "test").unwrap(), None);
    }

    #[test]
    fn test_short_payload_is_protocol_error() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::SessionEnd).unwrap();
        buf.truncate(buf.len() - 2);
        let err = read_message(&mut Cursor::new(buf), "peer").unwrap_err();
        assert!(matches!(err, TraceError::ProtocolError { .. }));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let buf = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes().to_vec();
        assert!(read_message(&mut Cursor::new(buf), "peer").is_err());
    }

    #[test]
    fn test_garbage_payload() {
        let mut buf = 3u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        assert!(read_message(&mut Cursor::new(buf), "peer").is_err());
    }

    #[test]
    fn test_session_names() {
        assert!(validate_name("yyy", "p").is_ok());
        assert!(validate_name("a/b", "p").is_ok());
        assert!(validate_name("../etc", "p").is_err());
        assert!(validate_name("/abs", "p").is_err());
        assert!(validate_name("", "p").is_err());
    }
}
