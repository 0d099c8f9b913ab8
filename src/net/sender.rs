//! Session transmitter: the recording side of `recv`.
//!
//! Streams an existing session directory (and its nested child sessions) to
//! a receiver using the framing in [`super::protocol`].

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use super::protocol::{write_message, Message};
use crate::session::SessionInfo;
use crate::trace::constants::{REGISTRY_FILE, STREAM_FILE_RE};

/// Stream data is sent in chunks of whole lines up to roughly this size.
const CHUNK_SIZE: usize = 64 << 10;

fn send_stream<W: Write>(writer: &mut W, path: &Path, task_id: u32, kernel: bool) -> Result<()> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
    );
    let mut chunk = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n > 0 {
            chunk.push_str(&line);
        }
        if (n == 0 && !chunk.is_empty()) || chunk.len() >= CHUNK_SIZE {
            write_message(
                writer,
                &Message::TaskChunk {
                    task_id,
                    kernel,
                    data: std::mem::take(&mut chunk),
                },
            )?;
        }
        if n == 0 {
            return Ok(());
        }
    }
}

fn send_body<W: Write>(writer: &mut W, dir: &Path, info: &SessionInfo) -> Result<()> {
    let registry = dir.join(REGISTRY_FILE);
    let records = fs::read_to_string(&registry)
        .with_context(|| format!("failed to read {}", registry.display()))?;
    for record in records.lines().filter(|l| !l.trim().is_empty()) {
        write_message(
            writer,
            &Message::Registry {
                record: record.to_string(),
            },
        )?;
    }

    let mut streams = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(caps) = name.to_str().and_then(|n| STREAM_FILE_RE.captures(n)) else {
            continue;
        };
        let Ok(task_id) = caps[1].parse::<u32>() else {
            continue;
        };
        streams.push((task_id, caps.get(2).is_some(), entry.path()));
    }
    streams.sort();
    for (task_id, kernel, path) in streams {
        debug!("sending {}", path.display());
        send_stream(writer, &path, task_id, kernel)?;
    }

    for child in &info.child_sessions {
        let child_dir = dir.join(child);
        let child_info = SessionInfo::load(&child_dir)?;
        write_message(
            writer,
            &Message::ChildSessionStart {
                name: child.clone(),
                info: child_info.clone(),
            },
        )?;
        send_body(writer, &child_dir, &child_info)?;
        write_message(writer, &Message::ChildSessionEnd)?;
    }
    Ok(())
}

/// Write one complete session to `writer` under the receiver-side `name`.
pub fn send_session<W: Write>(writer: &mut W, dir: &Path, name: &str) -> Result<()> {
    let info = SessionInfo::load(dir)?;
    write_message(
        writer,
        &Message::SessionStart {
            name: name.to_string(),
            info: info.clone(),
        },
    )?;
    send_body(writer, dir, &info)?;
    write_message(writer, &Message::SessionEnd)?;
    writer.flush()?;
    Ok(())
}

/// Connect to a receiver and transmit a session directory. The receiver
/// stores it under the directory's own name unless `name` is given.
pub fn connect_and_send(host: &str, port: u16, dir: &Path, name: Option<&str>) -> Result<()> {
    let name = match name {
        Some(name) => name.to_string(),
        None => match dir.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => bail!("cannot derive a session name from {}", dir.display()),
        },
    };
    let stream = TcpStream::connect((host, port))
        .with_context(|| format!("failed to connect to {host}:{port}"))?;
    let mut writer = BufWriter::new(stream);
    send_session(&mut writer, dir, &name)?;
    info!("sent session {} to {}:{} as {}", dir.display(), host, port, name);
    Ok(())
}
