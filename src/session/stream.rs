//! Task stream codec.
//!
//! A task stream is a line-oriented log, one JSON record per line:
//!
//! ```text
//! {"ts":1000,"kind":"entry","name":"main"}
//! {"ts":1900,"kind":"exit","name":"main","retval":{"type":"int","value":0}}
//! {"ts":1950,"kind":"end"}
//! ```
//!
//! The `end` record marks a stream the recorder closed on purpose. A stream
//! that simply stops is still replayable; one that stops in the middle of a
//! line is truncated.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::TraceError;
use crate::trace::constants::{FOLLOW_POLL_INTERVAL, STREAM_TAIL_PROBE};
use crate::trace::{ArgValue, Event, EventKind, StreamState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RecordKind {
    Entry,
    Exit,
    KernelEntry,
    KernelExit,
    Event,
    End,
}

impl From<EventKind> for RecordKind {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Entry => RecordKind::Entry,
            EventKind::Exit => RecordKind::Exit,
            EventKind::KernelEntry => RecordKind::KernelEntry,
            EventKind::KernelExit => RecordKind::KernelExit,
            EventKind::EventMark => RecordKind::Event,
        }
    }
}

impl RecordKind {
    fn event_kind(self) -> Option<EventKind> {
        match self {
            RecordKind::Entry => Some(EventKind::Entry),
            RecordKind::Exit => Some(EventKind::Exit),
            RecordKind::KernelEntry => Some(EventKind::KernelEntry),
            RecordKind::KernelExit => Some(EventKind::KernelExit),
            RecordKind::Event => Some(EventKind::EventMark),
            RecordKind::End => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamRecord {
    ts: u64,
    kind: RecordKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<ArgValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retval: Option<ArgValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trigger: Option<String>,
}

/// Encode one event as a stream line (without the newline).
pub fn encode_event(event: &Event) -> Result<String> {
    let record = StreamRecord {
        ts: event.timestamp,
        kind: event.kind.into(),
        name: event.function_ref.clone(),
        task: Some(event.task_id),
        args: event.args.clone(),
        retval: event.retval.clone(),
        trigger: event.trigger.clone(),
    };
    Ok(serde_json::to_string(&record)?)
}

/// Encode the end-of-stream marker.
pub fn encode_end(timestamp: u64) -> String {
    format!("{{\"ts\":{timestamp},\"kind\":\"end\"}}")
}

/// Classify a stream file by looking at its last line only.
pub fn probe_tail(path: &Path) -> Result<StreamState> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open stream {}", path.display()))?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(StreamState::Open);
    }
    let start = len.saturating_sub(STREAM_TAIL_PROBE);
    file.seek(SeekFrom::Start(start))?;
    let mut tail = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut tail)?;

    if tail.last() != Some(&b'\n') {
        return Ok(StreamState::Truncated);
    }
    let body = &tail[..tail.len() - 1];
    let last_line = match body.iter().rposition(|&b| b == b'\n') {
        Some(pos) => &body[pos + 1..],
        None => body,
    };
    match serde_json::from_slice::<StreamRecord>(last_line) {
        Ok(record) if record.kind == RecordKind::End => Ok(StreamState::Closed),
        Ok(_) => Ok(StreamState::Open),
        Err(_) => Ok(StreamState::Truncated),
    }
}

/// Sequential reader over one task stream.
///
/// Recoverable problems (corrupt records, clock going backwards, truncation)
/// are logged and the reader keeps going; it never returns an error after it
/// has been opened.
pub struct StreamReader {
    task_id: u32,
    path: PathBuf,
    reader: BufReader<File>,
    line: Vec<u8>,
    offset: u64,
    record: usize,
    last_ts: u64,
    follow: Option<Duration>,
    saw_end: bool,
    truncated: bool,
    done: bool,
}

impl StreamReader {
    pub fn open(task_id: u32, path: &Path, follow: Option<Duration>) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open stream {}", path.display()))?;
        Ok(Self {
            task_id,
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            line: Vec::new(),
            offset: 0,
            record: 0,
            last_ts: 0,
            follow,
            saw_end: false,
            truncated: false,
            done: false,
        })
    }

    pub fn task_id(&self) -> u32 {
        self.task_id
    }

    /// True once the explicit end marker was read.
    pub fn ended_cleanly(&self) -> bool {
        self.saw_end
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Read more bytes into `self.line`. Returns false at (final) end of file.
    fn fill_line(&mut self) -> bool {
        let mut deadline = self.follow.map(|timeout| Instant::now() + timeout);
        loop {
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => {}
                Ok(_) if self.line.ends_with(b"\n") => return true,
                Ok(_) => {
                    // Partial line, wait for the writer to finish it.
                    if let Some(timeout) = self.follow {
                        deadline = Some(Instant::now() + timeout);
                    }
                }
                Err(err) => {
                    warn!(
                        "task {}: read error in {} at byte {}: {}",
                        self.task_id,
                        self.path.display(),
                        self.offset,
                        err
                    );
                    return !self.line.is_empty();
                }
            }

            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    thread::sleep(FOLLOW_POLL_INTERVAL);
                }
                _ => return !self.line.is_empty(),
            }
        }
    }

    fn at_eof(&mut self) -> bool {
        matches!(self.reader.fill_buf(), Ok(buf) if buf.is_empty())
    }

    fn report_truncated(&mut self, message: &str) {
        self.truncated = true;
        let err = TraceError::TruncatedStream {
            task_id: self.task_id,
            offset: self.offset,
            message: message.to_string(),
        };
        warn!("{}", err);
    }

    /// Next event, or `None` once the stream is exhausted.
    pub fn next_event(&mut self) -> Option<Event> {
        while !self.done {
            self.line.clear();
            if !self.fill_line() {
                self.done = true;
                break;
            }
            let line_offset = self.offset;
            self.offset += self.line.len() as u64;
            let record_index = self.record;
            self.record += 1;

            if !self.line.ends_with(b"\n") {
                self.offset = line_offset;
                self.report_truncated("stream ends in the middle of a record");
                self.done = true;
                break;
            }

            let parsed = serde_json::from_slice::<StreamRecord>(self.line.trim_ascii_end());
            let record = match parsed {
                Ok(record) => record,
                Err(err) => {
                    if self.at_eof() && self.follow.is_none() {
                        self.offset = line_offset;
                        self.report_truncated(&format!("unparsable final record: {err}"));
                        self.done = true;
                        break;
                    }
                    warn!(
                        "{}",
                        TraceError::corrupt(
                            Some(self.task_id),
                            Some(record_index),
                            format!("skipping malformed record at byte {line_offset}: {err}"),
                        )
                    );
                    continue;
                }
            };

            let Some(kind) = record.kind.event_kind() else {
                self.saw_end = true;
                self.done = true;
                if !self.at_eof() {
                    debug!(
                        "task {}: ignoring data after end marker in {}",
                        self.task_id,
                        self.path.display()
                    );
                }
                break;
            };

            let mut timestamp = record.ts;
            if timestamp < self.last_ts {
                warn!(
                    "task {}: record {} goes back in time ({} < {}), clamping",
                    self.task_id, record_index, timestamp, self.last_ts
                );
                timestamp = self.last_ts;
            }
            self.last_ts = timestamp;

            return Some(Event {
                task_id: record.task.unwrap_or(self.task_id),
                kind,
                timestamp,
                function_ref: record.name,
                args: record.args,
                retval: record.retval,
                trigger: record.trigger,
            });
        }
        None
    }

    /// Index of the record most recently returned (for diagnostics).
    pub fn record_index(&self) -> usize {
        self.record.saturating_sub(1)
    }
}

impl Iterator for StreamReader {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.next_event()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_stream(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("1.dat");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn lines(events: &[Event], end: Option<u64>) -> String {
        let mut out = String::new();
        for e in events {
            out.push_str(&encode_event(e).unwrap());
            out.push('\n');
        }
        if let Some(ts) = end {
            out.push_str(&encode_end(ts));
            out.push('\n');
        }
        out
    }

    #[test]
    fn test_read_closed_stream() {
        let dir = TempDir::new().unwrap();
        let events = vec![
            Event::new(1, EventKind::Entry, 10, "main").with_args(vec![ArgValue::Int(1)]),
            Event::new(1, EventKind::Exit, 20, "main").with_retval(ArgValue::Int(0)),
        ];
        let path = write_stream(&dir, &lines(&events, Some(30)));

        assert_eq!(probe_tail(&path).unwrap(), StreamState::Closed);
        let mut reader = StreamReader::open(1, &path, None).unwrap();
        let read: Vec<Event> = reader.by_ref().collect();
        assert_eq!(read, events);
        assert!(reader.ended_cleanly());
        assert!(!reader.truncated());
    }

    #[test]
    fn test_truncated_tail() {
        let dir = TempDir::new().unwrap();
        let mut contents = lines(&[Event::new(1, EventKind::Entry, 10, "main")], None);
        contents.push_str("{\"ts\":20,\"ki");
        let path = write_stream(&dir, &contents);

        assert_eq!(probe_tail(&path).unwrap(), StreamState::Truncated);
        let mut reader = StreamReader::open(1, &path, None).unwrap();
        assert_eq!(reader.next_event().unwrap().function_ref, "main");
        assert!(reader.next_event().is_none());
        assert!(reader.truncated());
        assert!(!reader.ended_cleanly());
    }

    #[test]
    fn test_open_stream_without_marker() {
        let dir = TempDir::new().unwrap();
        let path = write_stream(&dir, &lines(&[Event::new(1, EventKind::Entry, 1, "a")], None));
        assert_eq!(probe_tail(&path).unwrap(), StreamState::Open);
        let reader = StreamReader::open(1, &path, None).unwrap();
        assert_eq!(reader.count(), 1);
    }

    #[test]
    fn test_corrupt_middle_record_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut contents = lines(&[Event::new(1, EventKind::Entry, 1, "a")], None);
        contents.push_str("garbage\n");
        contents.push_str(&lines(&[Event::new(1, EventKind::Exit, 2, "a")], Some(3)));
        let path = write_stream(&dir, &contents);

        let mut reader = StreamReader::open(1, &path, None).unwrap();
        let names: Vec<_> = reader.by_ref().map(|e| e.kind).collect();
        assert_eq!(names, vec![EventKind::Entry, EventKind::Exit]);
        assert!(reader.ended_cleanly());
    }

    #[test]
    fn test_invalid_utf8_record_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut contents = lines(&[Event::new(1, EventKind::Entry, 1, "a")], None).into_bytes();
        contents.extend_from_slice(b"{\"ts\":2,\"kind\":\"entry\",\"name\":\"\xff\xfe\"}\n");
        contents.extend_from_slice(
            lines(&[Event::new(1, EventKind::Exit, 3, "a")], Some(4)).as_bytes(),
        );
        let path = dir.path().join("1.dat");
        std::fs::write(&path, contents).unwrap();

        let mut reader = StreamReader::open(1, &path, None).unwrap();
        let read: Vec<_> = reader.by_ref().map(|e| (e.kind, e.timestamp)).collect();
        assert_eq!(read, vec![(EventKind::Entry, 1), (EventKind::Exit, 3)]);
        assert!(reader.ended_cleanly());
        assert!(!reader.truncated());
    }

    #[test]
    fn test_backwards_timestamp_is_clamped() {
        let dir = TempDir::new().unwrap();
        let path = write_stream(
            &dir,
            &lines(
                &[
                    Event::new(1, EventKind::Entry, 50, "a"),
                    Event::new(1, EventKind::Exit, 40, "a"),
                ],
                None,
            ),
        );
        let ts: Vec<u64> = StreamReader::open(1, &path, None)
            .unwrap()
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(ts, vec![50, 50]);
    }

    #[test]
    fn test_follow_picks_up_appended_records() {
        let dir = TempDir::new().unwrap();
        let path = write_stream(&dir, &lines(&[Event::new(1, EventKind::Entry, 1, "a")], None));
        let mut reader = StreamReader::open(1, &path, Some(Duration::from_secs(5))).unwrap();
        assert!(reader.next_event().is_some());

        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(writer_path)
                .unwrap();
            let tail = lines(&[Event::new(1, EventKind::Exit, 2, "a")], Some(3));
            file.write_all(tail.as_bytes()).unwrap();
        });

        let next = reader.next_event().unwrap();
        assert_eq!(next.kind, EventKind::Exit);
        assert!(reader.next_event().is_none());
        assert!(reader.ended_cleanly());
        writer.join().unwrap();
    }

    #[test]
    fn test_follow_times_out() {
        let dir = TempDir::new().unwrap();
        let path = write_stream(&dir, &lines(&[Event::new(1, EventKind::Entry, 1, "a")], None));
        let mut reader = StreamReader::open(1, &path, Some(Duration::from_millis(100))).unwrap();
        assert!(reader.next_event().is_some());
        let start = Instant::now();
        assert!(reader.next_event().is_none());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
