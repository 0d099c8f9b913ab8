//! Trace-event JSON output, loadable by chrome://tracing and Perfetto UI.
//!
//! Events are written in replay order, one per line, so the output can be
//! compared and diffed line by line.

use std::io::Write;

use anyhow::Result;
use serde_json::{Map, Value};

use super::TraceEncoder;
use crate::filter::ReplayConfig;
use crate::replay::{CallTree, Frame, Line, LineKind};
use crate::session::Session;

/// Microseconds with nanosecond precision, without float rounding.
fn micros(ns: u64) -> String {
    format!("{}.{:03}", ns / 1000, ns % 1000)
}

pub struct ChromeEncoder<'c, W: Write> {
    out: W,
    config: &'c ReplayConfig,
    first: bool,
}

impl<'c, W: Write> ChromeEncoder<'c, W> {
    pub fn new(out: W, config: &'c ReplayConfig) -> Self {
        Self {
            out,
            config,
            first: true,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn entry_args(&self, frame: &Frame) -> Option<Map<String, Value>> {
        let args = self
            .config
            .display_args(&frame.name, frame.args.as_ref()?)?;
        if args.is_empty() {
            return None;
        }
        let mut map = Map::new();
        for (i, arg) in args.into_iter().enumerate() {
            map.insert(format!("arg{}", i + 1), Value::String(arg));
        }
        Some(map)
    }

    fn exit_args(&self, frame: &Frame) -> Option<Map<String, Value>> {
        let retval = self
            .config
            .display_retval(&frame.name, frame.retval.as_ref()?)?;
        let mut map = Map::new();
        map.insert("retval".to_string(), Value::String(retval));
        Some(map)
    }

    fn event(
        &mut self,
        ts: Option<u64>,
        phase: &str,
        tid: i32,
        name: &str,
        args: Option<Map<String, Value>>,
    ) -> Result<()> {
        if !self.first {
            writeln!(self.out, ",")?;
        }
        self.first = false;
        write!(
            self.out,
            "{{\"ts\":{},\"ph\":\"{}\",\"pid\":{},\"name\":{}",
            micros(ts.unwrap_or_default()),
            phase,
            tid,
            serde_json::to_string(name)?
        )?;
        if phase == "i" {
            write!(self.out, ",\"s\":\"t\"")?;
        }
        if let Some(args) = args {
            write!(self.out, ",\"args\":{}", Value::Object(args))?;
        }
        write!(self.out, "}}")?;
        Ok(())
    }
}

impl<W: Write> TraceEncoder for ChromeEncoder<'_, W> {
    fn begin(&mut self, _session: &Session) -> Result<()> {
        writeln!(self.out, "{{\"traceEvents\":[")?;
        Ok(())
    }

    fn line(&mut self, line: &Line<'_>) -> Result<()> {
        let frame = line.frame;
        let tid = line.task.tid;
        match line.kind {
            LineKind::Entry => {
                let args = self.entry_args(frame);
                self.event(frame.entry_ts, "B", tid, &frame.name, args)
            }
            LineKind::Leaf => {
                let args = self.entry_args(frame);
                self.event(frame.entry_ts, "B", tid, &frame.name, args)?;
                let args = self.exit_args(frame);
                self.event(frame.exit_ts, "E", tid, &frame.name, args)
            }
            LineKind::Exit | LineKind::ImplicitExit | LineKind::DanglingExit => {
                let args = self.exit_args(frame);
                self.event(frame.exit_ts, "E", tid, &frame.name, args)
            }
            LineKind::Mark => {
                let args = self.entry_args(frame);
                self.event(frame.entry_ts, "i", tid, &frame.name, args)
            }
        }
    }

    fn end(&mut self, session: &Session, _tree: &CallTree) -> Result<()> {
        if !self.first {
            writeln!(self.out)?;
        }
        writeln!(self.out, "], \"displayTimeUnit\": \"ns\", \"metadata\": {{")?;
        writeln!(
            self.out,
            "\"command_line\":{},",
            serde_json::to_string(&session.info.command_line)?
        )?;
        writeln!(
            self.out,
            "\"recorded_time\":{}",
            serde_json::to_string(&session.info.recorded_time)?
        )?;
        writeln!(self.out, "}} }}")?;
        self.out.flush()?;
        Ok(())
    }
}
