//! Indented call-graph text output.
//!
//! ```text
//! # DURATION    TID     FUNCTION
//!             [28141] | a() {
//!    0.753 us [28141] |   getpid();
//!    2.405 us [28141] | } /* a */
//! ```

use std::io::Write;

use anyhow::Result;

use super::{format_duration, TraceEncoder};
use crate::filter::ReplayConfig;
use crate::replay::{CallTree, Frame, Line, LineKind, Terminal, TerminalBlock};
use crate::session::Session;

const HEADER: &str = "# DURATION    TID     FUNCTION";
const STOPPED: &str = "calltree stopped tracing with remaining functions";
const UNFINISHED: &str = "trace ended with unfinished functions";

pub struct TextEncoder<'c, W: Write> {
    out: W,
    config: &'c ReplayConfig,
}

impl<'c, W: Write> TextEncoder<'c, W> {
    pub fn new(out: W, config: &'c ReplayConfig) -> Self {
        Self { out, config }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn args(&self, frame: &Frame) -> String {
        frame
            .args
            .as_ref()
            .and_then(|args| self.config.display_args(&frame.name, args))
            .map(|args| args.join(", "))
            .unwrap_or_default()
    }

    fn retval(&self, frame: &Frame) -> Option<String> {
        frame
            .retval
            .as_ref()
            .and_then(|r| self.config.display_retval(&frame.name, r))
    }

    fn close(&self, frame: &Frame) -> String {
        let mut body = String::from("}");
        if let Some(ret) = self.retval(frame) {
            body.push_str(&format!(" = {ret};"));
        }
        if !self.config.no_comment {
            body.push_str(&format!(" /* {} */", frame.name));
        }
        body
    }

    /// Duration column and text of one line, `None` for lines not printed.
    fn render(&self, line: &Line<'_>) -> Option<(Option<u64>, String)> {
        let frame = line.frame;
        match line.kind {
            LineKind::Entry => Some((None, format!("{}({}) {{", frame.name, self.args(frame)))),
            LineKind::Leaf if frame.is_event() => {
                Some((frame.duration(), format!("/* {} */", frame.name)))
            }
            LineKind::Leaf => {
                let body = match self.retval(frame) {
                    Some(ret) => format!("{}({}) = {};", frame.name, self.args(frame), ret),
                    None => format!("{}({});", frame.name, self.args(frame)),
                };
                Some((frame.duration(), body))
            }
            LineKind::Exit => Some((frame.duration(), self.close(frame))),
            LineKind::DanglingExit => Some((None, self.close(frame))),
            LineKind::Mark => Some((None, format!("/* {} */", frame.name))),
            LineKind::ImplicitExit => None,
        }
    }

    fn write_blocks(&mut self, blocks: &[&TerminalBlock], kind: Terminal) -> Result<()> {
        let blocks: Vec<_> = blocks.iter().filter(|b| b.kind == kind).collect();
        if blocks.is_empty() {
            return Ok(());
        }
        let title = match kind {
            Terminal::Interrupted => STOPPED,
            Terminal::Unfinished => UNFINISHED,
        };
        writeln!(self.out)?;
        writeln!(self.out, "{title}")?;
        writeln!(self.out, "{}", "=".repeat(title.len()))?;
        for block in blocks {
            writeln!(self.out, "task: {}", block.tid)?;
            for (depth, name) in &block.frames {
                writeln!(self.out, "[{depth}] {name}")?;
            }
        }
        Ok(())
    }
}

impl<W: Write> TraceEncoder for TextEncoder<'_, W> {
    fn begin(&mut self, _session: &Session) -> Result<()> {
        writeln!(self.out, "{HEADER}")?;
        Ok(())
    }

    fn line(&mut self, line: &Line<'_>) -> Result<()> {
        let Some((duration, body)) = self.render(line) else {
            return Ok(());
        };
        writeln!(
            self.out,
            " {} [{:>5}] | {}{}",
            format_duration(duration),
            line.task.tid,
            "  ".repeat(line.frame.visible_depth),
            body
        )?;
        Ok(())
    }

    fn end(&mut self, _session: &Session, tree: &CallTree) -> Result<()> {
        let blocks = tree.terminals();
        self.write_blocks(&blocks, Terminal::Interrupted)?;
        self.write_blocks(&blocks, Terminal::Unfinished)?;
        self.out.flush()?;
        Ok(())
    }
}
