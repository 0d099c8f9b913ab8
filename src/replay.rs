//! Call-tree reconstruction.
//!
//! The replayer consumes the merged timeline and grows one arena of frames
//! per task. Recursion is just repeated entries pushing new frames. Once the
//! input is exhausted every still-open frame is closed with a synthesized
//! exit, visibility (filters, depth budgets, time thresholds, tracing on/off)
//! is decided per frame, and the encoders walk the resulting [`Line`]s in the
//! order the underlying events were replayed.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{debug, warn};

use crate::error::TraceError;
use crate::filter::{ReplayConfig, TriggerAction};
use crate::session::Session;
use crate::trace::constants::TASK_EXIT_EVENT;
use crate::trace::{is_event_name, ArgValue, Event, EventKind};

pub type FrameId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    User,
    Kernel,
    /// Point event, no duration and no children.
    Mark,
}

/// How a frame was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Close {
    Open,
    Normal,
    /// Closed because an exit for an enclosing frame arrived first.
    Implicit,
    /// Closed by a `finish` trigger or the task exiting.
    Interrupted,
    /// Still open when the stream ended.
    Unfinished,
    /// An exit that matched no open frame.
    Dangling,
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub name: String,
    pub kind: FrameKind,
    pub entry_ts: Option<u64>,
    pub exit_ts: Option<u64>,
    pub entry_seq: u64,
    pub exit_seq: Option<u64>,
    pub args: Option<Vec<ArgValue>>,
    pub retval: Option<ArgValue>,
    pub close: Close,
    /// Copied from the parent task's stack when a forked child started.
    pub inherited: bool,
    pub parent: Option<FrameId>,
    pub children: Vec<FrameId>,
    /// Position on the task's stack.
    pub depth: usize,
    /// Number of visible ancestors.
    pub visible_depth: usize,
    pub visible: bool,
    traced: bool,
    budget: Option<usize>,
    threshold: Option<u64>,
}

impl Frame {
    /// Elapsed time, when both ends are known.
    pub fn duration(&self) -> Option<u64> {
        match (self.entry_ts, self.exit_ts) {
            (Some(entry), Some(exit)) if self.close != Close::Dangling => {
                Some(exit.saturating_sub(entry))
            }
            _ => None,
        }
    }

    pub fn is_event(&self) -> bool {
        self.kind == FrameKind::Mark || is_event_name(&self.name)
    }

    fn closed_by_exit(&self) -> bool {
        matches!(self.close, Close::Normal | Close::Implicit)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminal {
    Interrupted,
    Unfinished,
}

/// Frames left open when a task stopped, innermost first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalBlock {
    pub kind: Terminal,
    pub tid: i32,
    /// `(stack depth, name)` pairs.
    pub frames: Vec<(usize, String)>,
}

pub struct TaskTree {
    pub task_id: u32,
    pub tid: i32,
    frames: Vec<Frame>,
    roots: Vec<FrameId>,
    stack: Vec<FrameId>,
    tracing: bool,
    last_ts: u64,
    terminal: Option<TerminalBlock>,
    corrupt: bool,
}

impl TaskTree {
    fn new(task_id: u32, tid: i32) -> Self {
        Self {
            task_id,
            tid,
            frames: Vec::new(),
            roots: Vec::new(),
            stack: Vec::new(),
            tracing: true,
            last_ts: 0,
            terminal: None,
            corrupt: false,
        }
    }

    pub fn frame(&self, id: FrameId) -> &Frame {
        &self.frames[id]
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn roots(&self) -> &[FrameId] {
        &self.roots
    }

    pub fn terminal(&self) -> Option<&TerminalBlock> {
        self.terminal.as_ref()
    }

    fn top(&self) -> Option<&Frame> {
        self.stack.last().map(|&id| &self.frames[id])
    }

    fn add(&mut self, mut frame: Frame) -> FrameId {
        let id = self.frames.len();
        frame.parent = self.stack.last().copied();
        frame.depth = self.stack.len();
        match frame.parent {
            Some(parent) => self.frames[parent].children.push(id),
            None => self.roots.push(id),
        }
        self.frames.push(frame);
        id
    }

    fn is_leaf(&self, frame: &Frame) -> bool {
        frame.visible
            && frame.closed_by_exit()
            && !frame.inherited
            && frame.children.iter().all(|&c| !self.frames[c].visible)
    }
}

fn new_frame(name: &str, kind: FrameKind, entry_ts: Option<u64>, seq: u64) -> Frame {
    Frame {
        name: name.to_string(),
        kind,
        entry_ts,
        exit_ts: None,
        entry_seq: seq,
        exit_seq: None,
        args: None,
        retval: None,
        close: Close::Open,
        inherited: false,
        parent: None,
        children: Vec::new(),
        depth: 0,
        visible_depth: 0,
        visible: false,
        traced: true,
        budget: None,
        threshold: None,
    }
}

/// What an encoder prints for one replayed event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineKind {
    /// Opening line of a frame with visible children or no normal close.
    Entry,
    /// Frame printed on a single line.
    Leaf,
    Exit,
    /// Synthesized exit of an interrupted or unfinished frame.
    ImplicitExit,
    /// Exit without a known entry (inherited or orphan frame).
    DanglingExit,
    Mark,
}

#[derive(Clone, Copy)]
pub struct Line<'t> {
    pub seq: u64,
    pub kind: LineKind,
    pub task: &'t TaskTree,
    pub frame: &'t Frame,
}

impl Line<'_> {
    /// Timestamp the line refers to.
    pub fn timestamp(&self) -> u64 {
        match self.kind {
            LineKind::Entry | LineKind::Leaf | LineKind::Mark => {
                self.frame.entry_ts.unwrap_or_default()
            }
            _ => self.frame.exit_ts.unwrap_or_default(),
        }
    }
}

/// Result of one replay: per-task trees with visibility decided.
pub struct CallTree {
    tasks: BTreeMap<u32, TaskTree>,
    pub dropped_tasks: Vec<u32>,
}

impl CallTree {
    pub fn task(&self, task_id: u32) -> Option<&TaskTree> {
        self.tasks.get(&task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskTree> {
        self.tasks.values()
    }

    /// Output lines of every task in replay order.
    pub fn lines(&self) -> Vec<Line<'_>> {
        let mut lines = Vec::new();
        for task in self.tasks.values() {
            for frame in task.frames.iter().filter(|f| f.visible) {
                let mut push = |seq: u64, kind: LineKind| {
                    lines.push(Line {
                        seq,
                        kind,
                        task,
                        frame,
                    })
                };
                if frame.kind == FrameKind::Mark {
                    push(frame.entry_seq, LineKind::Mark);
                } else if frame.close == Close::Dangling || frame.inherited {
                    if let Some(seq) = frame.exit_seq {
                        push(seq, LineKind::DanglingExit);
                    }
                } else if task.is_leaf(frame) {
                    push(frame.entry_seq, LineKind::Leaf);
                } else {
                    push(frame.entry_seq, LineKind::Entry);
                    if let Some(seq) = frame.exit_seq {
                        let kind = if frame.closed_by_exit() {
                            LineKind::Exit
                        } else {
                            LineKind::ImplicitExit
                        };
                        push(seq, kind);
                    }
                }
            }
        }
        lines.sort_by_key(|line| line.seq);
        lines
    }

    /// Diagnostic blocks of tasks that stopped with open frames.
    pub fn terminals(&self) -> Vec<&TerminalBlock> {
        self.tasks
            .values()
            .filter_map(|t| t.terminal.as_ref())
            .filter(|block| !block.frames.is_empty())
            .collect()
    }
}

/// Budget and filter state handed from a frame to its children.
#[derive(Clone, Copy)]
struct Scope {
    included: bool,
    budget: Option<usize>,
    threshold: Option<u64>,
    parent_visible: bool,
    depth: usize,
}

fn decide_visibility(tree: &mut TaskTree, id: FrameId, scope: Scope, config: &ReplayConfig) {
    let (visible, child_scope) = {
        let frame = &tree.frames[id];
        if config.is_excluded(&frame.name) {
            hide_subtree(tree, id);
            return;
        }
        let matched = config.is_included(&frame.name);
        let included = scope.included || matched;
        let mut budget = if matched { config.max_depth } else { scope.budget };
        if frame.budget.is_some() {
            budget = frame.budget;
        }
        let threshold = frame.threshold.or(scope.threshold);
        let event = frame.is_event();

        let within_depth = if event {
            scope.parent_visible
        } else {
            budget.map_or(true, |b| b > 0)
        };
        let long_enough = match (threshold, frame.duration()) {
            (Some(t), Some(d)) if frame.closed_by_exit() && !event => d >= t,
            _ => true,
        };
        let visible = included && frame.traced && within_depth && long_enough;

        let child_scope = Scope {
            included,
            budget: if event {
                budget
            } else {
                budget.map(|b| b.saturating_sub(1))
            },
            threshold,
            parent_visible: visible,
            depth: scope.depth + usize::from(visible),
        };
        (visible, child_scope)
    };

    let frame = &mut tree.frames[id];
    frame.visible = visible;
    frame.visible_depth = scope.depth;
    let children = frame.children.clone();
    for child in children {
        decide_visibility(tree, child, child_scope, config);
    }
}

fn hide_subtree(tree: &mut TaskTree, id: FrameId) {
    let mut pending = vec![id];
    while let Some(id) = pending.pop() {
        let frame = &mut tree.frames[id];
        frame.visible = false;
        pending.extend(frame.children.iter().copied());
    }
}

/// Callback context for script hooks.
#[derive(Clone, Debug, PartialEq)]
pub struct HookContext<'a> {
    pub tid: i32,
    pub depth: usize,
    pub timestamp: u64,
    pub duration: Option<u64>,
    pub name: &'a str,
    /// Arguments selected for display, rendered.
    pub args: Option<Vec<String>>,
    pub retval: Option<String>,
}

/// External per-call callback. Invoked synchronously in output order.
pub trait ScriptHook {
    fn entry(&mut self, ctx: &HookContext<'_>) -> Result<()>;
    fn exit(&mut self, ctx: &HookContext<'_>) -> Result<()>;
}

fn hook_context<'t>(line: &Line<'t>, config: &ReplayConfig, exit: bool) -> HookContext<'t> {
    let frame = line.frame;
    let args = if exit {
        None
    } else {
        frame
            .args
            .as_ref()
            .and_then(|args| config.display_args(&frame.name, args))
    };
    let retval = if exit {
        frame
            .retval
            .as_ref()
            .and_then(|r| config.display_retval(&frame.name, r))
    } else {
        None
    };
    HookContext {
        tid: line.task.tid,
        depth: frame.visible_depth,
        timestamp: if exit {
            frame.exit_ts.unwrap_or_default()
        } else {
            frame.entry_ts.unwrap_or_default()
        },
        duration: if exit { frame.duration() } else { None },
        name: &frame.name,
        args,
        retval,
    }
}

/// Feed every visible call of `tree` to `hook`.
pub fn run_hooks(tree: &CallTree, config: &ReplayConfig, hook: &mut dyn ScriptHook) -> Result<()> {
    for line in tree.lines() {
        match line.kind {
            LineKind::Entry => hook.entry(&hook_context(&line, config, false))?,
            LineKind::Leaf => {
                hook.entry(&hook_context(&line, config, false))?;
                hook.exit(&hook_context(&line, config, true))?;
            }
            LineKind::Exit | LineKind::ImplicitExit | LineKind::DanglingExit => {
                hook.exit(&hook_context(&line, config, true))?
            }
            LineKind::Mark => {}
        }
    }
    Ok(())
}

/// Incremental call-tree builder.
pub struct Replayer<'a> {
    session: &'a Session,
    config: &'a ReplayConfig,
    tasks: BTreeMap<u32, TaskTree>,
    seq: u64,
    /// Events fed so far, for diagnostics.
    fed: usize,
    dropped_tasks: Vec<u32>,
}

impl<'a> Replayer<'a> {
    pub fn new(session: &'a Session, config: &'a ReplayConfig) -> Self {
        Self {
            session,
            config,
            tasks: BTreeMap::new(),
            seq: 0,
            fed: 0,
            dropped_tasks: Vec::new(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Start a task's tree, copying the open frames of its parent.
    fn start_task(&mut self, task_id: u32, tid: i32, parent: Option<u32>) {
        let mut tree = TaskTree::new(task_id, tid);
        if let Some(parent) = parent.and_then(|p| self.tasks.get(&p)) {
            for &id in &parent.stack {
                let src = &parent.frames[id];
                let mut frame = new_frame(&src.name, src.kind, src.entry_ts, src.entry_seq);
                frame.args = src.args.clone();
                frame.inherited = true;
                frame.traced = src.traced;
                frame.budget = src.budget;
                frame.threshold = src.threshold;
                let id = tree.add(frame);
                tree.stack.push(id);
            }
            tree.tracing = parent.tracing;
            tree.last_ts = parent.last_ts;
            debug!(
                "task {} inherits {} open frames from task {}",
                task_id,
                tree.stack.len(),
                parent.task_id
            );
        }
        self.tasks.insert(task_id, tree);
    }

    pub fn feed(&mut self, event: Event) {
        let record = self.fed;
        self.fed += 1;
        let session = self.session;
        let Some(task) = session.task(event.task_id) else {
            warn!(
                "{}",
                TraceError::UnknownTask {
                    task_id: event.task_id,
                    record,
                }
            );
            return;
        };
        if !self.tasks.contains_key(&event.task_id) {
            self.start_task(task.task_id, task.tid, task.parent_task_id);
        }
        let seq = self.next_seq();
        let config = self.config;
        let Some(tree) = self.tasks.get_mut(&event.task_id) else {
            return;
        };
        if tree.corrupt || tree.terminal.is_some() {
            debug!(
                "task {}: ignoring {} {} after the task stopped",
                tree.task_id, event.kind, event.function_ref
            );
            return;
        }
        tree.last_ts = tree.last_ts.max(event.timestamp);

        let result = match event.kind {
            EventKind::Entry | EventKind::KernelEntry => {
                enter(tree, event, seq, config, &mut self.seq)
            }
            EventKind::Exit | EventKind::KernelExit => exit(tree, event, seq, &mut self.seq),
            EventKind::EventMark => {
                let stop = event.function_ref == TASK_EXIT_EVENT;
                let mut frame =
                    new_frame(&event.function_ref, FrameKind::Mark, Some(event.timestamp), seq);
                frame.exit_ts = Some(event.timestamp);
                frame.traced = tree.tracing;
                frame.args = event.args;
                tree.add(frame);
                if stop {
                    interrupt(tree, Terminal::Interrupted, &mut self.seq);
                }
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!("{}, dropping task", err);
            tree.corrupt = true;
            self.dropped_tasks.push(tree.task_id);
        }
    }

    /// Close what is still open and decide visibility.
    pub fn finish(mut self) -> CallTree {
        let mut tasks = BTreeMap::new();
        for (task_id, mut tree) in std::mem::take(&mut self.tasks) {
            if tree.corrupt {
                continue;
            }
            if tree.terminal.is_none() && tree.stack.iter().any(|&id| !tree.frames[id].inherited) {
                interrupt(&mut tree, Terminal::Unfinished, &mut self.seq);
            }
            let scope = Scope {
                included: self.config.filters.is_empty(),
                budget: self.config.max_depth,
                threshold: self.config.time_threshold,
                parent_visible: true,
                depth: 0,
            };
            let roots = tree.roots.clone();
            for root in roots {
                decide_visibility(&mut tree, root, scope, self.config);
            }
            tasks.insert(task_id, tree);
        }
        CallTree {
            tasks,
            dropped_tasks: self.dropped_tasks,
        }
    }
}

fn parse_recorded_trigger(tree: &TaskTree, tag: &str) -> Vec<TriggerAction> {
    tag.split(',')
        .filter_map(|action| match action.parse() {
            Ok(action) => Some(action),
            Err(err) => {
                warn!("task {}: ignoring recorded trigger: {}", tree.task_id, err);
                None
            }
        })
        .collect()
}

fn enter(
    tree: &mut TaskTree,
    event: Event,
    seq: u64,
    config: &ReplayConfig,
    seq_counter: &mut u64,
) -> Result<(), TraceError> {
    let kernel = event.kind.is_kernel();
    if !kernel && tree.top().is_some_and(|f| f.kind == FrameKind::Kernel) {
        return Err(TraceError::corrupt(
            Some(tree.task_id),
            None,
            format!("user entry {} inside an open kernel frame", event.function_ref),
        ));
    }

    let mut actions: Vec<TriggerAction> = config.triggers_for(&event.function_ref).collect();
    if let Some(tag) = &event.trigger {
        actions.extend(parse_recorded_trigger(tree, tag));
    }

    let kind = if kernel {
        FrameKind::Kernel
    } else {
        FrameKind::User
    };
    let mut frame = new_frame(&event.function_ref, kind, Some(event.timestamp), seq);
    frame.args = event.args;

    let mut finish = false;
    for action in &actions {
        match *action {
            TriggerAction::Finish => finish = true,
            TriggerAction::Depth(n) => frame.budget = Some(n),
            TriggerAction::Time(t) => frame.threshold = Some(t),
            TriggerAction::TraceOff => tree.tracing = false,
            TriggerAction::TraceOn => tree.tracing = true,
        }
    }
    frame.traced = tree.tracing;

    let id = tree.add(frame);
    tree.stack.push(id);
    if finish {
        debug!("task {}: finish triggered by {}", tree.task_id, event.function_ref);
        interrupt(tree, Terminal::Interrupted, seq_counter);
    }
    Ok(())
}

fn exit(
    tree: &mut TaskTree,
    event: Event,
    seq: u64,
    seq_counter: &mut u64,
) -> Result<(), TraceError> {
    let kernel = event.kind.is_kernel();
    let wanted = if kernel {
        FrameKind::Kernel
    } else {
        FrameKind::User
    };
    let position = tree
        .stack
        .iter()
        .rposition(|&id| {
            let f = &tree.frames[id];
            f.kind == wanted && f.name == event.function_ref
        });

    let crosses = match tree.top() {
        Some(top) if !kernel => top.kind == FrameKind::Kernel,
        Some(top) if kernel => top.kind == FrameKind::User && position.is_some(),
        _ => false,
    };
    if crosses {
        return Err(TraceError::corrupt(
            Some(tree.task_id),
            None,
            format!("{} {} crosses a kernel/user frame boundary", event.kind, event.function_ref),
        ));
    }

    let Some(position) = position else {
        warn!(
            "task {}: {} {} matches no open frame",
            tree.task_id, event.kind, event.function_ref
        );
        let mut frame = new_frame(&event.function_ref, wanted, None, seq);
        frame.exit_ts = Some(event.timestamp);
        frame.exit_seq = Some(seq);
        frame.retval = event.retval;
        frame.close = Close::Dangling;
        frame.traced = tree.tracing;
        tree.add(frame);
        return Ok(());
    };

    let implicit = tree.stack.len() - position - 1;
    if implicit > 0 {
        warn!(
            "task {}: exit of {} closes {} inner frames",
            tree.task_id, event.function_ref, implicit
        );
    }
    while tree.stack.len() > position + 1 {
        if let Some(id) = tree.stack.pop() {
            *seq_counter += 1;
            let frame = &mut tree.frames[id];
            frame.close = Close::Implicit;
            frame.exit_ts = Some(event.timestamp);
            frame.exit_seq = Some(*seq_counter);
        }
    }
    if let Some(id) = tree.stack.pop() {
        *seq_counter += 1;
        let frame = &mut tree.frames[id];
        frame.close = Close::Normal;
        frame.exit_ts = Some(event.timestamp);
        frame.exit_seq = Some(*seq_counter);
        frame.retval = event.retval;
    }
    Ok(())
}

/// Close every open frame of the task, innermost first, and stop it.
fn interrupt(tree: &mut TaskTree, kind: Terminal, seq_counter: &mut u64) {
    let close = match kind {
        Terminal::Interrupted => Close::Interrupted,
        Terminal::Unfinished => Close::Unfinished,
    };
    let mut frames = Vec::new();
    while let Some(id) = tree.stack.pop() {
        let frame = &mut tree.frames[id];
        if frame.inherited {
            continue;
        }
        *seq_counter += 1;
        frame.close = close;
        frame.exit_ts = Some(tree.last_ts);
        frame.exit_seq = Some(*seq_counter);
        frames.push((frame.depth, frame.name.clone()));
    }
    tree.terminal = Some(TerminalBlock {
        kind,
        tid: tree.tid,
        frames,
    });
}

/// Replay a merged event sequence into a call tree.
pub fn replay<I>(session: &Session, events: I, config: &ReplayConfig) -> CallTree
where
    I: IntoIterator<Item = Event>,
{
    let mut replayer = Replayer::new(session, config);
    for event in events {
        replayer.feed(event);
    }
    replayer.finish()
}
