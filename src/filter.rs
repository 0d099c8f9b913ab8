//! Replay configuration: name patterns, triggers, capture selectors.
//!
//! Options arrive as strings (command line or a JSON config file) in
//! [`ReplayOptions`] and are compiled once into a [`ReplayConfig`]. Every
//! problem is reported as [`TraceError::ConfigError`] before any session is
//! touched.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TraceError;
use crate::trace::{ArgFormat, ArgValue};

const REGEX_META: &[char] = &['^', '$', '.', '[', ']', '(', ')', '|', '*', '+', '?', '{', '}', '\\'];
const GLOB_META: &[char] = &['*', '?', '['];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    #[default]
    Regex,
    Glob,
}

impl FromStr for MatchType {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regex" => Ok(MatchType::Regex),
            "glob" => Ok(MatchType::Glob),
            _ => Err(TraceError::config("match type", format!("unknown match type {s:?}"))),
        }
    }
}

#[derive(Clone, Debug)]
enum Matcher {
    Exact(String),
    Regex(Regex),
}

/// A function name pattern.
///
/// Plain names match exactly, so `-F a` does not select `main`. Anything with
/// pattern metacharacters is a regex search (`^operator`) or, in glob mode, a
/// whole-name glob.
#[derive(Clone, Debug)]
pub struct Pattern {
    source: String,
    matcher: Matcher,
}

fn glob_to_regex(glob: &str) -> String {
    let mut re = String::from("^");
    let mut in_class = false;
    for c in glob.chars() {
        match c {
            '*' if !in_class => re.push_str(".*"),
            '?' if !in_class => re.push('.'),
            '[' if !in_class => {
                in_class = true;
                re.push('[');
            }
            ']' if in_class => {
                in_class = false;
                re.push(']');
            }
            c if in_class => re.push(c),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    re
}

impl Pattern {
    pub fn new(source: &str, match_type: MatchType) -> Result<Self, TraceError> {
        if source.is_empty() {
            return Err(TraceError::config("pattern", "empty pattern"));
        }
        let matcher = match match_type {
            MatchType::Regex if source.contains(REGEX_META) => Matcher::Regex(
                Regex::new(source).map_err(|e| TraceError::config("pattern", e.to_string()))?,
            ),
            MatchType::Glob if source.contains(GLOB_META) => Matcher::Regex(
                Regex::new(&glob_to_regex(source))
                    .map_err(|e| TraceError::config("pattern", e.to_string()))?,
            ),
            _ => Matcher::Exact(source.to_string()),
        };
        Ok(Self {
            source: source.to_string(),
            matcher,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        match &self.matcher {
            Matcher::Exact(s) => s == name,
            Matcher::Regex(re) => re.is_match(name),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Parse a duration such as `1ms`, `2.5us` or `1500` (nanoseconds).
pub fn parse_time(spec: &str) -> Result<u64, TraceError> {
    let spec = spec.trim();
    let split = spec
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(spec.len());
    let (number, unit) = spec.split_at(split);
    let scale: f64 = match unit {
        "" | "ns" | "nsec" => 1.0,
        "us" | "usec" => 1e3,
        "ms" | "msec" => 1e6,
        "s" | "sec" => 1e9,
        "m" | "min" => 60e9,
        _ => {
            return Err(TraceError::config(
                "time",
                format!("unknown unit {unit:?} in {spec:?}"),
            ))
        }
    };
    let value: f64 = number
        .parse()
        .map_err(|_| TraceError::config("time", format!("invalid time {spec:?}")))?;
    Ok((value * scale).round() as u64)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerAction {
    /// Stop tracing the task: every open frame gets an implicit exit.
    Finish,
    /// Grant the matched frame a fresh depth budget.
    Depth(usize),
    /// Time threshold for the matched frame's subtree.
    Time(u64),
    TraceOff,
    TraceOn,
}

impl FromStr for TriggerAction {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (key, value) = match s.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (s, None),
        };
        let bad = |msg: String| TraceError::config("trigger", msg);
        match (key, value) {
            ("finish", None) => Ok(TriggerAction::Finish),
            ("trace_off" | "trace-off", None) => Ok(TriggerAction::TraceOff),
            ("trace_on" | "trace-on", None) => Ok(TriggerAction::TraceOn),
            ("depth", Some(v)) => match v.parse::<usize>() {
                Ok(d) if d > 0 => Ok(TriggerAction::Depth(d)),
                _ => Err(bad(format!("invalid depth {v:?}"))),
            },
            ("time", Some(v)) => Ok(TriggerAction::Time(parse_time(v)?)),
            _ => Err(bad(format!("unknown trigger action {s:?}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TriggerRule {
    pub pattern: Pattern,
    pub actions: Vec<TriggerAction>,
}

impl TriggerRule {
    /// Parse `PATTERN@action[,action...]`.
    pub fn parse(spec: &str, match_type: MatchType) -> Result<Self, TraceError> {
        let (pattern, actions) = spec
            .rsplit_once('@')
            .ok_or_else(|| TraceError::config("trigger", format!("missing '@' in {spec:?}")))?;
        let actions = actions
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<TriggerAction>, _>>()?;
        Ok(Self {
            pattern: Pattern::new(pattern, match_type)?,
            actions,
        })
    }
}

/// Which captured values to display for matching functions.
#[derive(Clone, Debug)]
pub struct ArgSelector {
    pub pattern: Pattern,
    /// 1-based argument indices with their display format.
    pub args: Vec<(usize, ArgFormat)>,
    pub retval: Option<ArgFormat>,
}

fn split_format(token: &str) -> Result<(&str, ArgFormat), TraceError> {
    match token.split_once('/') {
        Some((name, fmt)) => {
            let format = ArgFormat::from_suffix(fmt).ok_or_else(|| {
                TraceError::config("argument", format!("unknown format {fmt:?} in {token:?}"))
            })?;
            Ok((name, format))
        }
        None => Ok((token, ArgFormat::Auto)),
    }
}

impl ArgSelector {
    /// Parse `PATTERN@arg1[/fmt],arg2,...` or `PATTERN@retval[/fmt]`.
    pub fn parse(spec: &str, match_type: MatchType) -> Result<Self, TraceError> {
        let (pattern, tokens) = spec
            .rsplit_once('@')
            .ok_or_else(|| TraceError::config("argument", format!("missing '@' in {spec:?}")))?;
        let mut selector = Self {
            pattern: Pattern::new(pattern, match_type)?,
            args: Vec::new(),
            retval: None,
        };
        for token in tokens.split(',') {
            let (name, format) = split_format(token.trim())?;
            if name == "retval" {
                selector.retval = Some(format);
            } else if let Some(index) = name.strip_prefix("arg") {
                match index.parse::<usize>() {
                    Ok(i) if i > 0 => selector.args.push((i, format)),
                    _ => {
                        return Err(TraceError::config(
                            "argument",
                            format!("invalid argument index in {token:?}"),
                        ))
                    }
                }
            } else if matches!(name, "plt" | "kernel") {
                // Record-time location modifiers, nothing to select.
                debug!("ignoring capture modifier {} in {}", name, spec);
            } else {
                return Err(TraceError::config(
                    "argument",
                    format!("unknown capture token {token:?}"),
                ));
            }
        }
        Ok(selector)
    }
}

/// Raw replay options as given on the command line or in a config file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayOptions {
    pub filter: Vec<String>,
    pub notrace: Vec<String>,
    pub trigger: Vec<String>,
    pub argument: Vec<String>,
    pub retval: Vec<String>,
    pub depth: Option<usize>,
    pub time_filter: Option<String>,
    pub tid: Vec<i32>,
    pub match_type: Option<MatchType>,
    pub follow_ms: Option<u64>,
    pub no_comment: bool,
}

impl ReplayOptions {
    pub fn load(path: &Path) -> Result<Self> {
        let buf = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let options = serde_json::from_str(&buf)
            .map_err(|e| TraceError::config("config file", format!("{}: {e}", path.display())))?;
        Ok(options)
    }

    /// Layer `self` (usually the command line) over `base` (a config file).
    /// Lists are concatenated, scalars from `self` win when set.
    pub fn over(self, base: ReplayOptions) -> ReplayOptions {
        let concat = |mut a: Vec<String>, b: Vec<String>| {
            a.extend(b);
            a
        };
        let mut tid = base.tid;
        tid.extend(self.tid);
        ReplayOptions {
            filter: concat(base.filter, self.filter),
            notrace: concat(base.notrace, self.notrace),
            trigger: concat(base.trigger, self.trigger),
            argument: concat(base.argument, self.argument),
            retval: concat(base.retval, self.retval),
            depth: self.depth.or(base.depth),
            time_filter: self.time_filter.or(base.time_filter),
            tid,
            match_type: self.match_type.or(base.match_type),
            follow_ms: self.follow_ms.or(base.follow_ms),
            no_comment: self.no_comment || base.no_comment,
        }
    }
}

/// Compiled replay configuration.
#[derive(Clone, Debug, Default)]
pub struct ReplayConfig {
    pub filters: Vec<Pattern>,
    pub notrace: Vec<Pattern>,
    pub triggers: Vec<TriggerRule>,
    pub selectors: Vec<ArgSelector>,
    pub time_threshold: Option<u64>,
    pub max_depth: Option<usize>,
    pub tids: Vec<i32>,
    pub follow: Option<Duration>,
    pub no_comment: bool,
}

impl ReplayConfig {
    pub fn from_options(options: &ReplayOptions) -> Result<Self, TraceError> {
        let match_type = options.match_type.unwrap_or_default();
        let patterns = |specs: &[String]| {
            specs
                .iter()
                .map(|s| Pattern::new(s, match_type))
                .collect::<Result<Vec<_>, _>>()
        };

        let mut selectors = Vec::new();
        for spec in options.argument.iter().chain(options.retval.iter()) {
            selectors.push(ArgSelector::parse(spec, match_type)?);
        }

        if options.depth == Some(0) {
            return Err(TraceError::config("depth", "depth must be at least 1"));
        }
        let time_threshold = match &options.time_filter {
            Some(t) => Some(parse_time(t)?),
            None => None,
        };

        Ok(Self {
            filters: patterns(&options.filter)?,
            notrace: patterns(&options.notrace)?,
            triggers: options
                .trigger
                .iter()
                .map(|s| TriggerRule::parse(s, match_type))
                .collect::<Result<Vec<_>, _>>()?,
            selectors,
            time_threshold,
            max_depth: options.depth,
            tids: options.tid.clone(),
            follow: options.follow_ms.map(Duration::from_millis),
            no_comment: options.no_comment,
        })
    }

    pub fn is_included(&self, name: &str) -> bool {
        self.filters.iter().any(|p| p.matches(name))
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.notrace.iter().any(|p| p.matches(name))
    }

    /// Trigger actions for a function, in rule order.
    pub fn triggers_for<'a>(&'a self, name: &'a str) -> impl Iterator<Item = TriggerAction> + 'a {
        self.triggers
            .iter()
            .filter(move |rule| rule.pattern.matches(name))
            .flat_map(|rule| rule.actions.iter().copied())
    }

    /// Rendered arguments to display for `name`, or `None` to hide them.
    pub fn display_args(&self, name: &str, args: &[ArgValue]) -> Option<Vec<String>> {
        if self.selectors.is_empty() {
            return Some(args.iter().map(|a| a.render(ArgFormat::Auto)).collect());
        }
        let mut picked: Vec<(usize, ArgFormat)> = self
            .selectors
            .iter()
            .filter(|s| s.pattern.matches(name))
            .flat_map(|s| s.args.iter().copied())
            .collect();
        if picked.is_empty() {
            return None;
        }
        picked.sort_by_key(|(i, _)| *i);
        picked.dedup_by_key(|(i, _)| *i);
        Some(
            picked
                .into_iter()
                .filter_map(|(i, fmt)| args.get(i - 1).map(|a| a.render(fmt)))
                .collect(),
        )
    }

    /// Rendered return value to display for `name`, if selected.
    pub fn display_retval(&self, name: &str, retval: &ArgValue) -> Option<String> {
        if self.selectors.is_empty() {
            return Some(retval.render(ArgFormat::Auto));
        }
        self.selectors
            .iter()
            .filter(|s| s.pattern.matches(name))
            .find_map(|s| s.retval)
            .map(|fmt| retval.render(fmt))
    }
}
