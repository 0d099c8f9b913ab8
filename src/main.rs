use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use calltree::collector::{Collector, Source};
use calltree::filter::{MatchType, ReplayConfig, ReplayOptions};
use calltree::merge::{merge, MergeOptions};
use calltree::net::{connect_and_send, Receiver};
use calltree::output::{self, ChromeEncoder, TextEncoder};
use calltree::replay::replay;
use calltree::session::{Registry, SessionInfo};
use calltree::trace::constants::{DEFAULT_PORT, DEFAULT_SESSION_DIR};

#[derive(Parser)]
#[command(name = "calltree")]
#[command(about = "Replay recorded function call traces")]
#[command(version)]
struct Cli {
    /// Log debug details to stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// Session directory
    #[arg(short = 'd', long = "data", default_value = DEFAULT_SESSION_DIR)]
    data: PathBuf,

    /// Only show functions matching the pattern (and what they call)
    #[arg(short = 'F', long)]
    filter: Vec<String>,

    /// Hide functions matching the pattern and what they call
    #[arg(short = 'N', long)]
    notrace: Vec<String>,

    /// Trigger actions, PATTERN@action[,action]
    #[arg(short = 'T', long)]
    trigger: Vec<String>,

    /// Maximum call depth below each filter match
    #[arg(short = 'D', long)]
    depth: Option<usize>,

    /// Hide calls shorter than TIME (e.g. 100us, 1ms)
    #[arg(short = 't', long = "time-filter")]
    time_filter: Option<String>,

    /// Arguments to show, PATTERN@argN[/fmt][,argM]
    #[arg(short = 'A', long)]
    argument: Vec<String>,

    /// Return values to show, PATTERN@retval[/fmt]
    #[arg(short = 'R', long)]
    retval: Vec<String>,

    /// How patterns are interpreted
    #[arg(long = "match")]
    match_type: Option<MatchType>,

    /// Only replay these thread ids
    #[arg(long, value_delimiter = ',')]
    tid: Vec<i32>,

    /// JSON file with replay options, command line flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Wait up to MS milliseconds for streams that are still being written
    #[arg(long, value_name = "MS")]
    follow: Option<u64>,

    /// Omit the function name comment on closing lines
    #[arg(long)]
    no_comment: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the call graph of a session
    Replay(ReplayArgs),

    /// Print the merged raw events, or trace-event JSON with --chrome
    Dump {
        #[command(flatten)]
        replay: ReplayArgs,

        /// Emit trace-event JSON for chrome://tracing
        #[arg(long)]
        chrome: bool,
    },

    /// Receive sessions from remote recorders
    Recv {
        /// Directory received sessions are written below
        #[arg(short = 'd', long = "data", default_value = ".")]
        data: PathBuf,

        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
    },

    /// Send a recorded session to a receiver
    Send {
        #[arg(short = 'H', long)]
        host: String,

        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[arg(short = 'd', long = "data", default_value = DEFAULT_SESSION_DIR)]
        data: PathBuf,

        /// Session name on the receiver (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Show session metadata and tasks
    Info {
        #[arg(short = 'd', long = "data", default_value = DEFAULT_SESSION_DIR)]
        data: PathBuf,
    },
}

enum Mode {
    Text,
    Chrome,
    Raw,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(io::stderr)
        .init();
}

fn load_config(args: &ReplayArgs) -> Result<ReplayConfig> {
    let cli = ReplayOptions {
        filter: args.filter.clone(),
        notrace: args.notrace.clone(),
        trigger: args.trigger.clone(),
        argument: args.argument.clone(),
        retval: args.retval.clone(),
        depth: args.depth,
        time_filter: args.time_filter.clone(),
        tid: args.tid.clone(),
        match_type: args.match_type,
        follow_ms: args.follow,
        no_comment: args.no_comment,
    };
    let options = match &args.config {
        Some(path) => cli.over(ReplayOptions::load(path)?),
        None => cli,
    };
    Ok(ReplayConfig::from_options(&options)?)
}

fn run_replay(args: &ReplayArgs, mode: Mode) -> Result<()> {
    // Options are validated before the session is touched.
    let config = load_config(args)?;
    let session = Collector::ingest(Source::Local(args.data.clone()))?;
    if session.incomplete() {
        warn!("session {} is incomplete", session.dir().display());
    }
    for child in session.child_dirs() {
        info!("child session {} is replayed separately", child.display());
    }

    let options = MergeOptions {
        tids: config.tids.clone(),
        follow: config.follow,
    };
    let events = merge(&session, &options);
    let mut out = BufWriter::new(io::stdout().lock());
    match mode {
        Mode::Raw => output::dump_events(&mut out, &session, events),
        Mode::Text => {
            let tree = replay(&session, events, &config);
            let mut encoder = TextEncoder::new(out, &config);
            output::encode(&mut encoder, &session, &tree)
        }
        Mode::Chrome => {
            let tree = replay(&session, events, &config);
            let mut encoder = ChromeEncoder::new(out, &config);
            output::encode(&mut encoder, &session, &tree)
        }
    }
}

fn run_recv(data: &Path, port: u16, bind: &str) -> Result<()> {
    let receiver = Receiver::bind((bind, port), data)?;
    let stop = receiver.stop_handle();
    ctrlc::set_handler(move || {
        info!("received ctrl+c, shutting down");
        stop.store(true, Ordering::SeqCst);
    })?;

    let sessions = receiver.serve()?;
    for dir in sessions {
        println!("received {}", dir.display());
    }
    Ok(())
}

fn print_info(data: &Path) -> Result<()> {
    let info = SessionInfo::load(data)?;
    let registry = Registry::load(data)?;
    let session = Collector::ingest_dir(data)?;
    let mut out = BufWriter::new(io::stdout().lock());

    writeln!(out, "# session {}", data.display())?;
    writeln!(out, "session id     : {}", info.session_id)?;
    writeln!(out, "command line   : {}", info.command_line)?;
    writeln!(out, "recorded time  : {}", info.recorded_time)?;
    if let Some(host) = &info.hostname {
        writeln!(out, "hostname       : {host}")?;
    }
    if let Some(status) = info.exit_status {
        writeln!(out, "exit status    : {status}")?;
    }
    if !info.kernel_events.is_empty() {
        writeln!(out, "kernel events  : {}", info.kernel_events.join(", "))?;
    }
    writeln!(
        out,
        "incomplete     : {}",
        if session.incomplete() { "yes" } else { "no" }
    )?;
    writeln!(out)?;
    writeln!(
        out,
        "# {:>6} {:>8} {:>6} {:>20} {:<9} EXENAME",
        "TASK", "TID", "PARENT", "CREATED", "STREAM"
    )?;
    for task in session.tasks() {
        let parent = task
            .parent_task_id
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        writeln!(
            out,
            "  {:>6} {:>8} {:>6} {:>20} {:<9} {}",
            task.task_id,
            task.tid,
            parent,
            task.creation_time,
            task.state.as_str(),
            task.exename.as_deref().unwrap_or("")
        )?;
    }
    if registry.skipped > 0 {
        writeln!(out, "({} registry lines skipped)", registry.skipped)?;
    }
    if !session.dropped_tasks.is_empty() {
        writeln!(out, "dropped tasks  : {:?}", session.dropped_tasks)?;
    }
    if !info.child_sessions.is_empty() {
        writeln!(out)?;
        writeln!(out, "# child sessions")?;
        for child in &info.child_sessions {
            writeln!(out, "  {child}")?;
        }
    }
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Replay(args) => run_replay(&args, Mode::Text),
        Commands::Dump { replay, chrome } => {
            let mode = if chrome { Mode::Chrome } else { Mode::Raw };
            run_replay(&replay, mode)
        }
        Commands::Recv { data, port, bind } => run_recv(&data, port, &bind),
        Commands::Send {
            host,
            port,
            data,
            name,
        } => connect_and_send(&host, port, &data, name.as_deref()),
        Commands::Info { data } => print_info(&data),
    }
}
