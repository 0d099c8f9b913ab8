//! Shared constants for session handling.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

/// Session metadata file inside a session directory.
pub const INFO_FILE: &str = "info";

/// Task registry file inside a session directory.
pub const REGISTRY_FILE: &str = "task.txt";

/// Default session directory name used by the CLI.
pub const DEFAULT_SESSION_DIR: &str = "calltree.data";

/// Extension of a user task stream (`<task_id>.dat`).
pub const STREAM_EXT: &str = "dat";

/// Suffix of the optional per-task kernel stream (`<task_id>.kernel.dat`).
pub const KERNEL_STREAM_SUFFIX: &str = "kernel.dat";

/// Default TCP port for `recv`/`send`.
pub const DEFAULT_PORT: u16 = 8090;

/// Largest network frame payload accepted by the receiver.
pub const MAX_FRAME_SIZE: usize = 16 << 20;

/// Read timeout applied to every receiver connection.
pub const NET_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a follower re-checks a growing stream file.
pub const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Kernel event observed when a traced task exits.
pub const TASK_EXIT_EVENT: &str = "linux:task-exit";

/// How many bytes from the end of a stream are inspected to classify it.
pub const STREAM_TAIL_PROBE: u64 = 4096;

/// Names shaped like `provider:event` are kernel/user events rather than
/// functions and print as comments.
pub static EVENT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_]+:[A-Za-z0-9_\-]+$").expect("Invalid event name regex pattern")
});

/// Stream file names: `<task_id>.dat` or `<task_id>.kernel.dat`.
pub static STREAM_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)(\.kernel)?\.dat$").expect("Invalid stream file regex pattern")
});
