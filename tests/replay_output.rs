//! End-to-end tests of the `replay`, `dump` and `info` commands against
//! session directories written to a temp dir.

mod common;

use std::fs::{self, OpenOptions};
use std::io::Write;

use calltree::session::writer::stream_path;
use calltree::session::{SessionInfo, SessionWriter};
use common::{abc, abc_session, add_tasks, calltree, calltree_err, entry, exit, write_session};
use serde_json::Value;
use tempfile::TempDir;

const ABC: &str = "\
# DURATION    TID     FUNCTION
            [28141] | main() {
            [28141] |   a() {
            [28141] |     b() {
            [28141] |       c() {
   0.753 us [28141] |         getpid();
   1.430 us [28141] |       } /* c */
   1.915 us [28141] |     } /* b */
   2.405 us [28141] |   } /* a */
   4.000 us [28141] | } /* main */
";

const ABC_FROM_A: &str = "\
# DURATION    TID     FUNCTION
            [28141] | a() {
            [28141] |   b() {
            [28141] |     c() {
   0.753 us [28141] |       getpid();
   1.430 us [28141] |     } /* c */
   1.915 us [28141] |   } /* b */
   2.405 us [28141] | } /* a */
";

fn data_arg(dir: &TempDir) -> String {
    dir.path().join("calltree.data").to_string_lossy().to_string()
}

#[test]
fn test_replay_abc() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = data_arg(&dir);
    abc_session(dir.path().join("calltree.data").as_path());

    assert_eq!(calltree(&["replay", "-d", &data]), ABC);
    // Replaying the same session again gives identical output.
    assert_eq!(calltree(&["replay", "-d", &data]), ABC);
}

#[test]
fn test_registry_tid_spelling_is_equivalent() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = data_arg(&dir);
    let session = abc_session(dir.path().join("calltree.data").as_path());

    let registry = session.join("task.txt");
    let text = fs::read_to_string(&registry).unwrap();
    assert!(text.contains(" pid="));
    fs::write(&registry, text.replace(" pid=", " tid=")).unwrap();

    assert_eq!(calltree(&["replay", "-d", &data]), ABC);
}

#[test]
fn test_filter() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = data_arg(&dir);
    abc_session(dir.path().join("calltree.data").as_path());

    assert_eq!(calltree(&["replay", "-d", &data, "-F", "a"]), ABC_FROM_A);
    assert_eq!(
        calltree(&["replay", "-d", &data, "-F", "a*", "--match", "glob"]),
        ABC_FROM_A
    );
}

#[test]
fn test_notrace_turns_parent_into_leaf() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = data_arg(&dir);
    abc_session(dir.path().join("calltree.data").as_path());

    let out = calltree(&["replay", "-d", &data, "-N", "^get"]);
    assert!(out.contains("   1.430 us [28141] |       c();\n"));
    assert!(!out.contains("getpid"));
}

#[test]
fn test_config_file_matches_flags() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = data_arg(&dir);
    abc_session(dir.path().join("calltree.data").as_path());

    let config = dir.path().join("replay.json");
    fs::write(&config, r#"{"filter": ["a"]}"#).unwrap();
    let config = config.to_string_lossy().to_string();
    assert_eq!(calltree(&["replay", "-d", &data, "--config", &config]), ABC_FROM_A);
}

#[test]
fn test_trigger_finish() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = data_arg(&dir);
    abc_session(dir.path().join("calltree.data").as_path());

    let out = calltree(&["replay", "-d", &data, "-F", "main", "-T", "getpid@finish"]);
    assert_eq!(
        out,
        "\
# DURATION    TID     FUNCTION
            [28141] | main() {
            [28141] |   a() {
            [28141] |     b() {
            [28141] |       c() {
            [28141] |         getpid() {

calltree stopped tracing with remaining functions
=================================================
task: 28141
[4] getpid
[3] c
[2] b
[1] a
[0] main
"
    );
}

#[test]
fn test_time_and_depth_filters() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = data_arg(&dir);
    let events = vec![
        entry(1, 0, "main"),
        entry(1, 10, "foo"),
        entry(1, 20, "bar"),
        entry(1, 30, "usleep"),
        exit(1, 2_070_000, "usleep"),
        exit(1, 2_071_020, "bar"),
        exit(1, 2_082_010, "foo"),
        entry(1, 2_082_100, "short"),
        exit(1, 2_082_500, "short"),
        exit(1, 2_083_000, "main"),
    ];
    write_session(
        dir.path().join("calltree.data").as_path(),
        &[(1, 18270, None, 0)],
        &events,
    );

    assert_eq!(
        calltree(&["replay", "-d", &data, "-t", "1ms", "-D", "3"]),
        "\
# DURATION    TID     FUNCTION
            [18270] | main() {
            [18270] |   foo() {
   2.071 ms [18270] |     bar();
   2.082 ms [18270] |   } /* foo */
   2.083 ms [18270] | } /* main */
"
    );
}

#[test]
fn test_invalid_options_fail_before_reading_session() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    // No session exists at all: the option error must win.
    let data = data_arg(&dir);
    let err = calltree_err(&["replay", "-d", &data, "-D", "0"]);
    assert!(err.contains("depth must be at least 1"), "{err}");
    let err = calltree_err(&["replay", "-d", &data, "-t", "10 parsecs"]);
    assert!(err.contains("invalid"), "{err}");
}

#[test]
fn test_fork_child_closes_inherited_frame() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = data_arg(&dir);
    let events = vec![
        entry(1, 10, "main"),
        entry(1, 20, "fork"),
        exit(2, 25, "fork"),
        entry(2, 26, "child"),
        exit(2, 27, "child"),
        exit(1, 30, "fork"),
        exit(1, 40, "main"),
    ];
    write_session(
        dir.path().join("calltree.data").as_path(),
        &[(1, 100, None, 0), (2, 101, Some(1), 25)],
        &events,
    );

    assert_eq!(
        calltree(&["replay", "-d", &data]),
        "\
# DURATION    TID     FUNCTION
            [  100] | main() {
   0.010 us [  100] |   fork();
            [  101] |   } /* fork */
   0.001 us [  101] |   child();
   0.030 us [  100] | } /* main */
"
    );
}

#[test]
fn test_tid_selection() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = data_arg(&dir);
    let mut events = abc(1);
    events.push(entry(2, 50, "worker"));
    events.push(exit(2, 60, "worker"));
    write_session(
        dir.path().join("calltree.data").as_path(),
        &[(1, 28141, None, 0), (2, 28142, None, 40)],
        &events,
    );

    let both = calltree(&["replay", "-d", &data]);
    assert!(both.contains("[28142] | worker();"));
    assert_eq!(calltree(&["replay", "-d", &data, "--tid", "28141"]), ABC);
}

#[test]
fn test_truncated_stream_replays_prefix() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = data_arg(&dir);
    let path = dir.path().join("calltree.data");
    let mut writer = SessionWriter::create(&path, SessionInfo::new("t-abc", "now")).unwrap();
    add_tasks(
        &mut writer,
        &[(1, 28141, None, 0)],
        &[entry(1, 0, "main"), entry(1, 1_000, "a")],
    );
    writer.finish().unwrap();

    let mut stream = OpenOptions::new()
        .append(true)
        .open(stream_path(&path, 1))
        .unwrap();
    write!(stream, "{{\"ts\":1100,\"kind\":\"ent").unwrap();
    drop(stream);

    assert_eq!(
        calltree(&["replay", "-d", &data]),
        "\
# DURATION    TID     FUNCTION
            [28141] | main() {
            [28141] |   a() {

trace ended with unfinished functions
=====================================
task: 28141
[1] a
[0] main
"
    );
    assert!(calltree(&["info", "-d", &data]).contains("truncated"));
}

#[test]
fn test_dump_raw_events() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = data_arg(&dir);
    abc_session(dir.path().join("calltree.data").as_path());

    let out = calltree(&["dump", "-d", &data]);
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 10);
    assert_eq!(lines[0], "0.000000000  28141: [entry] main(0)");
    assert_eq!(lines[4], "0.000001500  28141: [entry] getpid(4)");
    assert_eq!(lines[5], "0.000002253  28141: [exit] getpid(4)");
}

#[test]
fn test_dump_chrome() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = data_arg(&dir);
    abc_session(dir.path().join("calltree.data").as_path());

    let out = calltree(&["dump", "-d", &data, "--chrome", "-F", "a"]);
    let doc: Value = serde_json::from_str(&out).expect("chrome output is not JSON");
    let events = doc["traceEvents"].as_array().unwrap();
    let phases: Vec<&str> = events.iter().map(|e| e["ph"].as_str().unwrap()).collect();
    assert_eq!(phases, vec!["B", "B", "B", "B", "E", "E", "E", "E"]);
    assert_eq!(events[0]["name"], "a");
    assert_eq!(events[0]["pid"], 28141);
    assert_eq!(doc["metadata"]["command_line"], "t-abc");
    assert!(out.starts_with("{\"traceEvents\":[\n{\"ts\":1.000,\"ph\":\"B\""));
}

#[test]
fn test_info_lists_tasks() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = data_arg(&dir);
    abc_session(dir.path().join("calltree.data").as_path());

    let out = calltree(&["info", "-d", &data]);
    assert!(out.contains("command line   : t-abc"));
    assert!(out.contains("incomplete     : no"));
    assert!(out.contains("28141"));
    assert!(out.contains("closed"));
}
