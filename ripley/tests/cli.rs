//! Process-level smoke tests for both binaries: exit codes and stdout
//! shape, driven entirely through stdin/stdout rather than linking the
//! library, so these exercise exactly what an operator invokes.

use assert_cmd::Command;
use predicates::prelude::*;

fn line(method: &str, url: &str, timestamp: &str) -> String {
    format!(r#"{{"method":"{method}","url":"{url}","timestamp":"{timestamp}"}}"#)
}

#[test]
fn ripley_dry_run_exits_zero_with_one_result_per_line() {
    let input = [
        line("GET", "http://h/a", "2021-01-01T00:00:00Z"),
        line("GET", "http://h/b", "2021-01-01T00:00:00.1Z"),
    ]
    .join("\n");

    Command::cargo_bin("ripley")
        .unwrap()
        .args(["--dry-run", "--pace", "1h@1000"])
        .write_stdin(input)
        .assert()
        .code(0)
        .stdout(predicate::function(|out: &str| out.lines().count() == 2));
}

#[test]
fn ripley_non_strict_bad_input_exits_126() {
    Command::cargo_bin("ripley")
        .unwrap()
        .args(["--dry-run", "--pace", "1h@1000"])
        .write_stdin(r#"{"method":"NOPE"}"#)
        .assert()
        .code(126);
}

#[test]
fn ripley_strict_bad_input_exits_2() {
    Command::cargo_bin("ripley")
        .unwrap()
        .args(["--dry-run", "--pace", "1h@1000", "--strict"])
        .write_stdin(r#"{"method":"NOPE"}"#)
        .assert()
        .code(2);
}

#[test]
fn ripley_bad_pace_program_exits_2_before_touching_stdin() {
    Command::cargo_bin("ripley")
        .unwrap()
        .args(["--pace", "not-a-pace-program"])
        .write_stdin("")
        .assert()
        .code(2);
}

#[test]
fn ripleysort_reorders_within_buffer_len() {
    let input = [
        line("GET", "http://h/a", "2021-01-01T18:55:00Z"),
        line("GET", "http://h/b", "2021-01-01T18:51:00Z"),
        line("GET", "http://h/c", "2021-01-01T18:56:00Z"),
    ]
    .join("\n");

    Command::cargo_bin("ripleysort")
        .unwrap()
        .args(["--buffer-len", "1"])
        .write_stdin(input)
        .assert()
        .code(0)
        .stdout(predicate::function(|out: &str| {
            let timestamps: Vec<&str> = out
                .lines()
                .filter_map(|l| l.split("\"timestamp\":\"").nth(1))
                .filter_map(|rest| rest.split('"').next())
                .collect();
            timestamps.len() == 3 && timestamps.windows(2).all(|w| w[0] <= w[1])
        }));
}

#[test]
fn ripleysort_non_strict_out_of_order_exits_126() {
    let input = [
        line("GET", "http://h/a", "2021-01-01T18:55:00Z"),
        line("GET", "http://h/b", "2021-01-01T18:51:00Z"),
    ]
    .join("\n");

    Command::cargo_bin("ripleysort")
        .unwrap()
        .write_stdin(input)
        .assert()
        .code(126);
}

#[test]
fn ripleysort_strict_out_of_order_exits_2() {
    let input = [
        line("GET", "http://h/a", "2021-01-01T18:55:00Z"),
        line("GET", "http://h/b", "2021-01-01T18:51:00Z"),
    ]
    .join("\n");

    Command::cargo_bin("ripleysort")
        .unwrap()
        .arg("--strict")
        .write_stdin(input)
        .assert()
        .code(2);
}
