//! Smoke tests for the runhcs binary surface.

use std::process::Command;

fn runhcs() -> Command {
    Command::new(env!("CARGO_BIN_EXE_runhcs"))
}

#[test]
fn help_lists_the_public_subcommands() {
    let output = runhcs().arg("--help").output().expect("run binary");
    assert!(output.status.success());

    let text = String::from_utf8_lossy(&output.stdout);
    for subcommand in [
        "create",
        "start",
        "exec",
        "kill",
        "delete",
        "pause",
        "resume",
        "state",
        "list",
        "create-scratch",
    ] {
        assert!(text.contains(subcommand), "missing {}", subcommand);
    }
    // The internal shims stay hidden.
    assert!(!text.contains("vmshim"));
}

#[test]
fn unknown_subcommands_are_rejected() {
    let output = runhcs().arg("frobnicate").output().expect("run binary");
    assert!(!output.status.success());
}

#[test]
fn failures_print_one_line_and_exit_nonzero() {
    let data_dir = tempfile::tempdir().unwrap();
    let output = runhcs()
        .args(["--data-dir"])
        .arg(data_dir.path())
        .args(["state", "no-such-container"])
        .output()
        .expect("run binary");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().filter(|l| l.starts_with("runhcs:")).collect();
    assert_eq!(lines.len(), 1);
}
