//! Integration tests for the `colloquy` binary

use std::path::Path;

use assert_cmd::Command;
use colloquy::TurnRecord;
use predicates::prelude::*;
use tempfile::TempDir;

fn colloquy(data_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("colloquy").expect("binary should build");
    cmd.arg("--data-dir").arg(data_dir).env_remove("RUST_LOG");
    cmd
}

/// `docs` lists every step with its schema
#[test]
fn test_docs_lists_steps() {
    let data = TempDir::new().unwrap();
    colloquy(data.path())
        .arg("docs")
        .assert()
        .success()
        .stdout(predicate::str::contains("check_prime"))
        .stdout(predicate::str::contains("convert_to_int"))
        .stdout(predicate::str::contains("Parses the given input to an integer."))
        .stdout(predicate::str::contains("\"end_phrase\""));
}

/// `run` converses live over stdin
#[test]
fn test_run_reads_replies_from_stdin() {
    let data = TempDir::new().unwrap();
    colloquy(data.path())
        .arg("run")
        .write_stdin("4\n5\nEnd\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Assistant: Integer 4 is not a prime."))
        .stdout(predicate::str::contains("Assistant: Integer 5 is a prime."))
        .stdout(predicate::str::contains("Result: 1"));

    assert!(data.path().join("logs").join("colloquy.log").exists());
}

/// `steprun` honours `--arg`
#[test]
fn test_steprun_with_custom_end_phrase() {
    let data = TempDir::new().unwrap();
    colloquy(data.path())
        .args(["steprun", "--arg", "end_phrase=Bye"])
        .write_stdin("End\nBye\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Input End is not an integer."))
        .stdout(predicate::str::contains("0 prime number(s) received!"));
}

/// Entry defaults come from config.toml
#[test]
fn test_entry_defaults_from_config() {
    let data = TempDir::new().unwrap();
    std::fs::write(
        data.path().join("config.toml"),
        "[entry]\nend_phrase = \"Quit\"\n",
    )
    .unwrap();
    colloquy(data.path())
        .arg("steprun")
        .write_stdin("7\nQuit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 prime number(s) received!"));
}

/// `step` advances a saved conversation one process at a time
#[test]
fn test_step_resumes_across_processes() {
    let data = TempDir::new().unwrap();
    let record = data.path().join("chat.json");

    colloquy(data.path())
        .args(["step", "--record"])
        .arg(&record)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Enter an integer, and I will tell you if it is a prime number.",
        ));

    colloquy(data.path())
        .args(["step", "--reply", "13", "--record"])
        .arg(&record)
        .assert()
        .success()
        .stdout(predicate::str::contains("Integer 13 is a prime."));

    colloquy(data.path())
        .args(["step", "--reply", "End", "--record"])
        .arg(&record)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 prime number(s) received!"))
        .stdout(predicate::str::contains("Result: 1"));

    let saved = TurnRecord::load(&record).unwrap();
    assert!(saved.ended);
    assert_eq!(saved.transcript.len(), 5);

    colloquy(data.path())
        .args(["step", "--reply", "2", "--record"])
        .arg(&record)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cannot add the reply"));
}

/// A persisted conversation refuses different entry arguments
#[test]
fn test_step_rejects_changed_entry_arguments() {
    let data = TempDir::new().unwrap();
    let record = data.path().join("chat.json");

    colloquy(data.path())
        .args(["step", "--arg", "end_phrase=Bye", "--record"])
        .arg(&record)
        .assert()
        .success();

    colloquy(data.path())
        .args(["step", "--reply", "Bye", "--arg", "end_phrase=Quit", "--record"])
        .arg(&record)
        .assert()
        .failure()
        .stderr(predicate::str::contains("entry arguments"));

    let saved = TurnRecord::load(&record).unwrap();
    assert_eq!(saved.transcript.len(), 1);
    assert!(!saved.ended);

    colloquy(data.path())
        .args(["step", "--reply", "Bye", "--arg", "end_phrase=Bye", "--record"])
        .arg(&record)
        .assert()
        .success()
        .stdout(predicate::str::contains("0 prime number(s) received!"));
}

/// Bare record names are kept under the records directory
#[test]
fn test_step_uses_records_dir_for_bare_names() {
    let data = TempDir::new().unwrap();
    colloquy(data.path())
        .args(["step", "--record", "first.json"])
        .assert()
        .success();
    assert!(data.path().join("records").join("first.json").exists());
}

/// Malformed `--arg` values are rejected by the parser
#[test]
fn test_rejects_malformed_arguments() {
    let data = TempDir::new().unwrap();
    colloquy(data.path())
        .args(["run", "--arg", "no-equals-sign"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("KEY=VALUE"));
}
