//! CLI tests for the `grade` binary against an in-process fake sandbox.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::{Value, json};

use sandbox::test_support::{FakeReply, FakeSandbox, check_reply, completed, read_manifest, write_manifest};

fn write_config(dir: &Path, sandbox: &FakeSandbox) -> std::path::PathBuf {
    let endpoint = sandbox.endpoint();
    let port = endpoint.port().expect("fake sandbox port");
    let path = dir.join("grade.toml");
    fs::write(
        &path,
        format!("[sandbox]\nhost = \"127.0.0.1\"\nport = {port}\nbackoff_ms = 10\n"),
    )
    .expect("write config");
    path
}

async fn grade(dir: &Path, args: &[&str]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_grade"));
    cmd.current_dir(dir)
        .args(args)
        .env_remove("SANDBOX_HOST")
        .env_remove("SANDBOX_PORT")
        .env_remove("SANDBOX_SSH_SERVER")
        .env_remove("SANDBOX_SSH_KEY_PATH");
    tokio::task::spawn_blocking(move || cmd.output())
        .await
        .expect("join")
        .expect("run grade")
}

#[tokio::test]
async fn execute_prints_the_wire_result() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = FakeSandbox::start(|_| FakeReply::json(completed("4\n"))).await;
    let config = write_config(temp.path(), &sandbox);
    fs::write(temp.path().join("two.py"), "print(2 + 2)\n").expect("write code");

    let output = grade(
        temp.path(),
        &["--config", config.to_str().expect("utf8"), "execute", "two.py"],
    )
    .await;

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let printed: Value = serde_json::from_slice(&output.stdout).expect("json output");
    assert_eq!(printed, completed("4\n"));
    assert_eq!(sandbox.calls(), 1);
}

#[tokio::test]
async fn batch_grades_manifests_in_place() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = FakeSandbox::start(|_| FakeReply::json(check_reply(true, ""))).await;
    let config = write_config(temp.path(), &sandbox);
    fs::write(
        temp.path().join("checker.py"),
        "def math_equal(a, b, *args):\n    return a == b\n",
    )
    .expect("write checker");
    let results = temp.path().join("results");
    fs::create_dir_all(&results).expect("mkdir");
    let manifest = write_manifest(
        &results,
        "output-rs0.jsonl",
        &[
            json!({"generation": "\\boxed{3}", "expected_answer": "3.0"}),
            json!({"generation": "no idea", "expected_answer": "1"}),
        ],
    );

    let output = grade(
        temp.path(),
        &[
            "--config",
            config.to_str().expect("utf8"),
            "batch",
            "results",
            "--checker",
            "checker.py",
        ],
    )
    .await;

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("files=1 rows=2 dispatched=1"), "{stdout}");
    let records = read_manifest(&manifest);
    assert_eq!(records[0]["is_correct"], true);
    assert_eq!(records[1]["is_correct"], false);
}

#[tokio::test]
async fn check_without_checker_fails_with_message() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = grade(temp.path(), &["check", "--predicted", "1", "--expected", "1"]).await;

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("checker"), "{stderr}");
}

#[tokio::test]
async fn unknown_answer_format_fails_fast() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("m.jsonl"), "{}\n").expect("write");

    let output = grade(
        temp.path(),
        &["batch", "m.jsonl", "--answer-format", "multiple_choice"],
    )
    .await;

    assert_eq!(output.status.code(), Some(1));
    assert_eq!(fs::read_to_string(temp.path().join("m.jsonl")).expect("read"), "{}\n");
}
