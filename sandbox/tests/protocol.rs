//! Execution protocol tests: session replay, rollback and lean handling.

use serde_json::{Value, json};

use sandbox::Error;
use sandbox::core::script::OUTPUT_CUT_MARKER;
use sandbox::core::types::{ExecutionResult, Language, TRACEBACK_MARKER};
use sandbox::protocol::ExecutionRequest;
use sandbox::test_support::{FakeReply, FakeSandbox, completed, errored};

const APPEND: &str = "code_snippets.append(\"\"\"";

fn generated_code(body: &Value) -> &str {
    body["generated_code"].as_str().unwrap_or_default()
}

/// Replays report how many snippets they carried; a last snippet mentioning
/// `raise` fails, one mentioning `trace` leaves a traceback in stdout.
fn replay_responder(body: &Value) -> FakeReply {
    let code = generated_code(body);
    let snippets = code.matches(APPEND).count();
    let last = code
        .rsplit(APPEND)
        .next()
        .and_then(|tail| tail.split("\"\"\")").next())
        .unwrap_or_default();
    if last.contains("raise") {
        FakeReply::json(errored("ValueError: boom\n"))
    } else if last.contains("trace") {
        FakeReply::json(completed(&format!("{TRACEBACK_MARKER}:\n  ...\n")))
    } else {
        FakeReply::json(completed(&format!("{snippets}\n")))
    }
}

#[tokio::test]
async fn failing_snippet_is_dropped_from_later_replays() {
    let sandbox = FakeSandbox::start(replay_responder).await;
    let protocol = sandbox.protocol();

    let (first, session) = protocol
        .execute(&ExecutionRequest::new("x = 1", Language::Python), None)
        .await
        .expect("first");
    let session = session.expect("python opens a session");
    assert_eq!(first.stdout(), "1\n");

    let (failed, _) = protocol
        .execute(
            &ExecutionRequest::new("raise ValueError('boom')", Language::Python),
            Some(session),
        )
        .await
        .expect("second");
    assert_eq!(failed.stderr(), "ValueError: boom\n");
    assert!(generated_code(&sandbox.requests()[1]).contains("raise ValueError"));

    let (third, _) = protocol
        .execute(&ExecutionRequest::new("print(x)", Language::Python), Some(session))
        .await
        .expect("third");
    assert_eq!(third.stdout(), "2\n");
    assert!(!generated_code(&sandbox.requests()[2]).contains("raise"));
    assert_eq!(
        protocol.sessions().history(session).expect("history"),
        vec!["x = 1", "print(x)"]
    );
}

#[tokio::test]
async fn traceback_in_stdout_also_rolls_back() {
    let sandbox = FakeSandbox::start(replay_responder).await;
    let protocol = sandbox.protocol();

    let (_, session) = protocol
        .execute(&ExecutionRequest::new("a = 1", Language::Python), None)
        .await
        .expect("first");
    let session = session.expect("session");
    let (result, _) = protocol
        .execute(&ExecutionRequest::new("trace()", Language::Python), Some(session))
        .await
        .expect("second");

    assert!(result.signals_failure());
    assert_eq!(
        protocol.sessions().history(session).expect("history"),
        vec!["a = 1"]
    );
}

#[tokio::test]
async fn snippets_are_sanitized_before_replay() {
    let sandbox = FakeSandbox::start(replay_responder).await;
    let protocol = sandbox.protocol();

    let (_, session) = protocol
        .execute(
            &ExecutionRequest::new("s = \"\"\"doc\"\"\"\\", Language::Python),
            None,
        )
        .await
        .expect("execute");

    let history = protocol
        .sessions()
        .history(session.expect("session"))
        .expect("history");
    assert_eq!(history, vec![r#"s = \"\"\"doc\"\"\""#]);
}

#[tokio::test]
async fn cleared_session_is_forgotten() {
    let sandbox = FakeSandbox::start(replay_responder).await;
    let protocol = sandbox.protocol();

    let (_, session) = protocol
        .execute(&ExecutionRequest::new("x = 1", Language::Python), None)
        .await
        .expect("execute");
    let session = session.expect("session");

    assert!(protocol.clear_session(session));
    let err = protocol
        .execute(&ExecutionRequest::new("x", Language::Python), Some(session))
        .await
        .expect_err("unknown session");
    assert!(matches!(err, Error::Configuration(_)), "got {err:?}");
}

#[tokio::test]
async fn lean_is_sent_verbatim_and_truncated_locally() {
    let long = "x".repeat(30);
    let reply = completed(&long);
    let sandbox = FakeSandbox::start(move |_| FakeReply::json(reply.clone())).await;
    let protocol = sandbox.protocol();
    let proof = "theorem t : True := by\n  trivial\n";

    let (result, session) = protocol
        .execute(
            &ExecutionRequest::new(proof, Language::Lean4).with_max_output_chars(10),
            None,
        )
        .await
        .expect("execute");

    assert_eq!(session, None);
    assert_eq!(
        result,
        ExecutionResult::Completed {
            stdout: format!("{}{OUTPUT_CUT_MARKER}", "x".repeat(10)),
            stderr: String::new(),
        }
    );
    assert_eq!(
        sandbox.requests(),
        vec![json!({"generated_code": proof, "timeout": 10.0, "language": "lean4"})]
    );
}

#[tokio::test]
async fn lean_rejects_sessions() {
    let sandbox = FakeSandbox::start(replay_responder).await;
    let protocol = sandbox.protocol();
    let (_, session) = protocol
        .execute(&ExecutionRequest::new("x = 1", Language::Python), None)
        .await
        .expect("python");

    let err = protocol
        .execute(&ExecutionRequest::new("theorem", Language::Lean4), session)
        .await
        .expect_err("lean with session");

    assert!(matches!(err, Error::Configuration(_)), "got {err:?}");
    assert_eq!(sandbox.calls(), 1);
}

#[tokio::test]
async fn sandbox_timeout_yields_timed_out_result() {
    let sandbox = FakeSandbox::start(|_| {
        FakeReply::json(completed("")).delayed(std::time::Duration::from_millis(400))
    })
    .await;
    let protocol = sandbox.protocol();

    let (result, session) = protocol
        .execute(
            &ExecutionRequest::new("import time; time.sleep(9)", Language::Python)
                .with_timeout(0.05),
            None,
        )
        .await
        .expect("timeouts are results");

    assert_eq!(result, ExecutionResult::TimedOut);
    assert_eq!(result.stderr(), "Timed out\n");
    let history = protocol
        .sessions()
        .history(session.expect("session"))
        .expect("history");
    assert!(history.is_empty());
}
