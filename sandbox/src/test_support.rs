//! Test doubles: a scripted verifier and an in-process fake sandbox server.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::post;
use reqwest::Url;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use crate::core::script::CheckOptions;
use crate::core::types::{AnswerCheck, ProofStatus};
use crate::error::Result;
use crate::io::transport::{RetryPolicy, SandboxKind, Transport};
use crate::oracle::Verifier;
use crate::protocol::ExecutionProtocol;

type AnswerFn = dyn Fn(&str, &str) -> Result<AnswerCheck> + Send + Sync;
type ProofFn = dyn Fn(&str) -> Result<ProofStatus> + Send + Sync;

/// Verifier returning canned verdicts and counting calls.
pub struct ScriptedVerifier {
    answers: Box<AnswerFn>,
    proofs: Box<ProofFn>,
    delay: Duration,
    answer_calls: AtomicUsize,
    proof_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedVerifier {
    /// Correct exactly when the two answers are equal strings; proofs complete.
    pub fn exact_match() -> Self {
        Self::answers(|predicted, expected| {
            Ok(AnswerCheck {
                correct: predicted == expected,
                error_message: String::new(),
            })
        })
    }

    pub fn answers(
        answers: impl Fn(&str, &str) -> Result<AnswerCheck> + Send + Sync + 'static,
    ) -> Self {
        Self {
            answers: Box::new(answers),
            proofs: Box::new(|_| Ok(ProofStatus::Completed)),
            delay: Duration::ZERO,
            answer_calls: AtomicUsize::new(0),
            proof_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_proofs(
        mut self,
        proofs: impl Fn(&str) -> Result<ProofStatus> + Send + Sync + 'static,
    ) -> Self {
        self.proofs = Box::new(proofs);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn answer_calls(&self) -> usize {
        self.answer_calls.load(Ordering::SeqCst)
    }

    pub fn proof_calls(&self) -> usize {
        self.proof_calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        guard
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Verifier for ScriptedVerifier {
    async fn check_answer(
        &self,
        predicted: &str,
        expected: &str,
        _options: CheckOptions,
    ) -> Result<AnswerCheck> {
        self.answer_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        (self.answers)(predicted, expected)
    }

    async fn check_proof(&self, proof: &str, _timeout: f64) -> Result<ProofStatus> {
        self.proof_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        (self.proofs)(proof)
    }
}

/// Canned response of the fake sandbox.
#[derive(Debug, Clone)]
pub struct FakeReply {
    pub status: u16,
    pub body: Value,
    pub delay: Duration,
}

impl FakeReply {
    pub fn json(body: Value) -> Self {
        Self {
            status: 200,
            body,
            delay: Duration::ZERO,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Responder = dyn Fn(&Value) -> FakeReply + Send + Sync;

#[derive(Clone)]
struct FakeState {
    responder: Arc<Responder>,
    requests: Arc<Mutex<Vec<Value>>>,
}

/// Local HTTP server standing in for the sandbox's `POST /execute`.
///
/// The server stops when the value is dropped.
pub struct FakeSandbox {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
    server: JoinHandle<()>,
}

impl FakeSandbox {
    pub async fn start(responder: impl Fn(&Value) -> FakeReply + Send + Sync + 'static) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake sandbox");
        let addr = listener.local_addr().expect("fake sandbox addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = FakeState {
            responder: Arc::new(responder),
            requests: Arc::clone(&requests),
        };
        let app = Router::new()
            .route("/execute", post(execute))
            .with_state(state);
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Self {
            addr,
            requests,
            server,
        }
    }

    pub fn endpoint(&self) -> Url {
        Url::parse(&format!("http://{}/execute", self.addr)).expect("fake sandbox url")
    }

    /// Request bodies received so far, oldest first.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    /// Transport against this server with millisecond backoff.
    pub fn transport(&self, kind: SandboxKind) -> Transport {
        Transport::with_endpoint(kind, self.endpoint(), fast_retry()).expect("transport")
    }

    pub fn protocol(&self) -> ExecutionProtocol {
        ExecutionProtocol::new(self.transport(SandboxKind::Local)).expect("protocol")
    }
}

impl Drop for FakeSandbox {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn execute(State(state): State<FakeState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    state
        .requests
        .lock()
        .expect("requests lock")
        .push(body.clone());
    let reply = (state.responder)(&body);
    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.body))
}

/// Three attempts, 10ms apart.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff: Duration::from_millis(10),
    }
}

/// `{process_status: completed}` reply with the given stdout.
pub fn completed(stdout: &str) -> Value {
    json!({"process_status": "completed", "stdout": stdout, "stderr": ""})
}

/// `{process_status: error}` reply with the given stderr.
pub fn errored(stderr: &str) -> Value {
    json!({"process_status": "error", "stdout": "", "stderr": stderr})
}

/// Reply printed by the answer-check program.
pub fn check_reply(result: bool, error_message: &str) -> Value {
    json!({"result": result, "error_message": error_message})
}

/// Write `lines` to `dir/name`, one per line.
pub fn write_manifest(dir: &Path, name: &str, lines: &[Value]) -> PathBuf {
    let path = dir.join(name);
    let mut contents = String::new();
    for line in lines {
        contents.push_str(&serde_json::to_string(line).expect("serialize line"));
        contents.push('\n');
    }
    fs::write(&path, contents).expect("write manifest");
    path
}

/// Parsed lines of a manifest.
pub fn read_manifest(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .expect("read manifest")
        .lines()
        .map(|line| serde_json::from_str(line).expect("manifest line"))
        .collect()
}
