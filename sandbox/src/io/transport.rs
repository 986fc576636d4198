//! HTTP transport to the execution sandbox.
//!
//! Two sandbox kinds are supported, fixed at construction: a directly
//! hosted sandbox that accepts the program verbatim, and a piston-style
//! pooled runner with its own request schema. Timeouts are retried with a
//! fixed backoff and end as [`Reply::TimedOut`]; every other failure is a
//! [`Error::Transport`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::Language;
use crate::error::{Error, Result};
use crate::io::config::SandboxConfig;
use crate::io::tunnel::SshTunnel;

const PISTON_LANGUAGE: &str = "py";
const PISTON_VERSION: &str = "3.10.0";
const KILL_SIGNAL: &str = "SIGKILL";
const TUNNEL_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Which sandbox service sits behind the endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// Sandbox server accepting `{generated_code, timeout, language}`.
    #[default]
    Local,
    /// Pooled piston runner; python only.
    Piston,
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxKind::Local => f.write_str("local"),
            SandboxKind::Piston => f.write_str("piston"),
        }
    }
}

impl FromStr for SandboxKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(SandboxKind::Local),
            "piston" => Ok(SandboxKind::Piston),
            other => Err(Error::Configuration(format!("unsupported sandbox kind: {other}"))),
        }
    }
}

/// Decoded sandbox reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// JSON printed by the submitted program.
    Payload(Value),
    /// The runner killed the program before it produced output.
    Killed { message: String },
    /// Every attempt timed out.
    TimedOut,
}

#[derive(Serialize)]
struct LocalRequest<'a> {
    generated_code: &'a str,
    timeout: f64,
    language: &'a str,
}

#[derive(Serialize)]
struct PistonRequest<'a> {
    language: &'static str,
    version: &'static str,
    files: [PistonFile<'a>; 1],
    stdin: &'static str,
    args: [&'static str; 0],
    /// Milliseconds.
    run_timeout: f64,
    compile_memory_limit: i64,
    run_memory_limit: i64,
}

#[derive(Serialize)]
struct PistonFile<'a> {
    content: &'a str,
}

#[derive(Deserialize)]
struct PistonResponse {
    run: PistonRun,
}

#[derive(Deserialize)]
struct PistonRun {
    #[serde(default)]
    output: String,
    #[serde(default)]
    signal: Option<String>,
}

impl SandboxKind {
    /// Endpoint URL for `host`/`port`.
    ///
    /// A piston host may be a full base URL, in which case `port` is unused.
    pub fn endpoint(self, host: &str, port: u16) -> Result<Url> {
        let raw = match self {
            SandboxKind::Piston if host.contains("://") => {
                format!("{}/execute", host.trim_end_matches('/'))
            }
            _ => format!("http://{host}:{port}/execute"),
        };
        Url::parse(&raw).map_err(|err| Error::Configuration(format!("invalid endpoint {raw}: {err}")))
    }

    pub fn build_request(self, code: &str, timeout: f64, language: Language) -> Result<Value> {
        let body = match self {
            SandboxKind::Local => serde_json::to_value(LocalRequest {
                generated_code: code,
                timeout,
                language: language.as_str(),
            }),
            SandboxKind::Piston => {
                if language != Language::Python {
                    return Err(Error::Configuration(format!(
                        "piston sandbox cannot run {language}"
                    )));
                }
                serde_json::to_value(PistonRequest {
                    language: PISTON_LANGUAGE,
                    version: PISTON_VERSION,
                    files: [PistonFile { content: code }],
                    stdin: "",
                    args: [],
                    run_timeout: timeout * 1000.0,
                    compile_memory_limit: -1,
                    run_memory_limit: -1,
                })
            }
        };
        body.map_err(|err| Error::Transport(format!("encode request: {err}")))
    }

    pub fn parse_response(self, body: Value) -> Result<Reply> {
        match self {
            SandboxKind::Local => Ok(Reply::Payload(body)),
            SandboxKind::Piston => {
                let response: PistonResponse = serde_json::from_value(body)
                    .map_err(|err| Error::Transport(format!("unexpected runner reply: {err}")))?;
                if response.run.signal.as_deref() == Some(KILL_SIGNAL) {
                    return Ok(Reply::Killed {
                        message: format!("Unknown error: {KILL_SIGNAL}"),
                    });
                }
                let payload = serde_json::from_str(&response.run.output).map_err(|err| {
                    Error::Transport(format!("runner output is not JSON: {err}"))
                })?;
                Ok(Reply::Payload(payload))
            }
        }
    }
}

/// Retry policy applied to timed-out requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

enum Attempt {
    TimedOut,
    Failed(Error),
}

/// Shared HTTP client for one sandbox endpoint. Safe for concurrent use.
#[derive(Debug)]
pub struct Transport {
    kind: SandboxKind,
    client: Client,
    endpoint: Url,
    retry: RetryPolicy,
    _tunnel: Option<SshTunnel>,
}

impl Transport {
    /// Build a transport from config, opening an SSH tunnel when one is configured.
    pub fn connect(config: &SandboxConfig) -> Result<Self> {
        config.validate()?;
        let mut endpoint = config.kind.endpoint(&config.host, config.port)?;
        let retry = RetryPolicy {
            max_attempts: config.max_attempts,
            backoff: config.backoff(),
        };

        let tunnel = match config.tunnel() {
            Some((server, key)) => {
                let remote_host = endpoint
                    .host_str()
                    .ok_or_else(|| Error::Configuration(format!("endpoint {endpoint} has no host")))?
                    .to_string();
                let remote_port = endpoint.port_or_known_default().unwrap_or(config.port);
                let tunnel =
                    SshTunnel::open(server, key, &remote_host, remote_port, TUNNEL_READY_TIMEOUT)?;
                endpoint
                    .set_host(Some("127.0.0.1"))
                    .map_err(|err| Error::Configuration(format!("rewrite endpoint: {err}")))?;
                endpoint
                    .set_port(Some(tunnel.local_port()))
                    .map_err(|()| Error::Configuration("rewrite endpoint port".to_string()))?;
                Some(tunnel)
            }
            None => None,
        };

        let client = Client::builder().build()?;
        debug!(kind = %config.kind, endpoint = %endpoint, tunneled = tunnel.is_some(), "transport ready");
        Ok(Self {
            kind: config.kind,
            client,
            endpoint,
            retry,
            _tunnel: tunnel,
        })
    }

    /// Direct transport to `endpoint` without a tunnel.
    pub fn with_endpoint(kind: SandboxKind, endpoint: Url, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            kind,
            client: Client::builder().build()?,
            endpoint,
            retry,
            _tunnel: None,
        })
    }

    pub fn kind(&self) -> SandboxKind {
        self.kind
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Submit `code` for execution, waiting up to `timeout` seconds per attempt.
    #[instrument(skip_all, fields(language = %language, timeout = timeout))]
    pub async fn send(&self, code: &str, language: Language, timeout: f64) -> Result<Reply> {
        let per_attempt = Duration::try_from_secs_f64(timeout)
            .map_err(|_| Error::Configuration(format!("invalid timeout: {timeout}")))?;
        let body = self.kind.build_request(code, timeout, language)?;

        for attempt in 1..=self.retry.max_attempts {
            match self.post(&body, per_attempt).await {
                Ok(reply) => return Ok(reply),
                Err(Attempt::Failed(err)) => return Err(err),
                Err(Attempt::TimedOut) => {
                    if attempt < self.retry.max_attempts {
                        warn!(
                            attempt,
                            backoff_ms = self.retry.backoff.as_millis() as u64,
                            "sandbox request timed out, retrying"
                        );
                        tokio::time::sleep(self.retry.backoff).await;
                    }
                }
            }
        }
        warn!(attempts = self.retry.max_attempts, "sandbox request timed out");
        Ok(Reply::TimedOut)
    }

    async fn post(&self, body: &Value, timeout: Duration) -> std::result::Result<Reply, Attempt> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Attempt::Failed(Error::Transport(format!(
                "sandbox returned {status}: {}",
                text.trim()
            ))));
        }

        let payload: Value = response.json().await.map_err(classify)?;
        debug!("sandbox replied");
        self.kind.parse_response(payload).map_err(Attempt::Failed)
    }
}

fn classify(err: reqwest::Error) -> Attempt {
    if err.is_timeout() {
        Attempt::TimedOut
    } else {
        Attempt::Failed(Error::from(err))
    }
}
