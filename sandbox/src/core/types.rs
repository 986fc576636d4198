//! Shared value types for execution and verification results.
//!
//! These mirror the wire formats spoken by the sandbox and the field values
//! written into manifest records, so their serialized forms must stay stable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Marker a python traceback leaves in captured output.
pub const TRACEBACK_MARKER: &str = "Traceback (most recent call last)";

/// Languages the sandbox can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Stateful interactive interpreter, replayed per session.
    Python,
    /// Proof text, sent verbatim and never stateful.
    Lean4,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Lean4 => "lean4",
        }
    }

    pub fn is_stateful(self) -> bool {
        matches!(self, Language::Python)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Language::Python),
            "lean4" => Ok(Language::Lean4),
            other => Err(Error::Configuration(format!("unsupported language: {other}"))),
        }
    }
}

/// Outcome of one execution request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireResult", into = "WireResult")]
pub enum ExecutionResult {
    Completed { stdout: String, stderr: String },
    /// The submitted code raised; `stderr` holds the trimmed traceback.
    Errored { stderr: String },
    TimedOut,
}

impl ExecutionResult {
    pub fn status(&self) -> ProofStatus {
        match self {
            ExecutionResult::Completed { .. } => ProofStatus::Completed,
            ExecutionResult::Errored { .. } => ProofStatus::Error,
            ExecutionResult::TimedOut => ProofStatus::Timeout,
        }
    }

    pub fn stdout(&self) -> &str {
        match self {
            ExecutionResult::Completed { stdout, .. } => stdout,
            _ => "",
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            ExecutionResult::Completed { stderr, .. } | ExecutionResult::Errored { stderr } => {
                stderr
            }
            ExecutionResult::TimedOut => TIMED_OUT_STDERR,
        }
    }

    /// Whether the snippet that produced this result must not be replayed.
    pub fn signals_failure(&self) -> bool {
        match self {
            ExecutionResult::Completed { stdout, stderr } => {
                !stderr.is_empty() || stdout.contains(TRACEBACK_MARKER)
            }
            ExecutionResult::Errored { .. } | ExecutionResult::TimedOut => true,
        }
    }
}

const TIMED_OUT_STDERR: &str = "Timed out\n";

/// `{process_status, stdout, stderr}` as printed by the wrapper script.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireResult {
    process_status: ProofStatus,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

impl From<WireResult> for ExecutionResult {
    fn from(wire: WireResult) -> Self {
        match wire.process_status {
            ProofStatus::Completed => ExecutionResult::Completed {
                stdout: wire.stdout,
                stderr: wire.stderr,
            },
            ProofStatus::Error => ExecutionResult::Errored { stderr: wire.stderr },
            ProofStatus::Timeout => ExecutionResult::TimedOut,
        }
    }
}

impl From<ExecutionResult> for WireResult {
    fn from(result: ExecutionResult) -> Self {
        let process_status = result.status();
        let stdout = result.stdout().to_string();
        let stderr = result.stderr().to_string();
        WireResult {
            process_status,
            stdout,
            stderr,
        }
    }
}

/// Completion status of a proof check, also the `process_status` wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofStatus {
    Completed,
    Error,
    Timeout,
}

/// Result of a remote symbolic equality check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerCheck {
    pub correct: bool,
    /// Empty when the checker ran cleanly.
    pub error_message: String,
}

impl AnswerCheck {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            correct: false,
            error_message: message.into(),
        }
    }
}

/// Verdict written back into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Answer(bool),
    Proof(ProofStatus),
    /// Non-null value already present in the verdict field, reused as is.
    Prior(serde_json::Value),
}

impl Verdict {
    pub fn to_value(self) -> serde_json::Value {
        match self {
            Verdict::Answer(correct) => serde_json::Value::Bool(correct),
            Verdict::Proof(status) => serde_json::json!(status),
            Verdict::Prior(value) => value,
        }
    }
}
