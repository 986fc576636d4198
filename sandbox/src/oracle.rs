//! Remote correctness checks built on the execution protocol.
//!
//! Answer checks inline an external `math_equal` checker into a python
//! program; proof checks compile the candidate proof. Expected failure modes
//! (timeouts, checker exceptions, killed runs) come back as values, never as
//! errors, so a batch keeps going.

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::core::script::CheckOptions;
use crate::core::types::{AnswerCheck, Language, ProofStatus};
use crate::error::{Error, Result};
use crate::io::transport::Reply;
use crate::protocol::{ExecutionProtocol, ExecutionRequest};

const TIMEOUT_MESSAGE: &str = "timeout";

/// Correctness checks the batch engine dispatches. Implementations must be
/// safe to call from many pool tasks at once.
pub trait Verifier: Send + Sync + 'static {
    fn check_answer(
        &self,
        predicted: &str,
        expected: &str,
        options: CheckOptions,
    ) -> impl Future<Output = Result<AnswerCheck>> + Send;

    fn check_proof(&self, proof: &str, timeout: f64) -> impl Future<Output = Result<ProofStatus>> + Send;
}

/// `{"result", "error_message"}` printed by the check program, or the
/// sandbox's own status when the program never got to print.
#[derive(Debug, Deserialize)]
struct CheckReply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error_message: String,
    #[serde(default)]
    process_status: Option<String>,
    #[serde(default)]
    stderr: String,
}

impl CheckReply {
    fn into_check(self) -> AnswerCheck {
        let correct = matches!(self.result, Value::Bool(true));
        let error_message = match (self.result, self.process_status) {
            (Value::Null, Some(status)) if self.error_message.is_empty() => {
                if status == TIMEOUT_MESSAGE {
                    TIMEOUT_MESSAGE.to_string()
                } else {
                    format!("sandbox {status}: {}", self.stderr.trim())
                }
            }
            _ => self.error_message,
        };
        AnswerCheck {
            correct,
            error_message,
        }
    }
}

pub struct Oracle {
    protocol: ExecutionProtocol,
    checker_source: String,
    checker_digest: String,
}

impl Oracle {
    /// `checker_source` is python defining `math_equal(pred, gt,
    /// include_percentage, tolerance, timeout)`.
    pub fn new(protocol: ExecutionProtocol, checker_source: impl Into<String>) -> Self {
        let checker_source = checker_source.into();
        let checker_digest = content_digest(&checker_source);
        Self {
            protocol,
            checker_source,
            checker_digest,
        }
    }

    pub fn protocol(&self) -> &ExecutionProtocol {
        &self.protocol
    }

    /// Short SHA-256 of the checker source, for tying verdicts to a checker version.
    pub fn checker_digest(&self) -> &str {
        &self.checker_digest
    }

    #[instrument(skip_all, fields(timeout = options.timeout))]
    pub async fn is_output_correct(
        &self,
        predicted: &str,
        expected: &str,
        options: CheckOptions,
    ) -> Result<AnswerCheck> {
        if self.checker_source.trim().is_empty() {
            return Err(Error::Configuration(
                "answer checks need the checker source".to_string(),
            ));
        }
        let program = self.protocol.scripts().math_check_program(
            &self.checker_source,
            predicted,
            expected,
            options,
        )?;
        let reply = self
            .protocol
            .send_program(&program, Language::Python, options.timeout)
            .await?;

        let check = match reply {
            Reply::Payload(value) => serde_json::from_value::<CheckReply>(value)
                .map_err(|err| Error::Transport(format!("unexpected check reply: {err}")))?
                .into_check(),
            Reply::Killed { message } => AnswerCheck::failed(message),
            Reply::TimedOut => AnswerCheck::failed(TIMEOUT_MESSAGE),
        };
        if !check.error_message.is_empty() {
            warn!(error = %check.error_message, "error during correctness check");
        }
        debug!(correct = check.correct, "answer checked");
        Ok(check)
    }

    #[instrument(skip_all, fields(timeout = timeout))]
    pub async fn is_proof_correct(&self, proof: &str, timeout: f64) -> Result<ProofStatus> {
        let request = ExecutionRequest::new(proof, Language::Lean4).with_timeout(timeout);
        let (result, _) = self.protocol.execute(&request, None).await?;
        let status = result.status();
        debug!(status = ?status, "proof checked");
        Ok(status)
    }
}

impl Verifier for Oracle {
    async fn check_answer(
        &self,
        predicted: &str,
        expected: &str,
        options: CheckOptions,
    ) -> Result<AnswerCheck> {
        self.is_output_correct(predicted, expected, options).await
    }

    async fn check_proof(&self, proof: &str, timeout: f64) -> Result<ProofStatus> {
        self.is_proof_correct(proof, timeout).await
    }
}

fn content_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> AnswerCheck {
        serde_json::from_value::<CheckReply>(value)
            .expect("reply")
            .into_check()
    }

    #[test]
    fn checker_reply_maps_to_check() {
        assert_eq!(
            parse(json!({"result": true, "error_message": ""})),
            AnswerCheck {
                correct: true,
                error_message: String::new()
            }
        );
        assert_eq!(
            parse(json!({"result": false, "error_message": "cannot parse"})),
            AnswerCheck::failed("cannot parse")
        );
    }

    #[test]
    fn sandbox_timeout_status_reads_as_timeout() {
        assert_eq!(
            parse(json!({"process_status": "timeout", "stdout": "", "stderr": "Timed out\n"})),
            AnswerCheck::failed("timeout")
        );
    }

    #[test]
    fn sandbox_error_status_keeps_stderr() {
        assert_eq!(
            parse(json!({"process_status": "error", "stderr": "MemoryError\n"})),
            AnswerCheck::failed("sandbox error: MemoryError")
        );
    }

    #[test]
    fn digest_is_stable_and_short() {
        assert_eq!(content_digest("def math_equal(): pass"), content_digest("def math_equal(): pass"));
        assert_eq!(content_digest("x").len(), 16);
    }
}
