//! Execution protocol: turns a snippet into a sandbox program and a result.
//!
//! Python calls are stateful. Every call replays the whole session history
//! in a fresh interpreter, and a snippet that fails is removed from the
//! history so later replays never run it again. Lean calls are stateless
//! and sent as-is.

use tracing::{debug, instrument, warn};

use crate::core::script::{OUTPUT_CUT_MARKER, ScriptEngine, sanitize_snippet, truncate_output};
use crate::core::types::{ExecutionResult, Language};
use crate::error::{Error, Result};
use crate::io::transport::{Reply, Transport};
use crate::session::{SessionId, SessionStore};

/// One execution request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    /// Seconds per attempt.
    pub timeout: f64,
    /// Upper bound on stdout and stderr, each, in characters.
    pub max_output_chars: usize,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            timeout: 10.0,
            max_output_chars: 1000,
        }
    }

    pub fn with_timeout(mut self, timeout: f64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_chars(mut self, max_output_chars: usize) -> Self {
        self.max_output_chars = max_output_chars;
        self
    }
}

pub struct ExecutionProtocol {
    transport: Transport,
    scripts: ScriptEngine,
    sessions: SessionStore,
}

impl ExecutionProtocol {
    pub fn new(transport: Transport) -> Result<Self> {
        Ok(Self {
            transport,
            scripts: ScriptEngine::new()?,
            sessions: SessionStore::new(),
        })
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn scripts(&self) -> &ScriptEngine {
        &self.scripts
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Forget a python session. Returns whether it existed.
    pub fn clear_session(&self, id: SessionId) -> bool {
        self.sessions.delete(id)
    }

    /// Execute `request`, continuing `session` when given.
    ///
    /// For python a new session is created when none is supplied and its id
    /// is returned; lean never has a session.
    #[instrument(skip_all, fields(language = %request.language, session = ?session))]
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        session: Option<SessionId>,
    ) -> Result<(ExecutionResult, Option<SessionId>)> {
        match request.language {
            Language::Python => {
                let id = session.unwrap_or_else(|| self.sessions.create());
                self.sessions.append(id, sanitize_snippet(&request.code))?;
                let history = self.sessions.history(id)?;
                let program = self
                    .scripts
                    .session_program(&history, request.max_output_chars)?;

                let result = match self.run(&program, Language::Python, request.timeout).await {
                    Ok(result) => result,
                    Err(err) => {
                        self.sessions.rollback(id)?;
                        return Err(err);
                    }
                };
                if result.signals_failure() {
                    self.sessions.rollback(id)?;
                    debug!(session = %id, status = ?result.status(), "rolled back failing snippet");
                }
                warn_if_cut(&result, request.max_output_chars);
                Ok((result, Some(id)))
            }
            Language::Lean4 => {
                if let Some(id) = session {
                    return Err(Error::Configuration(format!(
                        "stateful execution is not supported for lean4 (got session {id})"
                    )));
                }
                let result = self
                    .run(&request.code, Language::Lean4, request.timeout)
                    .await?;
                let result = bound_output(result, request.max_output_chars);
                warn_if_cut(&result, request.max_output_chars);
                Ok((result, None))
            }
        }
    }

    /// Send a complete program and return the raw reply.
    pub async fn send_program(&self, program: &str, language: Language, timeout: f64) -> Result<Reply> {
        self.transport.send(program, language, timeout).await
    }

    async fn run(&self, program: &str, language: Language, timeout: f64) -> Result<ExecutionResult> {
        match self.send_program(program, language, timeout).await? {
            Reply::Payload(value) => serde_json::from_value(value)
                .map_err(|err| Error::Transport(format!("unexpected execution reply: {err}"))),
            Reply::Killed { message } => Ok(ExecutionResult::Errored { stderr: message }),
            Reply::TimedOut => Ok(ExecutionResult::TimedOut),
        }
    }
}

fn warn_if_cut(result: &ExecutionResult, max_output_chars: usize) {
    if result.stdout().ends_with(OUTPUT_CUT_MARKER) || result.stderr().ends_with(OUTPUT_CUT_MARKER) {
        warn!(max_output_chars, "execution output truncated");
    }
}

/// Apply the wrapper's output bound to results that bypassed the wrapper.
fn bound_output(result: ExecutionResult, max_output_chars: usize) -> ExecutionResult {
    match result {
        ExecutionResult::Completed { stdout, stderr } => ExecutionResult::Completed {
            stdout: truncate_output(&stdout, max_output_chars),
            stderr: truncate_output(&stderr, max_output_chars),
        },
        ExecutionResult::Errored { stderr } => ExecutionResult::Errored {
            stderr: truncate_output(&stderr, max_output_chars),
        },
        ExecutionResult::TimedOut => ExecutionResult::TimedOut,
    }
}
