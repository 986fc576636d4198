//! Error taxonomy shared by every layer of the sandbox client.
//!
//! Timeouts are not errors here: they surface as `TimedOut` results. What is
//! left is fatal to the caller.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Non-timeout network failure or an unparseable sandbox reply.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Unsupported language, answer format or sandbox kind, or invalid settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed manifest line or a required record field that is missing.
    #[error("data error in {path} line {line}: {message}")]
    Data {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("render script: {0}")]
    Template(#[from] minijinja::Error),

    /// A pool task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Worker(String),

    /// Failure of a verification task whose result is shared by several rows.
    #[error(transparent)]
    Shared(Arc<Error>),
}

impl Error {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            action,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn data(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Error::Data {
            path: path.into(),
            line,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
