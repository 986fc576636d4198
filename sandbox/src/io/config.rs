//! Sandbox connection settings.
//!
//! Missing fields default to a sandbox on localhost. Host, port and tunnel
//! settings can be overridden from the environment so cluster jobs can point
//! at a sandbox without editing config files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::io::transport::SandboxKind;

pub const ENV_HOST: &str = "SANDBOX_HOST";
pub const ENV_PORT: &str = "SANDBOX_PORT";
pub const ENV_SSH_SERVER: &str = "SANDBOX_SSH_SERVER";
pub const ENV_SSH_KEY_PATH: &str = "SANDBOX_SSH_KEY_PATH";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub kind: SandboxKind,

    /// Hostname, or a full base URL for the piston runner.
    pub host: String,

    pub port: u16,

    /// `user@host` reachable over SSH; requests are tunneled through it when
    /// `ssh_key_path` is also set.
    pub ssh_server: Option<String>,

    pub ssh_key_path: Option<PathBuf>,

    /// Attempts per request when the sandbox times out.
    pub max_attempts: u32,

    /// Fixed delay between timed-out attempts, in milliseconds.
    pub backoff_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            kind: SandboxKind::Local,
            host: "127.0.0.1".to_string(),
            port: 6000,
            ssh_server: None,
            ssh_key_path: None,
            max_attempts: 3,
            backoff_ms: 1000,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Configuration("sandbox host must be non-empty".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Configuration("max_attempts must be > 0".to_string()));
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by the `SANDBOX_*` variable names.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(host) = lookup(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| Error::Configuration(format!("{ENV_PORT} is not a port: {port}")))?;
        }
        if let Some(server) = lookup(ENV_SSH_SERVER) {
            self.ssh_server = Some(server);
        }
        if let Some(key) = lookup(ENV_SSH_KEY_PATH) {
            self.ssh_key_path = Some(PathBuf::from(key));
        }
        self.validate()?;
        Ok(self)
    }

    /// Tunnel endpoint and key, only when both are configured.
    pub fn tunnel(&self) -> Option<(&str, &Path)> {
        match (&self.ssh_server, &self.ssh_key_path) {
            (Some(server), Some(key)) => Some((server.as_str(), key.as_path())),
            _ => None,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}
