//! Client-side history of stateful interpreter sessions.
//!
//! The sandbox keeps nothing between requests, so a session is just the
//! ordered list of snippets that executed cleanly. Sessions live until the
//! caller deletes them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|err| Error::Configuration(format!("invalid session id {s}: {err}")))
    }
}

/// Table of session histories.
///
/// Calls sharing one session must be serialized by the caller; the lock only
/// keeps the table itself consistent across sessions.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionId, Vec<String>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an empty session.
    pub fn create(&self) -> SessionId {
        let id = SessionId::new();
        self.lock().insert(id, Vec::new());
        id
    }

    pub fn append(&self, id: SessionId, snippet: String) -> Result<()> {
        self.lock()
            .get_mut(&id)
            .ok_or_else(|| unknown(id))?
            .push(snippet);
        Ok(())
    }

    /// Drop the most recent snippet, returning it.
    pub fn rollback(&self, id: SessionId) -> Result<Option<String>> {
        Ok(self.lock().get_mut(&id).ok_or_else(|| unknown(id))?.pop())
    }

    /// Snapshot of the accepted snippets in execution order.
    pub fn history(&self, id: SessionId) -> Result<Vec<String>> {
        self.lock().get(&id).cloned().ok_or_else(|| unknown(id))
    }

    /// Forget a session. Returns whether it existed.
    pub fn delete(&self, id: SessionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Vec<String>>> {
        // A panic while holding the lock cannot leave a history half-written.
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn unknown(id: SessionId) -> Error {
    Error::Configuration(format!("unknown session {id}"))
}
