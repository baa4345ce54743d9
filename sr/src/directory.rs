//! Session directory - answers "does this session exist?"
//!
//! Session metadata is owned elsewhere; the reel only needs an existence check
//! before serving any request.

use std::collections::HashSet;

use async_trait::async_trait;
use eventlog::validate_session_id;

use crate::config::{SessionMode, SessionsConfig};

/// Existence lookup for session ids
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn exists(&self, session_id: &str) -> bool;
}

/// Every well-formed session id exists
#[derive(Debug, Clone, Default)]
pub struct OpenDirectory;

#[async_trait]
impl SessionDirectory for OpenDirectory {
    async fn exists(&self, session_id: &str) -> bool {
        validate_session_id(session_id).is_ok()
    }
}

/// A fixed set of known sessions
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    known: HashSet<String>,
}

impl StaticDirectory {
    pub fn new<I, S>(known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: known.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl SessionDirectory for StaticDirectory {
    async fn exists(&self, session_id: &str) -> bool {
        self.known.contains(session_id)
    }
}

/// Build the directory described by config
pub fn from_config(config: &SessionsConfig) -> Box<dyn SessionDirectory> {
    match config.mode {
        SessionMode::Open => Box::new(OpenDirectory),
        SessionMode::Static => Box::new(StaticDirectory::new(config.known.iter().cloned())),
    }
}
