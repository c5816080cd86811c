//! Interface to the authentication collaborator.
//!
//! The transfer core never logs in or refreshes anything itself. It reads an
//! opaque bearer token from `Credentials` for every authenticated call, and
//! when the remote answers 401/403 it reports an `AuthFailure` to whoever
//! owns the session.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;

use super::models::TaskId;

/// Shared, replaceable bearer token.
#[derive(Clone, Default)]
pub struct Credentials {
    token: Arc<RwLock<Option<String>>>,
}

impl Credentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token.filter(|t| !t.is_empty()))),
        }
    }

    /// Current token, if any.
    pub fn bearer(&self) -> Option<String> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }

    /// Swap in a fresh token after re-authentication.
    pub fn replace(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token.filter(|t| !t.is_empty());
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.bearer().is_some() {
            "<redacted>"
        } else {
            "<none>"
        };
        f.debug_struct("Credentials").field("token", &state).finish()
    }
}

/// A task that failed because the remote refused the credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthFailure {
    pub task_id: TaskId,
    pub file_name: String,
    pub status: u16,
}

/// Implemented by the session owner to react to rejected credentials.
#[async_trait]
pub trait AuthObserver: Send + Sync {
    async fn authorization_failed(&self, failure: AuthFailure);
}
