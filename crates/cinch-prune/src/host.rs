//! The host collaborator: session listing, session lookup and transcripts.
//!
//! The engine never talks to a host SDK directly. Everything it needs from the
//! host goes through [`HostClient`], which keeps the engine testable with
//! [`InMemoryHost`].

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::Message;
use crate::error::{PruneError, Result};

/// Boxed future returned by [`HostClient`] methods (dyn-compatible).
pub type HostFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A host session. Sessions with a parent are sub-agent sessions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl SessionInfo {
    pub fn top_level(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
        }
    }

    pub fn child(id: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: Some(parent.into()),
        }
    }

    pub fn is_sub_agent(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// What the engine needs from the host process.
pub trait HostClient: Send + Sync {
    /// List every session the host knows about. One round trip.
    fn list_sessions(&self) -> HostFuture<'_, Vec<SessionInfo>>;

    /// Look up a single session.
    fn get_session<'a>(&'a self, session_id: &'a str) -> HostFuture<'a, SessionInfo>;

    /// Fetch a session's transcript, optionally only the last `limit` messages.
    fn session_messages<'a>(
        &'a self,
        session_id: &'a str,
        limit: Option<usize>,
    ) -> HostFuture<'a, Vec<Message>>;
}

/// A host backed by in-process maps. Used by the CLI and tests.
#[derive(Clone, Default)]
pub struct InMemoryHost {
    inner: Arc<Mutex<HostData>>,
}

#[derive(Default)]
struct HostData {
    sessions: Vec<SessionInfo>,
    messages: HashMap<String, Vec<Message>>,
    fail_listing: bool,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session (builder pattern).
    pub fn with_session(self, info: SessionInfo) -> Self {
        self.add_session(info);
        self
    }

    pub fn add_session(&self, info: SessionInfo) {
        let mut data = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        data.sessions.retain(|s| s.id != info.id);
        data.sessions.push(info);
    }

    pub fn set_messages(&self, session_id: impl Into<String>, messages: Vec<Message>) {
        let mut data = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        data.messages.insert(session_id.into(), messages);
    }

    /// Make `list_sessions` fail, to exercise fail-open paths.
    pub fn set_fail_listing(&self, fail: bool) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).fail_listing = fail;
    }
}

impl HostClient for InMemoryHost {
    fn list_sessions(&self) -> HostFuture<'_, Vec<SessionInfo>> {
        let data = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let result = if data.fail_listing {
            Err(PruneError::Host("session listing unavailable".into()))
        } else {
            Ok(data.sessions.clone())
        };
        futures::future::ready(result).boxed()
    }

    fn get_session<'a>(&'a self, session_id: &'a str) -> HostFuture<'a, SessionInfo> {
        let data = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let result = data
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
            .ok_or_else(|| PruneError::UnknownSession(session_id.to_string()));
        futures::future::ready(result).boxed()
    }

    fn session_messages<'a>(
        &'a self,
        session_id: &'a str,
        limit: Option<usize>,
    ) -> HostFuture<'a, Vec<Message>> {
        let data = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut messages = data.messages.get(session_id).cloned().unwrap_or_default();
        if let Some(limit) = limit
            && messages.len() > limit
        {
            messages.drain(..messages.len() - limit);
        }
        futures::future::ready(Ok(messages)).boxed()
    }
}
