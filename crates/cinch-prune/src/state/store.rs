//! The session state container.
//!
//! [`SessionStore`] is cheap to clone and shared by every engine component.
//! The lock is a plain `std::sync::Mutex` and is never held across an await:
//! accessors take closures that run with the lock held and return owned data.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::SessionState;
use super::reconcile::find_last_compaction_timestamp;
use crate::Message;
use crate::host::{HostClient, SessionInfo};
use crate::short_id;

#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<String, SessionState>,
    clock: u64,
}

impl StoreInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create state for `session_id` if absent. Returns whether it was created.
    pub fn create(&self, session_id: &str, is_sub_agent: bool) -> bool {
        let mut inner = self.lock();
        if inner.sessions.contains_key(session_id) {
            return false;
        }
        let stamp = inner.tick();
        let mut state = SessionState::new(session_id);
        state.is_sub_agent = is_sub_agent;
        state.last_active = stamp;
        inner.sessions.insert(session_id.to_string(), state);
        true
    }

    /// Replace (or add) a whole session state.
    pub fn insert(&self, mut state: SessionState) {
        let mut inner = self.lock();
        state.last_active = inner.tick();
        inner.sessions.insert(state.session_id.clone(), state);
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().sessions.contains_key(session_id)
    }

    /// Mutate a session's state. Marks the session as most recently active.
    pub fn with_session<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionState) -> R,
    ) -> Option<R> {
        let mut inner = self.lock();
        let stamp = inner.tick();
        let state = inner.sessions.get_mut(session_id)?;
        state.last_active = stamp;
        Some(f(state))
    }

    /// Read a session's state without touching its activity stamp.
    pub fn read<R>(&self, session_id: &str, f: impl FnOnce(&SessionState) -> R) -> Option<R> {
        let inner = self.lock();
        inner.sessions.get(session_id).map(f)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionState> {
        self.read(session_id, Clone::clone)
    }

    /// Destroy a session's state when the host reports the session ended.
    pub fn drop_session(&self, session_id: &str) -> Option<SessionState> {
        let removed = self.lock().sessions.remove(session_id);
        if removed.is_some() {
            debug!("Dropped state for session {}", short_id(session_id));
        }
        removed
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.lock().sessions.keys().cloned().collect()
    }

    /// Union of redacted tool-call ids across the listed top-level sessions,
    /// lower-cased for case-insensitive matching.
    ///
    /// Sub-agent sessions are skipped whether the listing or the tracked
    /// state says so.
    pub fn pruned_tool_ids(&self, sessions: &[SessionInfo]) -> HashSet<String> {
        let inner = self.lock();
        let mut ids = HashSet::new();
        for info in sessions.iter().filter(|s| !s.is_sub_agent()) {
            let Some(state) = inner.sessions.get(&info.id) else {
                continue;
            };
            if state.is_sub_agent {
                continue;
            }
            ids.extend(state.prune.tools.keys().map(|id| id.to_lowercase()));
        }
        ids
    }

    pub fn position_map_for(&self, session_id: &str) -> HashMap<String, String> {
        self.read(session_id, |s| s.position_map.clone())
            .unwrap_or_default()
    }

    /// The top-level session that was active most recently.
    pub fn most_recent_top_level(&self) -> Option<String> {
        let inner = self.lock();
        inner
            .sessions
            .values()
            .filter(|s| !s.is_sub_agent)
            .max_by_key(|s| s.last_active)
            .map(|s| s.session_id.clone())
    }

    /// Idempotently create state for a session, asking the host whether it
    /// is a sub-agent. A failed lookup counts as top-level. Returns `true` if
    /// the state was created by this call.
    pub async fn ensure_initialized(
        &self,
        host: &dyn HostClient,
        session_id: &str,
        transcript: &[Message],
        manual_default: bool,
    ) -> bool {
        if self.with_session(session_id, |_| ()).is_some() {
            return false;
        }

        let is_sub_agent = match host.get_session(session_id).await {
            Ok(info) => info.is_sub_agent(),
            Err(e) => {
                warn!(
                    "Session lookup for {} failed, treating it as top-level: {e}",
                    short_id(session_id)
                );
                false
            }
        };

        let mut state = SessionState::new(session_id);
        state.is_sub_agent = is_sub_agent;
        state.manual_mode = manual_default;
        state.last_compaction = find_last_compaction_timestamp(transcript);
        state.restore_pending = !is_sub_agent;

        let mut inner = self.lock();
        let stamp = inner.tick();
        let mut created = false;
        inner
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                created = true;
                state.last_active = stamp;
                state
            });
        drop(inner);

        if created {
            info!(
                "Initialized session {} (sub-agent: {})",
                short_id(session_id),
                is_sub_agent
            );
        }
        created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::InMemoryHost;
    use crate::state::{PruneOrigin, PruneSource};

    fn mark(store: &SessionStore, session: &str, id: &str) {
        store.with_session(session, |s| {
            s.prune.mark_tool(
                id,
                1,
                PruneOrigin {
                    source: PruneSource::Manual,
                    origin_message_id: "m".into(),
                },
            )
        });
    }

    #[test]
    fn union_spans_top_level_sessions_only() {
        let store = SessionStore::new();
        store.create("a", false);
        store.create("b", false);
        store.create("child", true);
        mark(&store, "a", "Call-1");
        mark(&store, "b", "call-9");
        mark(&store, "child", "call-x");

        let listing = vec![
            SessionInfo::top_level("a"),
            SessionInfo::top_level("b"),
            SessionInfo::child("child", "a"),
            SessionInfo::top_level("untracked"),
        ];
        let ids = store.pruned_tool_ids(&listing);
        assert!(ids.contains("call-1"));
        assert!(ids.contains("call-9"));
        assert!(!ids.contains("call-x"));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn most_recent_follows_mutation() {
        let store = SessionStore::new();
        store.create("a", false);
        store.create("b", false);
        store.create("c", true);
        assert_eq!(store.most_recent_top_level().as_deref(), Some("b"));
        store.with_session("a", |_| ());
        assert_eq!(store.most_recent_top_level().as_deref(), Some("a"));
        store.with_session("c", |_| ());
        assert_eq!(store.most_recent_top_level().as_deref(), Some("a"));
    }

    #[test]
    fn create_is_idempotent_and_drop_removes() {
        let store = SessionStore::new();
        assert!(store.create("a", false));
        mark(&store, "a", "t");
        assert!(!store.create("a", false));
        assert_eq!(store.read("a", |s| s.prune.tools.len()), Some(1));
        assert!(store.drop_session("a").is_some());
        assert!(!store.contains("a"));
    }

    #[tokio::test]
    async fn ensure_initialized_asks_host_once() {
        let host = InMemoryHost::new()
            .with_session(SessionInfo::top_level("a"))
            .with_session(SessionInfo::child("sub", "a"));
        let store = SessionStore::new();
        let transcript = vec![Message::assistant("s", 77, vec![]).as_summary()];

        assert!(store.ensure_initialized(&host, "a", &transcript, true).await);
        assert!(!store.ensure_initialized(&host, "a", &[], false).await);
        let state = store.snapshot("a").unwrap();
        assert!(state.manual_mode);
        assert_eq!(state.last_compaction, 77);

        store.ensure_initialized(&host, "sub", &[], false).await;
        assert!(store.read("sub", |s| s.is_sub_agent).unwrap());
        assert!(!store.read("sub", |s| s.restore_pending).unwrap());
    }

    #[tokio::test]
    async fn failed_lookup_counts_as_top_level() {
        let store = SessionStore::new();
        let host = InMemoryHost::new();
        assert!(store.ensure_initialized(&host, "ghost", &[], false).await);
        let state = store.snapshot("ghost").unwrap();
        assert!(!state.is_sub_agent);
        assert!(state.restore_pending);
    }
}
