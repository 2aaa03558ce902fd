//! Outbound request redaction.
//!
//! [`Redactor`] sits in front of the host's network client. For every request
//! body it:
//!
//! 1. finds every array that carries tool traffic ([`format::WireBody`]),
//! 2. caches the tool arguments the body carries into session state,
//! 3. lists sessions once and unions every top-level session's redacted ids,
//! 4. replaces matching tool outputs with [`PLACEHOLDER`](crate::PLACEHOLDER).
//!
//! Any failure forwards the original body untouched. A body with nothing to
//! replace is also forwarded byte for byte.

pub mod anthropic;
pub mod chat;
pub mod format;
pub mod gemini;
pub mod responses;

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::host::{HostClient, SessionInfo};
use crate::short_id;
use crate::state::store::SessionStore;
use format::{RedactionContext, WireBody, WireFormat};

/// Result of passing a body through the redactor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedactOutcome {
    /// Nothing to replace; the original body.
    Unchanged(String),
    Rewritten {
        body: String,
        /// Formats of the arrays in which something was replaced.
        formats: Vec<WireFormat>,
        replaced: usize,
    },
    /// Something went wrong; the original body.
    FailedOpen { body: String, reason: String },
}

impl RedactOutcome {
    pub fn body(&self) -> &str {
        match self {
            RedactOutcome::Unchanged(body)
            | RedactOutcome::Rewritten { body, .. }
            | RedactOutcome::FailedOpen { body, .. } => body,
        }
    }

    pub fn into_body(self) -> String {
        match self {
            RedactOutcome::Unchanged(body)
            | RedactOutcome::Rewritten { body, .. }
            | RedactOutcome::FailedOpen { body, .. } => body,
        }
    }

    pub fn replaced(&self) -> usize {
        match self {
            RedactOutcome::Rewritten { replaced, .. } => *replaced,
            _ => 0,
        }
    }
}

/// Rewrites outbound provider request bodies from the shared session state.
#[derive(Clone)]
pub struct Redactor {
    store: SessionStore,
    host: Arc<dyn HostClient>,
}

impl Redactor {
    pub fn new(store: SessionStore, host: Arc<dyn HostClient>) -> Self {
        Self { store, host }
    }

    /// Redact a raw request body. `session_hint` names the session the
    /// request belongs to, when the host knows it.
    pub async fn redact_body(&self, session_hint: Option<&str>, body: &str) -> RedactOutcome {
        match self.try_redact(session_hint, body).await {
            Ok(Some((rewritten, formats, replaced))) => RedactOutcome::Rewritten {
                body: rewritten,
                formats,
                replaced,
            },
            Ok(None) => RedactOutcome::Unchanged(body.to_string()),
            Err(e) => {
                warn!("Redaction failed, forwarding original body: {e}");
                RedactOutcome::FailedOpen {
                    body: body.to_string(),
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_redact(
        &self,
        session_hint: Option<&str>,
        body: &str,
    ) -> Result<Option<(String, Vec<WireFormat>, usize)>> {
        let mut parsed: Value = serde_json::from_str(body)?;
        let mut sections = WireBody::detect(&mut parsed);
        if sections.is_empty() {
            return Ok(None);
        }

        let target = self.parameter_target(session_hint);
        if let Some(target) = &target {
            let local_map = self.store.position_map_for(target);
            let params: Vec<_> = sections
                .iter()
                .flat_map(|w| w.collect_parameters(&local_map))
                .collect();
            if !params.is_empty() {
                debug!("Cached {} tool parameter(s) for {}", params.len(), short_id(target));
                self.store
                    .with_session(target, |s| s.tool_parameters.extend(params));
            }
        }

        sections.retain(WireBody::has_tool_outputs);
        if sections.is_empty() {
            return Ok(None);
        }

        let sessions = self.host.list_sessions().await?;
        let pruned = self.store.pruned_tool_ids(&sessions);
        if pruned.is_empty() {
            return Ok(None);
        }

        let position_map = if sections.iter().any(|w| w.format() == WireFormat::Gemini) {
            let map = self.gemini_position_map(session_hint, &sessions);
            if map.is_none() {
                info!("No position map for Gemini contents, leaving them unredacted");
                sections.retain(|w| w.format() != WireFormat::Gemini);
            }
            map.unwrap_or_default()
        } else {
            HashMap::new()
        };

        let ctx = RedactionContext {
            pruned: &pruned,
            position_map: &position_map,
        };
        let mut formats = Vec::new();
        let mut replaced = 0;
        for section in &mut sections {
            let n = section.redact(&ctx);
            if n > 0 {
                formats.push(section.format());
                replaced += n;
            }
        }
        drop(sections);
        if replaced == 0 {
            return Ok(None);
        }

        let names: Vec<String> = formats.iter().map(ToString::to_string).collect();
        info!("Replaced {replaced} pruned tool output(s) ({})", names.join(", "));
        Ok(Some((serde_json::to_string(&parsed)?, formats, replaced)))
    }

    /// Session that receives cached tool parameters: the hinted session if
    /// tracked, otherwise the most recently active top-level session.
    fn parameter_target(&self, session_hint: Option<&str>) -> Option<String> {
        match session_hint {
            Some(id) if self.store.contains(id) => Some(id.to_string()),
            _ => self.store.most_recent_top_level(),
        }
    }

    /// The hinted session's map, else the first listed top-level session
    /// with a non-empty map.
    fn gemini_position_map(
        &self,
        session_hint: Option<&str>,
        sessions: &[SessionInfo],
    ) -> Option<HashMap<String, String>> {
        if let Some(id) = session_hint {
            let map = self.store.position_map_for(id);
            if !map.is_empty() {
                return Some(map);
            }
        }
        sessions
            .iter()
            .filter(|s| !s.is_sub_agent())
            .map(|s| self.store.position_map_for(&s.id))
            .find(|m| !m.is_empty())
    }
}

// ── Interceptor seam ──────────────────────────────────────────────

/// A request about to leave the host's network client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub url: String,
    pub session_id: Option<String>,
    pub body: Option<String>,
}

/// Boxed future returned by [`RequestInterceptor::intercept`].
pub type InterceptFuture<'a> = Pin<Box<dyn Future<Output = OutboundRequest> + Send + 'a>>;

/// `(request) -> request` hook registered with the host's network client.
///
/// Implementations must not fail: whatever goes wrong, they return a request
/// that is safe to send.
pub trait RequestInterceptor: Send + Sync {
    fn intercept(&self, request: OutboundRequest) -> InterceptFuture<'_>;
}

impl RequestInterceptor for Redactor {
    fn intercept(&self, mut request: OutboundRequest) -> InterceptFuture<'_> {
        Box::pin(async move {
            if let Some(body) = request.body.take() {
                let outcome = self.redact_body(request.session_id.as_deref(), &body).await;
                request.body = Some(outcome.into_body());
            }
            request
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PLACEHOLDER;
    use crate::host::InMemoryHost;
    use crate::state::{PruneOrigin, PruneSource};
    use serde_json::json;

    fn setup(ids: &[(&str, &str)]) -> (SessionStore, InMemoryHost, Redactor) {
        let store = SessionStore::new();
        let host = InMemoryHost::new();
        for (session, id) in ids {
            if !store.contains(session) {
                store.create(session, false);
                host.add_session(SessionInfo::top_level(*session));
            }
            store.with_session(session, |s| {
                s.prune.mark_tool(
                    id,
                    10,
                    PruneOrigin {
                        source: PruneSource::Manual,
                        origin_message_id: "m".into(),
                    },
                )
            });
        }
        let redactor = Redactor::new(store.clone(), Arc::new(host.clone()));
        (store, host, redactor)
    }

    #[tokio::test]
    async fn non_json_body_fails_open() {
        let (_, _, redactor) = setup(&[("a", "t1")]);
        let outcome = redactor.redact_body(None, "not json {").await;
        assert!(matches!(outcome, RedactOutcome::FailedOpen { .. }));
        assert_eq!(outcome.body(), "not json {");
    }

    #[tokio::test]
    async fn listing_failure_fails_open() {
        let (_, host, redactor) = setup(&[("a", "t1")]);
        host.set_fail_listing(true);
        let body = json!({"messages": [{"role": "tool", "tool_call_id": "t1", "content": "x"}]}).to_string();
        let outcome = redactor.redact_body(None, &body).await;
        assert!(matches!(outcome, RedactOutcome::FailedOpen { .. }));
        assert_eq!(outcome.into_body(), body);
    }

    #[tokio::test]
    async fn rewrites_then_is_byte_identical() {
        let (_, _, redactor) = setup(&[("a", "T1")]);
        let body = json!({"model": "x", "messages": [
            {"role": "tool", "tool_call_id": "t1", "content": "huge"}
        ]})
        .to_string();

        let first = redactor.redact_body(Some("a"), &body).await;
        assert_eq!(first.replaced(), 1);
        let rewritten = first.into_body();
        let v: Value = serde_json::from_str(&rewritten).unwrap();
        assert_eq!(v["messages"][0]["content"], PLACEHOLDER);

        let second = redactor.redact_body(Some("a"), &rewritten).await;
        assert_eq!(second, RedactOutcome::Unchanged(rewritten.clone()));
    }

    #[tokio::test]
    async fn caches_parameters_into_most_recent_session() {
        let (store, _, redactor) = setup(&[("a", "x"), ("b", "y")]);
        store.with_session("a", |_| ());
        let body = json!({"messages": [{"role": "assistant", "tool_calls": [
            {"id": "c1", "type": "function", "function": {"name": "read", "arguments": "{\"filePath\":\"f\"}"}}
        ]}]})
        .to_string();
        redactor.redact_body(None, &body).await;
        assert!(store.read("a", |s| s.tool_parameters.contains_key("c1")).unwrap());
        assert!(!store.read("b", |s| s.tool_parameters.contains_key("c1")).unwrap());
    }

    #[tokio::test]
    async fn every_tool_array_in_a_body_is_redacted() {
        let (_, _, redactor) = setup(&[("a", "c1"), ("a", "c2"), ("a", "fc_3")]);
        let body = json!({
            "messages": [
                {"role": "tool", "tool_call_id": "c1", "content": "x"},
                {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "c2", "content": "y"}]}
            ],
            "input": [{"type": "function_call_output", "call_id": "fc_3", "output": "z"}]
        })
        .to_string();

        let outcome = redactor.redact_body(Some("a"), &body).await;
        assert_eq!(outcome.replaced(), 3);
        let RedactOutcome::Rewritten { formats, .. } = &outcome else {
            panic!("expected a rewrite, got {outcome:?}");
        };
        assert_eq!(formats, &vec![WireFormat::Messages, WireFormat::Responses]);
        let v: Value = serde_json::from_str(outcome.body()).unwrap();
        assert_eq!(v["messages"][0]["content"], PLACEHOLDER);
        assert_eq!(v["messages"][1]["content"][0]["content"], PLACEHOLDER);
        assert_eq!(v["input"][0]["output"], PLACEHOLDER);
    }

    #[tokio::test]
    async fn gemini_without_position_map_is_unchanged() {
        let (_, _, redactor) = setup(&[("a", "id1")]);
        let body = json!({"contents": [{"role": "user", "parts": [
            {"functionResponse": {"name": "read", "response": {"output": "A"}}}
        ]}]})
        .to_string();
        let outcome = redactor.redact_body(Some("a"), &body).await;
        assert_eq!(outcome, RedactOutcome::Unchanged(body));
    }

    #[tokio::test]
    async fn interceptor_rewrites_body_and_keeps_url() {
        let (_, _, redactor) = setup(&[("a", "fc_1")]);
        let body = json!({"input": [{"type": "function_call_output", "call_id": "fc_1", "output": "big"}]}).to_string();
        let request = OutboundRequest {
            url: "https://api.example/v1/responses".into(),
            session_id: Some("a".into()),
            body: Some(body),
        };
        let out = redactor.intercept(request).await;
        assert_eq!(out.url, "https://api.example/v1/responses");
        assert!(out.body.unwrap().contains(PLACEHOLDER));
    }
}
