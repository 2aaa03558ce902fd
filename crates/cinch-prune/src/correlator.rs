//! Position-based correlation for the wire format without call identifiers.
//!
//! Gemini's `functionResponse` parts carry a function name but no call id.
//! The n-th response for tool `T` in a request is assumed to correspond to the
//! n-th `T` call in the host transcript, so the map is keyed `"t:n"` with the
//! tool name lower-cased.
//!
//! This breaks silently if the provider reorders or drops responses relative
//! to the transcript: the wrong output is redacted (or kept). There is no
//! authoritative id to detect it with.

use std::collections::HashMap;

use crate::state::SessionState;
use crate::state::reconcile::is_message_compacted;
use crate::{Message, Part};

/// Providers whose requests are correlated by position.
pub const POSITION_CORRELATED_PROVIDERS: &[&str] = &["google", "google-vertex"];

pub fn is_position_correlated_provider(provider_id: &str) -> bool {
    POSITION_CORRELATED_PROVIDERS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(provider_id))
}

pub fn position_key(tool: &str, index: usize) -> String {
    format!("{}:{}", tool.to_lowercase(), index)
}

/// Walk the transcript in order and map `"<tool>:<index>"` to call ids.
///
/// Messages before the last compaction are not sent to the provider, so they
/// take no positions. Call ids are lower-cased to match the redactor's
/// aggregated id set.
pub fn build_position_map(state: &SessionState, messages: &[Message]) -> HashMap<String, String> {
    let mut per_tool: HashMap<String, usize> = HashMap::new();
    let mut map = HashMap::new();
    for msg in messages.iter().filter(|m| !is_message_compacted(state, m)) {
        for part in &msg.parts {
            let Part::Tool(tool) = part else {
                continue;
            };
            let name = tool.tool.to_lowercase();
            let counter = per_tool.entry(name.clone()).or_insert(0);
            map.insert(position_key(&name, *counter), tool.call_id.to_lowercase());
            *counter += 1;
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn indexes_per_tool_in_order() {
        let msgs = vec![
            Message::assistant(
                "m1",
                1,
                vec![
                    Part::tool("ID1", "Read", json!({}), "a"),
                    Part::tool("g1", "grep", json!({}), "b"),
                ],
            ),
            Message::assistant("m2", 2, vec![Part::tool("id2", "read", json!({}), "c")]),
        ];
        let map = build_position_map(&SessionState::new("s"), &msgs);
        assert_eq!(map.get("read:0").map(String::as_str), Some("id1"));
        assert_eq!(map.get("read:1").map(String::as_str), Some("id2"));
        assert_eq!(map.get("grep:0").map(String::as_str), Some("g1"));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn compacted_messages_take_no_positions() {
        let mut state = SessionState::new("s");
        state.last_compaction = 50;
        let msgs = vec![
            Message::assistant("old", 10, vec![Part::tool("id0", "read", json!({}), "a")]),
            Message::assistant("new", 60, vec![Part::tool("id1", "read", json!({}), "b")]),
        ];
        let map = build_position_map(&state, &msgs);
        assert_eq!(map.get("read:0").map(String::as_str), Some("id1"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn provider_detection() {
        assert!(is_position_correlated_provider("google"));
        assert!(is_position_correlated_provider("Google-Vertex"));
        assert!(!is_position_correlated_provider("anthropic"));
    }
}
