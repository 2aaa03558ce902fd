//! Keeping session state consistent with the live transcript.

use std::collections::HashSet;
use tracing::{debug, info};

use super::SessionState;
use crate::{Message, MessageRole, Part, short_id};

/// Creation time of the most recent compaction summary, or 0 if none.
pub fn find_last_compaction_timestamp(messages: &[Message]) -> i64 {
    messages
        .iter()
        .rev()
        .find(|m| m.info.role == MessageRole::Assistant && m.info.summary)
        .map_or(0, |m| m.info.time.created)
}

/// Reset the session if the transcript shows a compaction newer than the
/// last one observed. Returns `true` if a reset happened.
pub fn check_session(state: &mut SessionState, messages: &[Message]) -> bool {
    let latest = find_last_compaction_timestamp(messages);
    if latest > state.last_compaction {
        info!(
            "Compaction detected for session {}, resetting prune state",
            short_id(&state.session_id)
        );
        state.reset_on_compaction(latest);
        return true;
    }
    false
}

/// Messages created before the last compaction are no longer sent to the model.
pub fn is_message_compacted(state: &SessionState, message: &Message) -> bool {
    message.info.time.created < state.last_compaction
}

/// Number of `step-start` markers in messages that survived compaction.
pub fn count_turns(state: &SessionState, messages: &[Message]) -> u32 {
    messages
        .iter()
        .filter(|m| !is_message_compacted(state, m))
        .flat_map(|m| m.parts.iter())
        .filter(|p| matches!(p, Part::StepStart))
        .count() as u32
}

/// Drop provenance entries that no longer hold.
///
/// An origin whose tool entry is gone is removed. An origin whose message is
/// no longer in the transcript is removed together with its tool entry.
/// Returns the number of origins removed.
pub fn reconcile_prune_origins(state: &mut SessionState, messages: &[Message]) -> usize {
    let live: HashSet<&str> = messages.iter().map(|m| m.info.id.as_str()).collect();
    let prune = &mut state.prune;
    let before = prune.origins.len();

    let mut orphaned_tools = Vec::new();
    prune.origins.retain(|call_id, origin| {
        if !prune.tools.contains_key(call_id) {
            return false;
        }
        if !live.contains(origin.origin_message_id.as_str()) {
            orphaned_tools.push(call_id.clone());
            return false;
        }
        true
    });
    for call_id in &orphaned_tools {
        prune.tools.remove(call_id);
    }

    let removed = before - prune.origins.len();
    if removed > 0 {
        debug!(
            "Reconciled {} origin(s), {} tool entr(ies) dropped for session {}",
            removed,
            orphaned_tools.len(),
            short_id(&state.session_id)
        );
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PruneOrigin, PruneSource};

    fn origin(msg: &str) -> PruneOrigin {
        PruneOrigin {
            source: PruneSource::Deduplication,
            origin_message_id: msg.into(),
        }
    }

    #[test]
    fn compaction_timestamp_uses_last_summary() {
        let msgs = vec![
            Message::assistant("a", 10, vec![]).as_summary(),
            Message::user("u", 20, "hi"),
            Message::assistant("b", 30, vec![]).as_summary(),
            Message::assistant("c", 40, vec![]),
        ];
        assert_eq!(find_last_compaction_timestamp(&msgs), 30);
        assert_eq!(find_last_compaction_timestamp(&msgs[1..2]), 0);
    }

    #[test]
    fn check_session_resets_only_on_newer_compaction() {
        let mut state = SessionState::new("s");
        state.prune.mark_tool("t", 5, origin("m"));
        let msgs = vec![Message::assistant("a", 10, vec![]).as_summary()];

        assert!(check_session(&mut state, &msgs));
        assert!(state.prune.tools.is_empty());
        state.prune.mark_tool("t2", 5, origin("m"));
        assert!(!check_session(&mut state, &msgs));
        assert_eq!(state.prune.tools.len(), 1);
    }

    #[test]
    fn turns_skip_compacted_messages() {
        let mut state = SessionState::new("s");
        state.last_compaction = 50;
        let msgs = vec![
            Message::assistant("old", 10, vec![Part::StepStart, Part::StepStart]),
            Message::assistant("new", 60, vec![Part::StepStart, Part::text("x")]),
            Message::assistant("newer", 70, vec![Part::StepStart, Part::StepFinish]),
        ];
        assert_eq!(count_turns(&state, &msgs), 2);
    }

    #[test]
    fn reconcile_removes_dangling_entries() {
        let mut state = SessionState::new("s");
        state.prune.mark_tool("keep", 1, origin("m1"));
        state.prune.mark_tool("gone-msg", 2, origin("m-deleted"));
        state.prune.origins.insert("no-tool".into(), origin("m1"));

        let msgs = vec![Message::user("m1", 1, "x")];
        let removed = reconcile_prune_origins(&mut state, &msgs);

        assert_eq!(removed, 2);
        assert!(state.prune.tools.contains_key("keep"));
        assert!(!state.prune.tools.contains_key("gone-msg"));
        assert!(!state.prune.origins.contains_key("no-tool"));
        assert!(state.prune.origins.keys().all(|k| state.prune.tools.contains_key(k)));
    }

    #[test]
    fn reconcile_keeps_tools_without_origin() {
        let mut state = SessionState::new("s");
        state.prune.tools.insert("legacy".into(), 0);
        assert_eq!(reconcile_prune_origins(&mut state, &[]), 0);
        assert!(state.prune.tools.contains_key("legacy"));
    }
}
