//! Repeated reads of the same resource: keep only the most recent one.

use std::collections::HashMap;

use super::names::is_write_tool;
use super::{ToolCallRecord, collect_tool_calls, mark_record, resource_key};
use crate::Message;
use crate::config::PruneConfig;
use crate::state::{PruneSource, SessionState};

pub fn deduplicate(state: &mut SessionState, config: &PruneConfig, messages: &[Message]) -> usize {
    let dedup = &config.strategies.deduplication;
    if !dedup.enabled {
        return 0;
    }

    let records = collect_tool_calls(state, messages);
    let mut groups: HashMap<String, Vec<&ToolCallRecord>> = HashMap::new();
    for record in &records {
        if record.is_error
            || is_write_tool(&record.tool)
            || config.is_protected(&record.tool, &dedup.protected_tools)
        {
            continue;
        }
        groups
            .entry(resource_key(&record.tool, &record.input))
            .or_default()
            .push(record);
    }

    let mut marked = 0;
    for group in groups.values() {
        let Some((_latest, older)) = group.split_last() else {
            continue;
        };
        for record in older {
            if mark_record(state, record, PruneSource::Deduplication) {
                marked += 1;
            }
        }
    }
    marked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Part;
    use serde_json::json;

    fn read(id: &str, path: &str) -> Part {
        Part::tool(id, "read", json!({"filePath": path}), format!("contents of {path}"))
    }

    fn transcript(parts: Vec<Part>) -> Vec<Message> {
        vec![Message::assistant("m1", 1, parts)]
    }

    #[test]
    fn keeps_most_recent_read() {
        let mut state = SessionState::new("s");
        let msgs = transcript(vec![read("r1", "a"), read("r2", "b"), read("r3", "a"), read("r4", "a")]);
        assert_eq!(deduplicate(&mut state, &PruneConfig::default(), &msgs), 2);
        assert!(state.prune.is_tool_pruned("r1"));
        assert!(state.prune.is_tool_pruned("r3"));
        assert!(!state.prune.is_tool_pruned("r4"));
        assert!(!state.prune.is_tool_pruned("r2"));
        assert_eq!(state.prune.origins["r1"].source, PruneSource::Deduplication);
        assert_eq!(state.prune.origins["r1"].origin_message_id, "m1");
    }

    #[test]
    fn idempotent() {
        let mut state = SessionState::new("s");
        let config = PruneConfig::default();
        let msgs = transcript(vec![read("r1", "a"), read("r2", "a")]);
        assert_eq!(deduplicate(&mut state, &config, &msgs), 1);
        let before = state.prune.clone();
        assert_eq!(deduplicate(&mut state, &config, &msgs), 0);
        assert_eq!(state.prune, before);
    }

    #[test]
    fn respects_protection_and_disable() {
        let msgs = transcript(vec![read("r1", "a"), read("r2", "a")]);

        let mut state = SessionState::new("s");
        let mut config = PruneConfig::default();
        config.strategies.deduplication.protected_tools = vec!["READ".into()];
        assert_eq!(deduplicate(&mut state, &config, &msgs), 0);

        let mut config = PruneConfig::default();
        config.strategies.deduplication.enabled = false;
        assert_eq!(deduplicate(&mut state, &config, &msgs), 0);
        assert!(state.prune.tools.is_empty());
    }

    #[test]
    fn falls_back_to_canonical_args() {
        let mut state = SessionState::new("s");
        let msgs = transcript(vec![
            Part::tool("g1", "grep", json!({"pattern": "x", "glob": "*.rs"}), "hit"),
            Part::tool("g2", "grep", json!({"glob": "*.rs", "pattern": "x"}), "hit"),
            Part::tool("g3", "grep", json!({"pattern": "y"}), "hit"),
        ]);
        assert_eq!(deduplicate(&mut state, &PruneConfig::default(), &msgs), 1);
        assert!(state.prune.is_tool_pruned("g1"));
    }

    #[test]
    fn leaves_already_pruned_untouched() {
        let mut state = SessionState::new("s");
        state.prune.tools.insert("r1".into(), 999);
        let msgs = transcript(vec![read("r1", "a"), read("r2", "a")]);
        assert_eq!(deduplicate(&mut state, &PruneConfig::default(), &msgs), 0);
        assert_eq!(state.prune.tools["r1"], 999);
        assert!(!state.prune.origins.contains_key("r1"));
    }
}
