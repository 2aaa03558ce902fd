//! Anthropic messages bodies: `tool_result` blocks inside user content arrays.

use serde_json::Value;
use std::collections::HashSet;

use super::format::id_field;
use crate::PLACEHOLDER;
use crate::state::ToolParameters;

fn blocks(m: &Value) -> impl Iterator<Item = &Value> {
    m.get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn block_type(block: &Value) -> Option<&str> {
    block.get("type").and_then(Value::as_str)
}

pub fn has_tool_outputs(messages: &[Value]) -> bool {
    messages
        .iter()
        .filter(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .flat_map(blocks)
        .any(|b| block_type(b) == Some("tool_result"))
}

/// Inputs of assistant `tool_use` blocks.
pub fn collect_parameters(messages: &[Value]) -> Vec<(String, ToolParameters)> {
    messages
        .iter()
        .filter(|m| m.get("role").and_then(Value::as_str) == Some("assistant"))
        .flat_map(blocks)
        .filter(|b| block_type(b) == Some("tool_use"))
        .filter_map(|b| {
            let id = b.get("id")?.as_str()?;
            let name = b.get("name")?.as_str()?;
            Some((
                id.to_string(),
                ToolParameters {
                    tool: name.to_string(),
                    parameters: b.get("input").cloned().unwrap_or(Value::Null),
                },
            ))
        })
        .collect()
}

pub fn redact(messages: &mut [Value], pruned: &HashSet<String>) -> usize {
    let mut replaced = 0;
    for m in messages.iter_mut() {
        if m.get("role").and_then(Value::as_str) != Some("user") {
            continue;
        }
        let Some(content) = m.get_mut("content").and_then(Value::as_array_mut) else {
            continue;
        };
        for block in content.iter_mut() {
            if block_type(block) != Some("tool_result") {
                continue;
            }
            let hit = id_field(block, "tool_use_id").is_some_and(|id| pruned.contains(&id));
            if !hit || block.get("content").and_then(Value::as_str) == Some(PLACEHOLDER) {
                continue;
            }
            if let Some(obj) = block.as_object_mut() {
                obj.insert("content".into(), Value::String(PLACEHOLDER.into()));
                replaced += 1;
            }
        }
    }
    replaced
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body() -> Vec<Value> {
        vec![
            json!({"role": "assistant", "content": [
                {"type": "text", "text": "reading"},
                {"type": "tool_use", "id": "toolu_1", "name": "read", "input": {"filePath": "a.rs"}}
            ]}),
            json!({"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "TOOLU_1", "content": [{"type": "text", "text": "long"}], "is_error": false},
                {"type": "text", "text": "next"}
            ]}),
        ]
    }

    #[test]
    fn replaces_tool_result_content_only() {
        let mut messages = body();
        let pruned: HashSet<String> = ["toolu_1".to_string()].into();
        assert!(has_tool_outputs(&messages));
        assert_eq!(redact(&mut messages, &pruned), 1);
        let block = &messages[1]["content"][0];
        assert_eq!(block["content"], PLACEHOLDER);
        assert_eq!(block["is_error"], false);
        assert_eq!(messages[1]["content"][1]["text"], "next");
        assert_eq!(redact(&mut messages, &pruned), 0);
    }

    #[test]
    fn collects_tool_use_inputs() {
        let params = collect_parameters(&body());
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].0, "toolu_1");
        assert_eq!(params[0].1.parameters["filePath"], "a.rs");
    }
}
