//! OpenAI chat-completions bodies: `role: "tool"` messages keyed by `tool_call_id`.

use serde_json::Value;
use std::collections::HashSet;

use super::format::{id_field, parse_arguments};
use crate::PLACEHOLDER;
use crate::state::ToolParameters;

fn is_tool_message(m: &Value) -> bool {
    m.get("role").and_then(Value::as_str) == Some("tool")
}

pub fn has_tool_outputs(messages: &[Value]) -> bool {
    messages.iter().any(is_tool_message)
}

/// Arguments of assistant `tool_calls`.
pub fn collect_parameters(messages: &[Value]) -> Vec<(String, ToolParameters)> {
    let mut out = Vec::new();
    for m in messages {
        if m.get("role").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let Some(calls) = m.get("tool_calls").and_then(Value::as_array) else {
            continue;
        };
        for call in calls {
            let id = call.get("id").and_then(Value::as_str);
            let function = call.get("function");
            let name = function.and_then(|f| f.get("name")).and_then(Value::as_str);
            let (Some(id), Some(name)) = (id, name) else {
                continue;
            };
            if let Some(parameters) = parse_arguments(function.and_then(|f| f.get("arguments"))) {
                out.push((
                    id.to_string(),
                    ToolParameters {
                        tool: name.to_string(),
                        parameters,
                    },
                ));
            }
        }
    }
    out
}

pub fn redact(messages: &mut [Value], pruned: &HashSet<String>) -> usize {
    let mut replaced = 0;
    for m in messages.iter_mut().filter(|m| is_tool_message(m)) {
        let hit = id_field(m, "tool_call_id").is_some_and(|id| pruned.contains(&id));
        if !hit || m.get("content").and_then(Value::as_str) == Some(PLACEHOLDER) {
            continue;
        }
        if let Some(obj) = m.as_object_mut() {
            obj.insert("content".into(), Value::String(PLACEHOLDER.into()));
            replaced += 1;
        }
    }
    replaced
}
