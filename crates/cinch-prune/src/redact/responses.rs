//! OpenAI Responses API bodies: `function_call_output` items keyed by `call_id`.

use serde_json::Value;
use std::collections::HashSet;

use super::format::{id_field, parse_arguments};
use crate::PLACEHOLDER;
use crate::state::ToolParameters;

fn item_type(item: &Value) -> Option<&str> {
    item.get("type").and_then(Value::as_str)
}

pub fn has_tool_outputs(input: &[Value]) -> bool {
    input.iter().any(|i| item_type(i) == Some("function_call_output"))
}

pub fn collect_parameters(input: &[Value]) -> Vec<(String, ToolParameters)> {
    input
        .iter()
        .filter(|i| item_type(i) == Some("function_call"))
        .filter_map(|i| {
            let id = i.get("call_id")?.as_str()?;
            let name = i.get("name")?.as_str()?;
            let parameters = parse_arguments(i.get("arguments"))?;
            Some((
                id.to_string(),
                ToolParameters {
                    tool: name.to_string(),
                    parameters,
                },
            ))
        })
        .collect()
}

pub fn redact(input: &mut [Value], pruned: &HashSet<String>) -> usize {
    let mut replaced = 0;
    for item in input.iter_mut() {
        if item_type(item) != Some("function_call_output") {
            continue;
        }
        let hit = id_field(item, "call_id").is_some_and(|id| pruned.contains(&id));
        if !hit || item.get("output").and_then(Value::as_str) == Some(PLACEHOLDER) {
            continue;
        }
        if let Some(obj) = item.as_object_mut() {
            obj.insert("output".into(), Value::String(PLACEHOLDER.into()));
            replaced += 1;
        }
    }
    replaced
}
