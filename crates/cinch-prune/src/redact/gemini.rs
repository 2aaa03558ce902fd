//! Gemini bodies: `functionResponse` parts correlated by position.
//!
//! See [`crate::correlator`] for how positions map to call ids.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::format::parse_arguments;
use crate::PLACEHOLDER;
use crate::correlator::position_key;
use crate::state::ToolParameters;

fn parts(content: &Value) -> impl Iterator<Item = &Value> {
    content
        .get("parts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

pub fn has_tool_outputs(contents: &[Value]) -> bool {
    contents
        .iter()
        .flat_map(parts)
        .any(|p| p.get("functionResponse").is_some())
}

/// Arguments of `functionCall` parts, resolved to call ids by position.
pub fn collect_parameters(
    contents: &[Value],
    position_map: &HashMap<String, String>,
) -> Vec<(String, ToolParameters)> {
    let mut counters: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::new();
    for call in contents.iter().flat_map(parts).filter_map(|p| p.get("functionCall")) {
        let Some(name) = call.get("name").and_then(Value::as_str) else {
            continue;
        };
        let name = name.to_lowercase();
        let counter = counters.entry(name.clone()).or_insert(0);
        let key = position_key(&name, *counter);
        *counter += 1;
        let (Some(id), Some(parameters)) = (position_map.get(&key), parse_arguments(call.get("args")))
        else {
            continue;
        };
        out.push((
            id.clone(),
            ToolParameters {
                tool: name,
                parameters,
            },
        ));
    }
    out
}

/// Replace `functionResponse.response` of redacted calls. Every other field
/// of the part (including `thoughtSignature`) is left as is.
pub fn redact(
    contents: &mut [Value],
    pruned: &HashSet<String>,
    position_map: &HashMap<String, String>,
) -> usize {
    let mut counters: HashMap<String, usize> = HashMap::new();
    let mut replaced = 0;
    for content in contents.iter_mut() {
        let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) else {
            continue;
        };
        for part in parts.iter_mut() {
            let Some(response) = part.get_mut("functionResponse").and_then(Value::as_object_mut)
            else {
                continue;
            };
            let Some(name) = response.get("name").and_then(Value::as_str) else {
                continue;
            };
            let name = name.to_lowercase();
            let counter = counters.entry(name.clone()).or_insert(0);
            let key = position_key(&name, *counter);
            *counter += 1;

            let hit = position_map.get(&key).is_some_and(|id| pruned.contains(id));
            if !hit || response.get("response").and_then(Value::as_str) == Some(PLACEHOLDER) {
                continue;
            }
            response.insert("response".into(), Value::String(PLACEHOLDER.into()));
            replaced += 1;
        }
    }
    replaced
}
