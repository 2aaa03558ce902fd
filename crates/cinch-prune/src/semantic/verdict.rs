//! Judge verdict parsing, schema validation and whitelist filtering.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::error::{PruneError, Result};
use crate::json_schema_for;

/// What the judge is asked to return.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq, Eq)]
pub struct JudgeVerdict {
    /// Tool call ids whose outputs can be redacted.
    pub pruned_tool_call_ids: Vec<String>,
    /// Why these ids were chosen.
    #[serde(default)]
    pub reasoning: String,
}

/// Pull the JSON object out of a model reply that may be wrapped in prose
/// or a fenced code block.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    raw.get(start..=end)
}

/// Parse and schema-validate a raw judge reply.
pub fn parse_verdict(raw: &str) -> Result<JudgeVerdict> {
    let object = extract_json_object(raw)
        .ok_or_else(|| PruneError::JudgeResponse("no JSON object in reply".into()))?;
    let value: Value = serde_json::from_str(object)
        .map_err(|e| PruneError::JudgeResponse(format!("reply is not valid JSON: {e}")))?;

    let schema = json_schema_for::<JudgeVerdict>();
    let validator = jsonschema::validator_for(&schema)
        .map_err(|e| PruneError::JudgeResponse(format!("invalid verdict schema: {e}")))?;
    let errors: Vec<String> = validator
        .iter_errors(&value)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();
    if !errors.is_empty() {
        return Err(PruneError::JudgeResponse(errors.join("; ")));
    }

    serde_json::from_value(value).map_err(|e| PruneError::JudgeResponse(e.to_string()))
}

/// Split verdict ids into those on the eligible list (returned with the
/// eligible list's spelling, deduplicated) and those that are not.
///
/// Matching is case-insensitive.
pub fn filter_verdict(verdict: &JudgeVerdict, eligible: &[String]) -> (Vec<String>, Vec<String>) {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    let mut seen = HashSet::new();
    for id in &verdict.pruned_tool_call_ids {
        match eligible.iter().find(|e| e.eq_ignore_ascii_case(id)) {
            Some(e) => {
                if seen.insert(e.clone()) {
                    accepted.push(e.clone());
                }
            }
            None => rejected.push(id.clone()),
        }
    }
    (accepted, rejected)
}
