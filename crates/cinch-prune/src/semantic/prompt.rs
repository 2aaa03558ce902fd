//! Judge prompt construction.

use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;

use crate::strategies::names::{BATCH, is_file_tool};
use crate::strategies::resource_path;
use crate::{Message, MessageRole, PLACEHOLDER, Part};

/// A transcript message stripped to what the judge needs.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MinimizedMessage {
    pub role: MessageRole,
    pub parts: Vec<MinimizedPart>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MinimizedPart {
    Text {
        text: String,
    },
    Tool {
        #[serde(rename = "callID")]
        call_id: String,
        tool: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
}

/// Shrink tool inputs: file tools keep only their path, batches collapse to
/// a count and the tool names they ran.
fn minimize_input(tool: &str, input: &Value) -> Option<Value> {
    if input.is_null() {
        return None;
    }
    if let Some(path) = resource_path(input)
        && is_file_tool(tool)
    {
        return Some(json!({ "filePath": path }));
    }
    if tool.eq_ignore_ascii_case(BATCH)
        && let Some(calls) = input.get("tool_calls").and_then(Value::as_array)
    {
        let tools: Vec<&str> = calls
            .iter()
            .filter_map(|c| c.get("tool").and_then(Value::as_str))
            .collect();
        return Some(json!({
            "batch_summary": format!("{} tool calls", calls.len()),
            "tools": tools,
        }));
    }
    Some(input.clone())
}

/// Drop step markers and irrelevant parts; show redacted outputs as the placeholder.
pub fn minimize_messages(
    messages: &[Message],
    redacted: &HashMap<String, u64>,
) -> Vec<MinimizedMessage> {
    messages
        .iter()
        .map(|msg| MinimizedMessage {
            role: msg.info.role,
            parts: msg
                .parts
                .iter()
                .filter_map(|part| match part {
                    Part::Text { text, .. } => Some(MinimizedPart::Text { text: text.clone() }),
                    Part::Tool(t) => {
                        let output = if redacted.contains_key(&t.call_id) {
                            Some(PLACEHOLDER.to_string())
                        } else {
                            t.state.output.clone().or_else(|| t.state.error.clone())
                        };
                        Some(MinimizedPart::Tool {
                            call_id: t.call_id.clone(),
                            tool: t.tool.clone(),
                            input: minimize_input(&t.tool, &t.state.input),
                            output,
                        })
                    }
                    _ => None,
                })
                .collect(),
        })
        .collect()
}

/// The single instruction sent to the judge.
pub fn build_analysis_prompt(
    eligible_ids: &[String],
    messages: &[Message],
    redacted: &HashMap<String, u64>,
    protected_tools: &[String],
) -> String {
    let history = serde_json::to_string_pretty(&minimize_messages(messages, redacted))
        .unwrap_or_else(|_| "[]".to_string());

    let protected_line = if protected_tools.is_empty() {
        String::new()
    } else {
        format!(
            "- Any call to a protected tool: {}\n",
            protected_tools.join(", ")
        )
    };

    format!(
        "You review a coding agent's session and pick tool outputs that no longer need to stay in context.\n\
         \n\
         Good candidates:\n\
         1. Outputs made stale by a later read of the same file or resource\n\
         2. Exploratory reads that led to no edit and no discussion\n\
         3. Old calls (more than about ten turns back) that nothing refers to any more\n\
         4. Error outputs for problems that were fixed afterwards\n\
         5. Results whose information a newer operation replaced\n\
         \n\
         Keep:\n\
         {protected_line}\
         - Calls that changed state, such as edits and writes\n\
         - Outputs the conversation is still discussing\n\
         - Errors that are still being debugged\n\
         - Anything the user asked to keep or remember\n\
         - The single most recent call in the session\n\
         \n\
         Eligible tool call ids: {eligible}\n\
         \n\
         The history may mention other ids. Those are already redacted and must not be returned.\n\
         \n\
         Session history:\n\
         {history}\n\
         \n\
         Reply with JSON only, in exactly this shape:\n\
         {{\n  \"pruned_tool_call_ids\": [\"id1\", \"id2\"],\n  \"reasoning\": \"why these were chosen\"\n}}\n\
         Every id you return must come from the eligible list.",
        eligible = eligible_ids.join(", "),
    )
}
