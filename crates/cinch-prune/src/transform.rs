//! Transcript-level redaction and prunable-tools context.
//!
//! The message-transform hook hands the host's transcript to this module
//! before every model request. Redacted tool outputs are swapped for the
//! placeholder (or their distillation), compressed ranges collapse to their
//! summary, and a synthetic user message lists what is still prunable.

use tracing::debug;

use crate::config::PruneConfig;
use crate::state::SessionState;
use crate::strategies::{collect_tool_calls, resource_path, summarize_args};
use crate::{Message, MessageRole, PLACEHOLDER, Part, ToolStatus, short_id};

/// System-prompt fragments of the host's own helper agents. Those requests
/// never get prunable-tools context.
pub const INTERNAL_AGENT_SIGNATURES: &[&str] = &[
    "You are a title generator",
    "You are a helpful AI assistant tasked with summarizing conversations",
    "Summarize what was done in this conversation",
];

pub const NUDGE: &str = "Context is growing. Review the list above and prune tool outputs you no longer need.";

/// Id of the injected context message.
pub const CONTEXT_MESSAGE_ID: &str = "prune-context";

pub fn is_internal_agent(system_prompt: &str) -> bool {
    INTERNAL_AGENT_SIGNATURES
        .iter()
        .any(|sig| system_prompt.contains(sig))
}

fn compressed_text(topic: &str, summary: &str) -> String {
    format!("[Compressed: {topic}]\n{summary}")
}

fn replace(slot: &mut String, with: &str) -> bool {
    if slot == with {
        return false;
    }
    *slot = with.to_string();
    true
}

/// Apply the session's redactions to `messages` in place. Returns the number
/// of fields rewritten; a second call on the same transcript returns 0.
pub fn apply_redactions(state: &SessionState, messages: &mut [Message]) -> usize {
    let mut rewritten = 0;
    for msg in messages.iter_mut() {
        if let Some(summary) = state
            .compress_summaries
            .iter()
            .find(|s| s.start_message_id == msg.info.id)
        {
            let text = compressed_text(&summary.topic, &summary.summary);
            let already = matches!(msg.parts.as_slice(), [Part::Text { text: t, .. }] if *t == text);
            if !already {
                msg.parts = vec![Part::synthetic(text)];
                rewritten += 1;
            }
            continue;
        }

        let whole_message = state.prune.messages.contains_key(&msg.info.id);
        for part in &mut msg.parts {
            match part {
                Part::Text { text, .. } if whole_message => {
                    rewritten += usize::from(replace(text, PLACEHOLDER));
                }
                Part::Tool(tool) => {
                    if !whole_message && !state.prune.is_tool_pruned(&tool.call_id) {
                        continue;
                    }
                    let with = state
                        .distillations
                        .get(&tool.call_id)
                        .map_or(PLACEHOLDER, String::as_str);
                    let slot = match tool.state.status {
                        ToolStatus::Completed => tool.state.output.get_or_insert_with(String::new),
                        ToolStatus::Error => tool.state.error.get_or_insert_with(String::new),
                        ToolStatus::Pending | ToolStatus::Running => continue,
                    };
                    rewritten += usize::from(replace(slot, with));
                }
                _ => {}
            }
        }
    }
    if rewritten > 0 {
        debug!(
            "Rewrote {rewritten} transcript field(s) for session {}",
            short_id(&state.session_id)
        );
    }
    rewritten
}

/// The `<prunable-tools>` block for the current transcript, assigning compact
/// references to any calls seen for the first time. `None` if nothing is prunable.
pub fn build_prunable_tools_list(
    state: &mut SessionState,
    config: &PruneConfig,
    messages: &[Message],
) -> Option<String> {
    let mut records = collect_tool_calls(state, messages);
    records.retain(|r| !state.prune.is_tool_pruned(&r.call_id) && !config.is_protected(&r.tool, &[]));

    let lines: Vec<String> = records
        .iter()
        .map(|r| {
            let reference = state.message_ids.assign(&r.call_id);
            let key = match resource_path(&r.input) {
                Some(path) => path.to_string(),
                None => summarize_args(&r.input, 60),
            };
            if key.is_empty() {
                format!("{reference}: {}", r.tool)
            } else {
                format!("{reference}: {}, {key}", r.tool)
            }
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(format!(
        "<prunable-tools>\nThe following tool outputs can be removed with the prune, distill or compress tools. Refer to them by number.\n{}\n</prunable-tools>",
        lines.join("\n")
    ))
}

/// Append the prunable-tools message to `messages`. Returns whether a message
/// was injected.
///
/// Skipped in manual mode and on the request right after a pruning tool call.
/// The nudge counter advances once per transform that saw new tool calls.
pub fn inject_prune_context(
    state: &mut SessionState,
    config: &PruneConfig,
    messages: &mut Vec<Message>,
) -> bool {
    if state.manual_mode {
        return false;
    }

    let tool_count = collect_tool_calls(state, messages).len();
    if tool_count > state.last_tool_count {
        state.nudge_counter += 1;
    }
    state.last_tool_count = tool_count;

    if state.last_tool_prune {
        state.last_tool_prune = false;
        return false;
    }

    let Some(mut text) = build_prunable_tools_list(state, config, messages) else {
        return false;
    };
    if config.nudge_frequency > 0 && state.nudge_counter >= config.nudge_frequency {
        text.push_str("\n\n");
        text.push_str(NUDGE);
        state.nudge_counter = 0;
    }

    let created = messages.last().map_or(0, |m| m.info.time.created);
    messages.push(Message::new(
        CONTEXT_MESSAGE_ID,
        MessageRole::User,
        created,
        vec![Part::synthetic(text)],
    ));
    true
}
