//! The `/dcp` command dispatcher.
//!
//! Commands either answer the user directly ([`CommandOutput::Message`]) or
//! replace the user's input with a prompt that makes the model call one of
//! the pruning tools ([`CommandOutput::Prompt`]).

use std::collections::BTreeMap;

use crate::config::{Permission, PruneConfig};
use crate::manual::sweep;
use crate::state::{PruneSource, SessionState};
use crate::transform::build_prunable_tools_list;
use crate::{Message, Part};

/// Characters per token for the `/dcp context` estimate.
pub const CHARS_PER_TOKEN: f64 = 3.5;

/// A `/dcp` invocation split into its subcommand and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcpCommand {
    pub command: String,
    pub args: Vec<String>,
}

/// Parse `/dcp <command> [args...]` (or `@dcp ...`). Returns `None` for any
/// other text. A bare `/dcp` means `help`.
pub fn parse_dcp_command(text: &str) -> Option<DcpCommand> {
    let mut words = text.split_whitespace();
    match words.next()? {
        "/dcp" | "@dcp" => {}
        _ => return None,
    }
    let command = words.next().map_or_else(|| "help".to_string(), str::to_lowercase);
    Some(DcpCommand {
        command,
        args: words.map(str::to_string).collect(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subcommand {
    Help,
    Stats,
    Context,
    /// `None` toggles.
    Manual(Option<bool>),
    /// `None` sweeps since the last user message.
    Sweep(Option<usize>),
    Prune,
    Distill,
    Compress,
}

impl Subcommand {
    /// Unknown commands fall back to `help`.
    pub fn from_command(cmd: &DcpCommand) -> Self {
        let first = cmd.args.first().map(|a| a.to_lowercase());
        match cmd.command.as_str() {
            "stats" => Subcommand::Stats,
            "context" => Subcommand::Context,
            "manual" => Subcommand::Manual(match first.as_deref() {
                Some("on") => Some(true),
                Some("off") => Some(false),
                _ => None,
            }),
            "sweep" => Subcommand::Sweep(first.and_then(|n| n.parse().ok())),
            "prune" => Subcommand::Prune,
            "distill" => Subcommand::Distill,
            "compress" => Subcommand::Compress,
            _ => Subcommand::Help,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    /// Shown to the user, not sent to the model.
    Message(String),
    /// Sent to the model in place of the command text.
    Prompt(String),
}

impl CommandOutput {
    pub fn text(&self) -> &str {
        match self {
            CommandOutput::Message(t) | CommandOutput::Prompt(t) => t,
        }
    }
}

pub fn help_text(manual_mode: bool) -> String {
    let mode = if manual_mode { "on" } else { "off" };
    [
        "Context pruning commands".to_string(),
        String::new(),
        format!("  Manual mode: {mode}"),
        String::new(),
        "  /dcp stats             Pruning statistics for this session".into(),
        "  /dcp context           Estimated token usage for this session".into(),
        "  /dcp sweep [n]         Prune tool outputs since the last user message, or the last n".into(),
        "  /dcp manual [on|off]   Toggle manual mode, or set it explicitly".into(),
        "  /dcp prune             Ask the model to prune now (manual mode)".into(),
        "  /dcp distill           Ask the model to distill now (manual mode)".into(),
        "  /dcp compress          Ask the model to compress now (manual mode)".into(),
    ]
    .join("\n")
}

/// Per-source counts and bytes of everything redacted in the session.
pub fn format_stats(state: &SessionState) -> String {
    let mut by_source: BTreeMap<&str, (usize, u64)> = BTreeMap::new();
    let mut untracked = (0usize, 0u64);
    for (id, weight) in &state.prune.tools {
        let slot = match state.prune.origins.get(id) {
            Some(origin) => by_source.entry(origin.source.as_str()).or_default(),
            None => &mut untracked,
        };
        slot.0 += 1;
        slot.1 += weight;
    }

    let mut lines = vec![format!("Pruning statistics for session {}", state.session_id)];
    lines.push(format!(
        "  Tool outputs removed: {} (~{} bytes)",
        state.prune.tools.len(),
        state.prune.tools.values().sum::<u64>()
    ));
    for source in PruneSource::ALL {
        if let Some((count, bytes)) = by_source.get(source.as_str()) {
            lines.push(format!("    {source}: {count} (~{bytes} bytes)"));
        }
    }
    if untracked.0 > 0 {
        lines.push(format!("    restored: {} (~{} bytes)", untracked.0, untracked.1));
    }
    lines.push(format!(
        "  Messages compressed: {} (~{} bytes)",
        state.prune.messages.len(),
        state.prune.messages.values().sum::<u64>()
    ));
    if !state.compress_summaries.is_empty() {
        let topics: Vec<&str> = state
            .compress_summaries
            .iter()
            .map(|s| s.topic.as_str())
            .collect();
        lines.push(format!("  Compressed topics: {}", topics.join(", ")));
    }
    lines.push(format!("  Total freed: ~{} bytes", state.prune.bytes_freed()));
    lines.join("\n")
}

fn estimate_tokens(chars: usize) -> u64 {
    (chars as f64 / CHARS_PER_TOKEN).ceil() as u64
}

/// Token usage estimate of the transcript as the model will see it.
pub fn format_context(state: &SessionState, messages: &[Message]) -> String {
    let mut text_chars = 0;
    let mut tool_chars = 0;
    for msg in messages {
        if state.prune.messages.contains_key(&msg.info.id) {
            continue;
        }
        for part in &msg.parts {
            match part {
                Part::Text { text, .. } => text_chars += text.chars().count(),
                Part::Tool(tool) if !state.prune.is_tool_pruned(&tool.call_id) => {
                    tool_chars += tool.state.input.to_string().chars().count();
                    tool_chars += tool
                        .state
                        .output
                        .as_deref()
                        .or(tool.state.error.as_deref())
                        .map_or(0, |o| o.chars().count());
                }
                _ => {}
            }
        }
    }

    let text_tokens = estimate_tokens(text_chars);
    let tool_tokens = estimate_tokens(tool_chars);
    let saved = estimate_tokens(state.prune.bytes_freed() as usize);
    let total = text_tokens + tool_tokens;

    let mut lines = vec![
        format!("Context estimate for session {}", state.session_id),
        format!("  Messages: {}", messages.len()),
        format!("  Text:         ~{text_tokens} tokens"),
        format!("  Tool calls:   ~{tool_tokens} tokens"),
        format!("  Total:        ~{total} tokens"),
        format!("  Saved so far: ~{saved} tokens"),
    ];
    if let Some(limit) = state.model_context_limit.filter(|l| *l > 0) {
        let pct = total as f64 / limit as f64 * 100.0;
        lines.push(format!("  Model limit:  {limit} tokens ({pct:.1}% used)"));
    }
    lines.join("\n")
}

fn manual_mode_message(on: bool) -> String {
    if on {
        "Manual mode is on. Prunable-tools context is no longer injected; use /dcp prune, /dcp distill or /dcp compress to trigger the tools.".into()
    } else {
        "Manual mode is off. Prunable-tools context is injected again.".into()
    }
}

fn trigger_prompt(tool: &str, listing: Option<&str>) -> String {
    let instructions: &[&str] = match tool {
        "prune" => &[
            "Call the prune tool once now.",
            "Pick the largest set of tool outputs that can be removed without losing anything still needed.",
            "Afterwards, briefly say what was pruned and why.",
        ],
        "distill" => &[
            "Call the distill tool now.",
            "Pick the most information-dense outputs and replace each with a complete technical distillation.",
            "Afterwards, briefly say what was distilled and why.",
        ],
        _ => &[
            "Call the compress tool now.",
            "Pick the largest finished part of the conversation and replace it with a precise technical summary.",
            "Afterwards, briefly say which range was compressed.",
        ],
    };
    let mut sections = vec![format!("<{tool} triggered manually>")];
    sections.extend(instructions.iter().map(|s| (*s).to_string()));
    if let Some(listing) = listing {
        sections.push(listing.to_string());
    }
    sections.join("\n\n")
}

fn permission_for(config: &PruneConfig, tool: &str) -> Permission {
    match tool {
        "prune" => config.tools.prune.permission,
        "distill" => config.tools.distill.permission,
        _ => config.tools.compress.permission,
    }
}

/// Execute a subcommand against a session.
pub fn execute(
    state: &mut SessionState,
    config: &PruneConfig,
    messages: &[Message],
    subcommand: Subcommand,
) -> CommandOutput {
    match subcommand {
        Subcommand::Help => CommandOutput::Message(help_text(state.manual_mode)),
        Subcommand::Stats => CommandOutput::Message(format_stats(state)),
        Subcommand::Context => CommandOutput::Message(format_context(state, messages)),
        Subcommand::Manual(setting) => {
            state.manual_mode = setting.unwrap_or(!state.manual_mode);
            CommandOutput::Message(manual_mode_message(state.manual_mode))
        }
        Subcommand::Sweep(count) => {
            let report = sweep(state, config, messages, count);
            if report.pruned.is_empty() {
                CommandOutput::Message("Nothing to sweep.".into())
            } else {
                let tools: Vec<&str> = report.pruned.iter().map(|(_, t)| t.as_str()).collect();
                CommandOutput::Message(format!(
                    "Swept {} tool output(s), ~{} bytes freed: {}",
                    report.pruned.len(),
                    report.bytes_freed,
                    tools.join(", ")
                ))
            }
        }
        Subcommand::Prune | Subcommand::Distill | Subcommand::Compress => {
            let tool = match subcommand {
                Subcommand::Prune => "prune",
                Subcommand::Distill => "distill",
                _ => "compress",
            };
            if !state.manual_mode {
                return CommandOutput::Message(
                    "Manual mode is off. Run /dcp manual on to use manual triggers.".into(),
                );
            }
            if permission_for(config, tool) == Permission::Deny {
                return CommandOutput::Message(format!(
                    "The {tool} tool is disabled by config (permission=deny)."
                ));
            }
            if tool == "compress" {
                return CommandOutput::Prompt(trigger_prompt(tool, None));
            }
            match build_prunable_tools_list(state, config, messages) {
                Some(listing) => CommandOutput::Prompt(trigger_prompt(tool, Some(&listing))),
                None => CommandOutput::Message(
                    "No prunable tool outputs are available right now.".into(),
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PruneOrigin;
    use serde_json::json;

    fn transcript() -> Vec<Message> {
        vec![
            Message::user("u1", 1, "hello"),
            Message::assistant(
                "a1",
                2,
                vec![Part::tool("c1", "read", json!({"filePath": "a"}), "x".repeat(70))],
            ),
        ]
    }

    #[test]
    fn parses_command_text() {
        assert_eq!(
            parse_dcp_command("/dcp sweep 3"),
            Some(DcpCommand {
                command: "sweep".into(),
                args: vec!["3".into()]
            })
        );
        assert_eq!(parse_dcp_command("  @dcp ").unwrap().command, "help");
        assert_eq!(parse_dcp_command("/dcp STATS").unwrap().command, "stats");
        assert!(parse_dcp_command("/dcpx").is_none());
        assert!(parse_dcp_command("please /dcp stats").is_none());
    }

    #[test]
    fn subcommand_arguments() {
        let sub = |t: &str| Subcommand::from_command(&parse_dcp_command(t).unwrap());
        assert_eq!(sub("/dcp manual on"), Subcommand::Manual(Some(true)));
        assert_eq!(sub("/dcp manual"), Subcommand::Manual(None));
        assert_eq!(sub("/dcp sweep 5"), Subcommand::Sweep(Some(5)));
        assert_eq!(sub("/dcp sweep x"), Subcommand::Sweep(None));
        assert_eq!(sub("/dcp bogus"), Subcommand::Help);
    }

    #[test]
    fn stats_group_by_source() {
        let mut state = SessionState::new("ses_1");
        for (id, weight, source) in [
            ("a", 100, PruneSource::Deduplication),
            ("b", 50, PruneSource::Deduplication),
            ("c", 7, PruneSource::Semantic),
        ] {
            state.prune.mark_tool(
                id,
                weight,
                PruneOrigin {
                    source,
                    origin_message_id: "m".into(),
                },
            );
        }
        state.prune.tools.insert("legacy".into(), 0);
        let text = format_stats(&state);
        assert!(text.contains("Tool outputs removed: 4 (~157 bytes)"));
        assert!(text.contains("deduplication: 2 (~150 bytes)"));
        assert!(text.contains("semantic: 1 (~7 bytes)"));
        assert!(text.contains("restored: 1"));
    }

    #[test]
    fn context_estimate_uses_limit() {
        let mut state = SessionState::new("s");
        state.model_context_limit = Some(1000);
        let text = format_context(&state, &transcript());
        assert!(text.contains("Text:         ~2 tokens"), "{text}");
        assert!(text.contains("% used"));
    }

    #[test]
    fn manual_toggle_and_triggers() {
        let config = PruneConfig::default();
        let mut state = SessionState::new("s");
        let msgs = transcript();

        let out = execute(&mut state, &config, &msgs, Subcommand::Prune);
        assert!(matches!(out, CommandOutput::Message(ref t) if t.starts_with("Manual mode is off")));

        execute(&mut state, &config, &msgs, Subcommand::Manual(None));
        assert!(state.manual_mode);

        let out = execute(&mut state, &config, &msgs, Subcommand::Prune);
        let CommandOutput::Prompt(prompt) = out else {
            panic!("expected a prompt");
        };
        assert!(prompt.starts_with("<prune triggered manually>"));
        assert!(prompt.contains("0: read, a"));

        let mut denied = config.clone();
        denied.tools.compress.permission = Permission::Deny;
        let out = execute(&mut state, &denied, &msgs, Subcommand::Compress);
        assert!(out.text().contains("permission=deny"));
    }

    #[test]
    fn sweep_reports_pruned_tools() {
        let mut state = SessionState::new("s");
        let out = execute(&mut state, &PruneConfig::default(), &transcript(), Subcommand::Sweep(None));
        assert!(out.text().starts_with("Swept 1 tool output(s), ~70 bytes freed: read"));
        assert!(state.prune.is_tool_pruned("c1"));
    }
}
