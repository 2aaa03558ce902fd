//! Deterministic redaction heuristics.
//!
//! Every strategy is a plain function over `(state, config, transcript)` that
//! only adds entries to [`PruneState`](crate::state::PruneState). Running the
//! pipeline twice on the same transcript changes nothing the second time.
//!
//! The pipeline order is fixed: deduplication, supersede-writes, purge-errors.

pub mod deduplication;
pub mod names;
pub mod purge_errors;
pub mod supersede_writes;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::PruneConfig;
use crate::state::reconcile::is_message_compacted;
use crate::state::{PruneOrigin, PruneSource, SessionState};
use crate::{Message, Part, ToolStatus, short_id};

/// A tool call reconstructed from the transcript. Never cached across passes.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool: String,
    /// Number of turns started before this call.
    pub turn: u32,
    pub output: String,
    pub is_error: bool,
    pub input: Value,
    pub message_id: String,
    /// Output size in bytes; the weight recorded when the call is redacted.
    pub size: u64,
}

/// Collect every finished tool call in transcript order, skipping messages
/// hidden by the last compaction.
pub fn collect_tool_calls(state: &SessionState, messages: &[Message]) -> Vec<ToolCallRecord> {
    let mut records = Vec::new();
    let mut turn = 0u32;
    for msg in messages.iter().filter(|m| !is_message_compacted(state, m)) {
        for part in &msg.parts {
            match part {
                Part::StepStart => turn += 1,
                Part::Tool(tool) => {
                    let (output, is_error) = match tool.state.status {
                        ToolStatus::Completed => (tool.state.output.clone().unwrap_or_default(), false),
                        ToolStatus::Error => (tool.state.error.clone().unwrap_or_default(), true),
                        ToolStatus::Pending | ToolStatus::Running => continue,
                    };
                    records.push(ToolCallRecord {
                        call_id: tool.call_id.clone(),
                        tool: tool.tool.clone(),
                        turn: turn.saturating_sub(1),
                        size: output.len() as u64,
                        output,
                        is_error,
                        input: tool.state.input.clone(),
                        message_id: msg.info.id.clone(),
                    });
                }
                _ => {}
            }
        }
    }
    records
}

/// File path argument of a call, if it has one.
pub fn resource_path(input: &Value) -> Option<&str> {
    ["filePath", "file_path", "path", "file"]
        .iter()
        .find_map(|k| input.get(*k).and_then(Value::as_str))
}

/// Key identifying what a call reads: tool name plus file path, or the
/// canonical arguments when there is no path.
pub fn resource_key(tool: &str, input: &Value) -> String {
    let target = match resource_path(input) {
        Some(path) => path.to_string(),
        None => canonical_args(input),
    };
    format!("{}:{}", tool.to_lowercase(), target)
}

/// Serialize arguments with object keys sorted at every level.
pub fn canonical_args(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for k in keys {
                    out.insert(k.clone(), sorted(&map[k]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// One-line summary of call arguments for prompts and listings.
pub fn summarize_args(input: &Value, max_len: usize) -> String {
    fn clip(s: &str, n: usize) -> String {
        if s.chars().count() > n {
            let head: String = s.chars().take(n.saturating_sub(3)).collect();
            format!("{head}...")
        } else {
            s.to_string()
        }
    }

    let summary = match input.as_object() {
        Some(obj) => obj
            .iter()
            .take(3)
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}=\"{}\"", clip(s, 40)),
                other => format!("{k}={}", clip(&other.to_string(), 40)),
            })
            .collect::<Vec<_>>()
            .join(", "),
        None if input.is_null() => String::new(),
        None => input.to_string(),
    };
    clip(&summary, max_len)
}

/// Mark a record as redacted with the given source. Returns whether it was new.
pub(crate) fn mark_record(
    state: &mut SessionState,
    record: &ToolCallRecord,
    source: PruneSource,
) -> bool {
    state.prune.mark_tool(
        &record.call_id,
        record.size,
        PruneOrigin {
            source,
            origin_message_id: record.message_id.clone(),
        },
    )
}

/// Signature shared by every heuristic. Returns the number of newly marked calls.
pub type StrategyFn = fn(&mut SessionState, &PruneConfig, &[Message]) -> usize;

/// Counts of calls newly marked by each strategy in one pipeline run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StrategyReport {
    pub marked: Vec<(PruneSource, usize)>,
}

impl StrategyReport {
    pub fn total(&self) -> usize {
        self.marked.iter().map(|(_, n)| n).sum()
    }
}

/// Runs the heuristics in their fixed order.
pub struct StrategyRunner {
    strategies: Vec<(PruneSource, StrategyFn)>,
}

impl Default for StrategyRunner {
    fn default() -> Self {
        Self {
            strategies: vec![
                (PruneSource::Deduplication, deduplication::deduplicate),
                (PruneSource::SupersedeWrites, supersede_writes::supersede_writes),
                (PruneSource::PurgeErrors, purge_errors::purge_errors),
            ],
        }
    }
}

impl StrategyRunner {
    pub fn run(
        &self,
        state: &mut SessionState,
        config: &PruneConfig,
        messages: &[Message],
    ) -> StrategyReport {
        let mut report = StrategyReport::default();
        for (source, strategy) in &self.strategies {
            let n = strategy(state, config, messages);
            debug!("Strategy {source} marked {n} call(s)");
            report.marked.push((*source, n));
        }
        if report.total() > 0 {
            info!(
                "Heuristics marked {} tool output(s) for session {}",
                report.total(),
                short_id(&state.session_id)
            );
        }
        report
    }
}
