//! Redaction requested by reference: the `prune`, `distill` and `compress`
//! tools and the `/dcp sweep` command.
//!
//! References are the short numbers shown in the `<prunable-tools>` listing
//! (see [`crate::transform`]); raw ids are accepted too.

use std::collections::HashMap;
use tracing::info;

use crate::config::PruneConfig;
use crate::error::{PruneError, Result};
use crate::state::{CompressSummary, PruneSource, SessionState};
use crate::strategies::{ToolCallRecord, collect_tool_calls, mark_record};
use crate::{Message, MessageRole, Part, short_id};

/// Result of a reference-based prune or distill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManualReport {
    /// `(raw id, tool)` of every newly redacted call.
    pub pruned: Vec<(String, String)>,
    /// References that did not resolve to a prunable call.
    pub skipped: Vec<String>,
    pub bytes_freed: u64,
}

/// Resolve a reference (`"3"`, `"#3"`) or raw id to a raw id.
fn resolve<'a>(state: &'a SessionState, reference: &'a str) -> &'a str {
    state
        .message_ids
        .resolve_str(reference)
        .unwrap_or_else(|| reference.trim())
}

fn prune_records(
    state: &mut SessionState,
    config: &PruneConfig,
    records: &HashMap<String, ToolCallRecord>,
    references: &[String],
    source: PruneSource,
) -> ManualReport {
    let mut report = ManualReport::default();
    for reference in references {
        let raw = resolve(state, reference).to_string();
        let Some(record) = records.get(&raw) else {
            report.skipped.push(reference.clone());
            continue;
        };
        if config.is_protected(&record.tool, &[]) {
            report.skipped.push(reference.clone());
            continue;
        }
        if mark_record(state, record, source) {
            report.bytes_freed += record.size;
            report.pruned.push((raw, record.tool.clone()));
        }
    }
    report
}

fn records_by_id(state: &SessionState, messages: &[Message]) -> HashMap<String, ToolCallRecord> {
    collect_tool_calls(state, messages)
        .into_iter()
        .map(|r| (r.call_id.clone(), r))
        .collect()
}

/// Redact tool calls by reference.
pub fn prune_refs(
    state: &mut SessionState,
    config: &PruneConfig,
    messages: &[Message],
    references: &[String],
) -> Result<ManualReport> {
    if references.is_empty() {
        return Err(PruneError::InvalidToolArgs(
            "Missing ids. You must provide at least one ID to prune.".into(),
        ));
    }
    let records = records_by_id(state, messages);
    let report = prune_records(state, config, &records, references, PruneSource::Manual);
    state.last_tool_prune = true;
    info!(
        "Manual prune of {} call(s) for {}",
        report.pruned.len(),
        short_id(&state.session_id)
    );
    Ok(report)
}

/// A call to redact together with the text that stands in for its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistillTarget {
    pub id: String,
    pub distillation: String,
}

/// Redact tool calls, keeping a distilled version of each output.
pub fn distill_targets(
    state: &mut SessionState,
    config: &PruneConfig,
    messages: &[Message],
    targets: &[DistillTarget],
) -> Result<ManualReport> {
    if targets.is_empty() {
        return Err(PruneError::InvalidToolArgs(
            "Missing targets. You must provide at least one target to distill.".into(),
        ));
    }
    if let Some(t) = targets.iter().find(|t| t.distillation.trim().is_empty()) {
        return Err(PruneError::InvalidToolArgs(format!(
            "Missing distillation for target {}.",
            t.id
        )));
    }

    let records = records_by_id(state, messages);
    let references: Vec<String> = targets.iter().map(|t| t.id.clone()).collect();
    let report = prune_records(state, config, &records, &references, PruneSource::Manual);
    for target in targets {
        let raw = resolve(state, &target.id).to_string();
        if report.pruned.iter().any(|(id, _)| *id == raw) {
            state.distillations.insert(raw, target.distillation.clone());
        }
    }
    state.last_tool_prune = true;
    Ok(report)
}

/// Arguments of a `compress` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressRequest {
    pub topic: Option<String>,
    pub start_id: Option<String>,
    pub end_id: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressReport {
    pub topic: String,
    pub messages: usize,
    pub tools: usize,
    pub bytes_freed: u64,
}

/// Index of the message a reference points at: either the message itself or
/// the message holding the referenced tool call.
fn message_index(state: &SessionState, messages: &[Message], reference: &str) -> Option<usize> {
    let raw = resolve(state, reference);
    messages.iter().position(|m| m.info.id == raw).or_else(|| {
        messages
            .iter()
            .position(|m| m.tool_parts().any(|t| t.call_id == raw))
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Replace a range of messages with a summary.
pub fn compress_range(
    state: &mut SessionState,
    config: &PruneConfig,
    messages: &[Message],
    request: &CompressRequest,
) -> Result<CompressReport> {
    let topic = non_empty(&request.topic).ok_or_else(|| {
        PruneError::InvalidToolArgs("Missing topic. Provide a short label for the compressed range.".into())
    })?;
    let (Some(start), Some(end), Some(summary)) = (
        non_empty(&request.start_id),
        non_empty(&request.end_id),
        non_empty(&request.summary),
    ) else {
        return Err(PruneError::InvalidToolArgs(
            "Missing content. Provide content.startId, content.endId and content.summary.".into(),
        ));
    };

    let start_idx = message_index(state, messages, start)
        .ok_or_else(|| PruneError::InvalidToolArgs(format!("Unknown startId: {start}")))?;
    let end_idx = message_index(state, messages, end)
        .ok_or_else(|| PruneError::InvalidToolArgs(format!("Unknown endId: {end}")))?;
    if start_idx > end_idx {
        return Err(PruneError::InvalidToolArgs(
            "startId must not come after endId.".into(),
        ));
    }

    let range = &messages[start_idx..=end_idx];
    let mut report = CompressReport {
        topic: topic.to_string(),
        messages: 0,
        tools: 0,
        bytes_freed: 0,
    };
    let records = records_by_id(state, range);
    for msg in range {
        // Outputs redacted as tool calls carry their own weight; the message
        // weight covers its text and any output not tracked that way.
        let mut weight: u64 = msg
            .parts
            .iter()
            .map(|p| match p {
                Part::Text { text, .. } => text.len() as u64,
                _ => 0,
            })
            .sum();
        for tool in msg.tool_parts() {
            if let Some(record) = records.get(&tool.call_id)
                && !config.is_protected(&record.tool, &[])
                && mark_record(state, record, PruneSource::Manual)
            {
                report.tools += 1;
                report.bytes_freed += record.size;
            } else if !state.prune.is_tool_pruned(&tool.call_id) {
                weight += tool.state.output.as_ref().map_or(0, |o| o.len() as u64);
            }
        }
        if state.prune.mark_message(&msg.info.id, weight) {
            report.messages += 1;
            report.bytes_freed += weight;
        }
    }

    state.compress_summaries.push(CompressSummary {
        topic: topic.to_string(),
        start_message_id: range[0].info.id.clone(),
        end_message_id: range[range.len() - 1].info.id.clone(),
        summary: summary.to_string(),
    });
    state.last_tool_prune = true;
    info!(
        "Compressed {} message(s) as {:?} for {}",
        report.messages,
        topic,
        short_id(&state.session_id)
    );
    Ok(report)
}

/// Redact every prunable call since the last user message, or the last
/// `count` prunable calls when given.
pub fn sweep(
    state: &mut SessionState,
    config: &PruneConfig,
    messages: &[Message],
    count: Option<usize>,
) -> ManualReport {
    let records = collect_tool_calls(state, messages);
    let candidates: Vec<&ToolCallRecord> = match count {
        Some(n) => {
            let prunable: Vec<&ToolCallRecord> = records
                .iter()
                .filter(|r| !state.prune.is_tool_pruned(&r.call_id))
                .collect();
            let skip = prunable.len().saturating_sub(n);
            prunable.into_iter().skip(skip).collect()
        }
        None => {
            let last_user = messages
                .iter()
                .rposition(|m| m.info.role == MessageRole::User)
                .map_or(0, |i| i + 1);
            let recent: std::collections::HashSet<&str> = messages[last_user..]
                .iter()
                .map(|m| m.info.id.as_str())
                .collect();
            records
                .iter()
                .filter(|r| recent.contains(r.message_id.as_str()))
                .collect()
        }
    };

    let mut report = ManualReport::default();
    for record in candidates {
        if config.is_protected(&record.tool, &[]) {
            continue;
        }
        if mark_record(state, record, PruneSource::Manual) {
            report.bytes_freed += record.size;
            report.pruned.push((record.call_id.clone(), record.tool.clone()));
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transcript() -> Vec<Message> {
        vec![
            Message::user("u1", 1, "start"),
            Message::assistant(
                "a1",
                2,
                vec![
                    Part::tool("c1", "read", json!({"filePath": "a"}), "aaaa"),
                    Part::tool("c2", "task", json!({}), "sub"),
                ],
            ),
            Message::user("u2", 3, "more"),
            Message::assistant(
                "a2",
                4,
                vec![
                    Part::text("checking"),
                    Part::tool("c3", "grep", json!({"pattern": "x"}), "hits"),
                    Part::tool("c4", "bash", json!({"command": "ls"}), "files"),
                ],
            ),
        ]
    }

    fn state_with_refs() -> SessionState {
        let mut state = SessionState::new("s");
        for id in ["c1", "c2", "c3", "c4"] {
            state.message_ids.assign(id);
        }
        state
    }

    #[test]
    fn prune_by_reference() {
        let mut state = state_with_refs();
        let report = prune_refs(
            &mut state,
            &PruneConfig::default(),
            &transcript(),
            &["0".into(), "#1".into(), "99".into(), "c4".into()],
        )
        .unwrap();
        let ids: Vec<_> = report.pruned.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c4"]);
        assert_eq!(report.skipped, vec!["#1", "99"]);
        assert_eq!(state.prune.origins["c1"].source, PruneSource::Manual);
        assert!(state.last_tool_prune);
    }

    #[test]
    fn prune_requires_ids() {
        let mut state = state_with_refs();
        let err = prune_refs(&mut state, &PruneConfig::default(), &transcript(), &[]).unwrap_err();
        assert!(err.to_string().starts_with("Missing ids"));
    }

    #[test]
    fn distill_stores_replacement_text() {
        let mut state = state_with_refs();
        let targets = vec![DistillTarget {
            id: "2".into(),
            distillation: "grep found x in 3 files".into(),
        }];
        let report =
            distill_targets(&mut state, &PruneConfig::default(), &transcript(), &targets).unwrap();
        assert_eq!(report.pruned.len(), 1);
        assert_eq!(state.distillations["c3"], "grep found x in 3 files");

        let err = distill_targets(&mut state, &PruneConfig::default(), &transcript(), &[])
            .unwrap_err();
        assert!(err.to_string().starts_with("Missing targets"));
        let blank = vec![DistillTarget {
            id: "0".into(),
            distillation: " ".into(),
        }];
        assert!(distill_targets(&mut state, &PruneConfig::default(), &transcript(), &blank).is_err());
    }

    #[test]
    fn compress_marks_range_and_records_summary() {
        let mut state = state_with_refs();
        let request = CompressRequest {
            topic: Some("setup".into()),
            start_id: Some("u1".into()),
            end_id: Some("0".into()),
            summary: Some("Read file a.".into()),
        };
        let report =
            compress_range(&mut state, &PruneConfig::default(), &transcript(), &request).unwrap();
        assert_eq!(report.messages, 2);
        assert_eq!(report.tools, 1);
        assert!(state.prune.messages.contains_key("u1"));
        assert!(state.prune.messages.contains_key("a1"));
        assert!(state.prune.is_tool_pruned("c1"));
        assert!(!state.prune.is_tool_pruned("c2"));
        assert_eq!(state.compress_summaries[0].start_message_id, "u1");
        assert_eq!(state.compress_summaries[0].end_message_id, "a1");
    }

    #[test]
    fn compress_counts_each_output_once() {
        let mut state = state_with_refs();
        let request = CompressRequest {
            topic: Some("setup".into()),
            start_id: Some("u1".into()),
            end_id: Some("a1".into()),
            summary: Some("Read file a.".into()),
        };
        let report =
            compress_range(&mut state, &PruneConfig::default(), &transcript(), &request).unwrap();
        // "start" (5) + c1 output (4) + protected task output (3).
        assert_eq!(report.bytes_freed, 12);
        assert_eq!(state.prune.bytes_freed(), 12);
        assert_eq!(state.prune.tools["c1"], 4);
        assert_eq!(state.prune.messages["a1"], 3);
    }

    #[test]
    fn compress_validates_arguments() {
        let mut state = state_with_refs();
        let config = PruneConfig::default();
        let msgs = transcript();

        let no_topic = CompressRequest::default();
        let err = compress_range(&mut state, &config, &msgs, &no_topic).unwrap_err();
        assert!(err.to_string().starts_with("Missing topic"));

        let no_content = CompressRequest {
            topic: Some("t".into()),
            ..Default::default()
        };
        let err = compress_range(&mut state, &config, &msgs, &no_content).unwrap_err();
        assert!(err.to_string().starts_with("Missing content"));

        let backwards = CompressRequest {
            topic: Some("t".into()),
            start_id: Some("a2".into()),
            end_id: Some("u1".into()),
            summary: Some("s".into()),
        };
        assert!(compress_range(&mut state, &config, &msgs, &backwards).is_err());
        assert!(state.compress_summaries.is_empty());
    }

    #[test]
    fn sweep_since_last_user_message() {
        let mut state = SessionState::new("s");
        let report = sweep(&mut state, &PruneConfig::default(), &transcript(), None);
        let ids: Vec<_> = report.pruned.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c3", "c4"]);
    }

    #[test]
    fn sweep_last_n_skips_protected() {
        let mut state = SessionState::new("s");
        let report = sweep(&mut state, &PruneConfig::default(), &transcript(), Some(3));
        let ids: Vec<_> = report.pruned.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c3", "c4"]);
    }
}
