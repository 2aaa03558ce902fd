//! Per-session redaction bookkeeping.
//!
//! [`SessionState`] is the single source of truth for what gets redacted.
//! Membership in [`PruneState::tools`] (or [`PruneState::messages`]) is the
//! only gate; [`PruneOrigin`] records provenance for stats and diagnostics.

pub mod persist;
pub mod reconcile;
pub mod store;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Which component decided to redact a tool call.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PruneSource {
    Deduplication,
    SupersedeWrites,
    PurgeErrors,
    Semantic,
    Manual,
}

impl PruneSource {
    pub const ALL: [PruneSource; 5] = [
        PruneSource::Deduplication,
        PruneSource::SupersedeWrites,
        PruneSource::PurgeErrors,
        PruneSource::Semantic,
        PruneSource::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PruneSource::Deduplication => "deduplication",
            PruneSource::SupersedeWrites => "supersede-writes",
            PruneSource::PurgeErrors => "purge-errors",
            PruneSource::Semantic => "semantic",
            PruneSource::Manual => "manual",
        }
    }
}

impl std::fmt::Display for PruneSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a redacted tool call. Advisory only.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PruneOrigin {
    pub source: PruneSource,
    pub origin_message_id: String,
}

/// Redaction decisions for one session. Only ever grows until a reset.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PruneState {
    /// Tool-call id to bytes freed.
    pub tools: HashMap<String, u64>,
    /// Message id to bytes freed.
    pub messages: HashMap<String, u64>,
    pub origins: HashMap<String, PruneOrigin>,
}

impl PruneState {
    /// Record a redacted tool call. Returns `false` and changes nothing if the
    /// id is already present.
    pub fn mark_tool(&mut self, call_id: &str, weight: u64, origin: PruneOrigin) -> bool {
        if self.tools.contains_key(call_id) {
            return false;
        }
        self.tools.insert(call_id.to_string(), weight);
        self.origins.insert(call_id.to_string(), origin);
        true
    }

    pub fn mark_message(&mut self, message_id: &str, weight: u64) -> bool {
        if self.messages.contains_key(message_id) {
            return false;
        }
        self.messages.insert(message_id.to_string(), weight);
        true
    }

    pub fn is_tool_pruned(&self, call_id: &str) -> bool {
        self.tools.contains_key(call_id)
    }

    /// Total bytes freed by tool and message redactions.
    pub fn bytes_freed(&self) -> u64 {
        self.tools.values().sum::<u64>() + self.messages.values().sum::<u64>()
    }

    pub fn clear(&mut self) {
        self.tools.clear();
        self.messages.clear();
        self.origins.clear();
    }
}

/// Cached tool name and arguments for a call id, seen on an outbound request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolParameters {
    pub tool: String,
    pub parameters: Value,
}

/// Short numeric aliases for raw transcript identifiers.
///
/// Aliases are assigned in order of first sight and never reassigned.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessageIdTable {
    by_raw_id: HashMap<String, u32>,
    by_ref: HashMap<u32, String>,
    next_ref: u32,
}

impl MessageIdTable {
    /// Alias for `raw_id`, assigning the next one if it is new.
    pub fn assign(&mut self, raw_id: &str) -> u32 {
        if let Some(r) = self.by_raw_id.get(raw_id) {
            return *r;
        }
        let r = self.next_ref;
        self.next_ref += 1;
        self.by_raw_id.insert(raw_id.to_string(), r);
        self.by_ref.insert(r, raw_id.to_string());
        r
    }

    pub fn get_ref(&self, raw_id: &str) -> Option<u32> {
        self.by_raw_id.get(raw_id).copied()
    }

    pub fn resolve(&self, r: u32) -> Option<&str> {
        self.by_ref.get(&r).map(String::as_str)
    }

    /// Resolve a user- or model-supplied reference such as `"3"` or `"#3"`.
    pub fn resolve_str(&self, r: &str) -> Option<&str> {
        let trimmed = r.trim().trim_start_matches('#');
        trimmed.parse::<u32>().ok().and_then(|n| self.resolve(n))
    }

    pub fn len(&self) -> usize {
        self.by_ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ref.is_empty()
    }

    pub fn reset(&mut self) {
        self.by_raw_id.clear();
        self.by_ref.clear();
        self.next_ref = 0;
    }
}

/// A message range replaced by a summary through the `compress` tool.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompressSummary {
    pub topic: String,
    pub start_message_id: String,
    pub end_message_id: String,
    pub summary: String,
}

/// Provider and model most recently used by a session.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelInfo {
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
}

/// Everything the engine tracks for one top-level session.
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    pub session_id: String,
    pub is_sub_agent: bool,
    pub prune: PruneState,
    pub tool_parameters: HashMap<String, ToolParameters>,
    pub message_ids: MessageIdTable,
    pub manual_mode: bool,
    pub model_context_limit: Option<u64>,
    pub compress_summaries: Vec<CompressSummary>,
    /// Replacement text for tool calls redacted through `distill`.
    pub distillations: HashMap<String, String>,
    pub nudge_counter: u32,
    /// Set after a pruning tool call; suppresses the next context injection.
    pub last_tool_prune: bool,
    /// Tool calls seen at the previous transform, used to detect new activity.
    pub last_tool_count: usize,
    /// Creation time of the most recent compaction summary seen.
    pub last_compaction: i64,
    pub model: ModelInfo,
    /// `"<tool>:<index>"` to call id, for providers without call ids.
    pub position_map: HashMap<String, String>,
    /// Monotonic activity stamp assigned by the store.
    pub last_active: u64,
    /// Persisted state has not been loaded into this session yet.
    pub restore_pending: bool,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// Clear everything invalidated by a compaction.
    ///
    /// Session identity, manual mode and model info survive.
    pub fn reset_on_compaction(&mut self, compaction_time: i64) {
        self.prune.clear();
        self.tool_parameters.clear();
        self.message_ids.reset();
        self.compress_summaries.clear();
        self.distillations.clear();
        self.position_map.clear();
        self.nudge_counter = 0;
        self.last_tool_prune = false;
        self.last_tool_count = 0;
        self.last_compaction = compaction_time;
    }
}
