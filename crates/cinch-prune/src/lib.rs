//! Context pruning engine for long-running LLM agent conversations.
//!
//! `cinch-prune` decides which previously emitted tool-call outputs are safe to
//! redact and rewrites outbound provider requests so the redaction actually
//! reaches the model. All decisions live in a single
//! [`SessionStore`](state::store::SessionStore); the components that make
//! decisions and the component that applies them never call each other
//! directly.
//!
//! # Where to find things
//!
//! - **Session bookkeeping:** [`state::SessionState`] holds the prune maps,
//!   provenance, the compact-reference table and auxiliary scalars.
//!   [`state::store::SessionStore`] owns every session's state and computes the
//!   cross-session union used on the wire. [`state::persist`] stores state on
//!   disk.
//!
//! - **Deterministic heuristics:** [`strategies`] contains deduplication,
//!   supersede-writes and purge-errors, run in that order by
//!   [`StrategyRunner`](strategies::StrategyRunner).
//!
//! - **Model-in-the-loop pruning:** [`semantic`] builds the minimized
//!   transcript, calls a [`Judge`](semantic::judge::Judge), validates the
//!   verdict against a JSON schema and filters it against the eligible ids.
//!
//! - **Wire redaction:** [`redact`] finds every tool-carrying array in a
//!   request body and rewrites tool outputs in place.
//!   [`correlator`] supplies the position map needed for the format that
//!   carries no call identifiers.
//!
//! - **Transcript rewriting:** [`transform`] applies decisions to the host's
//!   message list and injects the `<prunable-tools>` listing that gives the
//!   model compact references. [`manual`] holds the operations behind the
//!   `prune`, `distill` and `compress` tools and `/dcp sweep`.
//!
//! - **Model-facing surfaces:** [`tools`] exposes the pruning tools to the
//!   model; [`commands`] parses and runs `/dcp` commands.
//!
//! - **Host integration:** [`hooks::PruningEngine`] wires every hook
//!   (idle, pre-request parameters, message transform, tool invocation,
//!   `/dcp` commands) to the components above. Deferred idle work runs on
//!   the [`scheduler`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cinch_prune::prelude::*;
//!
//! let host = Arc::new(InMemoryHost::new());
//! let judge = Arc::new(OpenRouterJudge::new(std::env::var("OPENROUTER_KEY")?)?);
//! let engine = Arc::new(PruningEngine::new(PruneConfig::default(), host, judge));
//!
//! // Before every provider call:
//! let body = engine.redactor().redact_body(Some("ses_1"), &raw_body).await.into_body();
//! ```

pub mod commands;
pub mod config;
pub mod correlator;
pub mod error;
pub mod hooks;
pub mod host;
pub mod manual;
pub mod prelude;
pub mod redact;
pub mod scheduler;
pub mod semantic;
pub mod state;
pub mod strategies;
pub mod tools;
pub mod transform;

pub use error::{PruneError, Result};

// Re-export so callers deriving verdict-like types do not need a direct dep.
pub use schemars;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Text that replaces every redacted tool output, on the wire and in the transcript.
pub const PLACEHOLDER: &str =
    "[Output removed to save context - information superseded or no longer needed]";

/// Judge model used when neither the config nor the session names one.
pub const DEFAULT_MODEL: &str = "z-ai/glm-5";

/// Generate a JSON Schema `Value` from a type that derives `JsonSchema`.
///
/// Used for tool parameter schemas and for validating judge verdicts.
pub fn json_schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema).unwrap_or_default()
}

/// Truncate a session id for log lines.
pub(crate) fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

// ── Transcript model ───────────────────────────────────────────────

/// Role of a transcript message.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Creation time of a message, in milliseconds since the epoch.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageTime {
    pub created: i64,
}

/// Metadata attached to every transcript message.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MessageInfo {
    pub id: String,
    pub role: MessageRole,
    /// Set on the assistant message that a compaction produced.
    #[serde(default)]
    pub summary: bool,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A message in the host's transcript: metadata plus ordered parts.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// One part of a transcript message.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        synthetic: bool,
    },
    Tool(ToolPart),
    StepStart,
    StepFinish,
    #[serde(other)]
    Other,
}

/// A tool invocation and its result.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolPart {
    #[serde(rename = "callID")]
    pub call_id: String,
    pub tool: String,
    #[serde(default)]
    pub state: ToolState,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ToolState {
    #[serde(default)]
    pub status: ToolStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: MessageRole, created: i64, parts: Vec<Part>) -> Self {
        Self {
            info: MessageInfo {
                id: id.into(),
                role,
                summary: false,
                time: MessageTime { created },
                session_id: None,
            },
            parts,
        }
    }

    pub fn user(id: impl Into<String>, created: i64, text: impl Into<String>) -> Self {
        Self::new(id, MessageRole::User, created, vec![Part::text(text)])
    }

    pub fn assistant(id: impl Into<String>, created: i64, parts: Vec<Part>) -> Self {
        Self::new(id, MessageRole::Assistant, created, parts)
    }

    /// Mark this message as a compaction summary (builder pattern).
    pub fn as_summary(mut self) -> Self {
        self.info.summary = true;
        self
    }

    pub fn tool_parts(&self) -> impl Iterator<Item = &ToolPart> {
        self.parts.iter().filter_map(|p| match p {
            Part::Tool(t) => Some(t),
            _ => None,
        })
    }

    /// Concatenated visible text of the message.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            synthetic: false,
        }
    }

    pub fn synthetic(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            synthetic: true,
        }
    }

    /// A completed tool call with the given input and output.
    pub fn tool(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        input: Value,
        output: impl Into<String>,
    ) -> Self {
        Part::Tool(ToolPart {
            call_id: call_id.into(),
            tool: tool.into(),
            state: ToolState {
                status: ToolStatus::Completed,
                input,
                output: Some(output.into()),
                error: None,
            },
        })
    }

    /// A tool call that failed with `error`.
    pub fn tool_error(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        input: Value,
        error: impl Into<String>,
    ) -> Self {
        Part::Tool(ToolPart {
            call_id: call_id.into(),
            tool: tool.into(),
            state: ToolState {
                status: ToolStatus::Error,
                input,
                output: None,
                error: Some(error.into()),
            },
        })
    }
}
