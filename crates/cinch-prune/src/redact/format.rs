//! Wire format detection and per-format dispatch.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::{anthropic, chat, gemini, responses};
use crate::state::ToolParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WireFormat {
    /// `messages`: OpenAI-style `role: "tool"` results and Anthropic
    /// `tool_use` / `tool_result` blocks, in any mix.
    Messages,
    /// Gemini `contents` with `functionResponse` parts.
    Gemini,
    /// OpenAI Responses API `input` items.
    Responses,
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WireFormat::Messages => "messages",
            WireFormat::Gemini => "gemini",
            WireFormat::Responses => "responses",
        };
        f.write_str(name)
    }
}

/// What a redaction pass matches against.
pub struct RedactionContext<'a> {
    /// Lower-cased ids to redact.
    pub pruned: &'a HashSet<String>,
    /// Position map for [`WireFormat::Gemini`]; ignored by the other formats.
    pub position_map: &'a HashMap<String, String>,
}

/// One array of a request body that carries tool traffic, tagged by format.
pub enum WireBody<'a> {
    Messages(&'a mut Vec<Value>),
    Gemini(&'a mut Vec<Value>),
    Responses(&'a mut Vec<Value>),
}

impl<'a> WireBody<'a> {
    /// Every known tool-carrying array of a parsed body, in format order.
    /// Empty for bodies with none of them.
    pub fn detect(body: &'a mut Value) -> Vec<Self> {
        let Some(obj) = body.as_object_mut() else {
            return Vec::new();
        };
        let mut sections: Vec<Self> = obj
            .iter_mut()
            .filter_map(|(key, value)| {
                let items = value.as_array_mut()?;
                match key.as_str() {
                    "messages" => Some(WireBody::Messages(items)),
                    "contents" => Some(WireBody::Gemini(items)),
                    "input" => Some(WireBody::Responses(items)),
                    _ => None,
                }
            })
            .collect();
        sections.sort_by_key(WireBody::format);
        sections
    }

    pub fn format(&self) -> WireFormat {
        match self {
            WireBody::Messages(_) => WireFormat::Messages,
            WireBody::Gemini(_) => WireFormat::Gemini,
            WireBody::Responses(_) => WireFormat::Responses,
        }
    }

    /// Whether this array carries any tool output that could be redacted.
    pub fn has_tool_outputs(&self) -> bool {
        match self {
            WireBody::Messages(m) => chat::has_tool_outputs(m) || anthropic::has_tool_outputs(m),
            WireBody::Gemini(c) => gemini::has_tool_outputs(c),
            WireBody::Responses(i) => responses::has_tool_outputs(i),
        }
    }

    /// Tool names and arguments of every call this array originates.
    pub fn collect_parameters(
        &self,
        position_map: &HashMap<String, String>,
    ) -> Vec<(String, ToolParameters)> {
        match self {
            WireBody::Messages(m) => {
                let mut params = chat::collect_parameters(m);
                params.extend(anthropic::collect_parameters(m));
                params
            }
            WireBody::Gemini(c) => gemini::collect_parameters(c, position_map),
            WireBody::Responses(i) => responses::collect_parameters(i),
        }
    }

    /// Replace redacted outputs with the placeholder. Returns how many
    /// fields actually changed; already-redacted fields do not count.
    pub fn redact(&mut self, ctx: &RedactionContext<'_>) -> usize {
        match self {
            WireBody::Messages(m) => chat::redact(m, ctx.pruned) + anthropic::redact(m, ctx.pruned),
            WireBody::Gemini(c) => gemini::redact(c, ctx.pruned, ctx.position_map),
            WireBody::Responses(i) => responses::redact(i, ctx.pruned),
        }
    }
}

/// Tool arguments arrive either as a JSON-encoded string or inline.
pub(crate) fn parse_arguments(raw: Option<&Value>) -> Option<Value> {
    match raw? {
        Value::String(s) => serde_json::from_str(s).ok(),
        v @ (Value::Object(_) | Value::Array(_)) => Some(v.clone()),
        _ => None,
    }
}

/// Lower-cased string field, for case-insensitive id matching.
pub(crate) fn id_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_lowercase)
}
