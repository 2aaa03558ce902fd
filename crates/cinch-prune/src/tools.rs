//! Tools the model can call to prune its own context.
//!
//! Each tool implements [`Tool`] and is collected into a [`ToolSet`], which
//! validates arguments against the tool's JSON schema and dispatches by name.
//! Tools report failures as `"Error: ..."` strings so the model can
//! self-correct; nothing here panics or propagates.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::config::Permission;
use crate::hooks::PruningEngine;
use crate::json_schema_for;
use crate::manual::{CompressRequest, DistillTarget, ManualReport};
use crate::semantic::SemanticRun;

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = String> + Send + 'a>>;

// ── Tool definitions ───────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition handed to the host (function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

// ── Tool trait ─────────────────────────────────────────────────────

/// A tool invoked by the model inside a session.
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDef;

    /// Execute with the raw JSON arguments for the calling session.
    fn execute<'a>(&'a self, session_id: &'a str, arguments: &'a str) -> ToolFuture<'a>;

    fn name(&self) -> String {
        self.definition().function.name.clone()
    }
}

// ── ToolSet ────────────────────────────────────────────────────────

/// Tools dispatched by name, with schema validation of arguments.
pub struct ToolSet {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name(), Box::new(tool));
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Register `tool` only when `condition` holds.
    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    /// Definitions of every registered tool, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Execute a tool call by name. Unknown tools and invalid arguments
    /// produce an error string.
    pub async fn execute(&self, name: &str, session_id: &str, arguments: &str) -> String {
        let Some(tool) = self.tools.get(name) else {
            return format!("Error: unknown tool '{name}'");
        };

        if let Some(error) = validate_tool_arguments(tool.as_ref(), arguments) {
            return error;
        }

        log_tool_call(name, arguments);
        let start = std::time::Instant::now();
        let result = tool.execute(session_id, arguments).await;
        debug!(
            "Tool {name} completed in {:.0}ms ({} bytes)",
            start.elapsed().as_secs_f64() * 1000.0,
            result.len()
        );
        result
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate raw arguments against the tool's parameter schema. Returns an
/// error string for the model, or `None` if the arguments are acceptable.
pub fn validate_tool_arguments(tool: &dyn Tool, arguments: &str) -> Option<String> {
    let args_value: serde_json::Value = match serde_json::from_str(arguments) {
        Ok(v) => v,
        Err(e) => {
            return Some(format!(
                "Error: invalid JSON arguments for tool '{}': {e}. \
                 Please provide valid JSON matching the tool's parameter schema.",
                tool.name()
            ));
        }
    };

    let schema = tool.definition().function.parameters;
    let Ok(validator) = jsonschema::validator_for(&schema) else {
        return None;
    };

    let errors: Vec<String> = validator
        .iter_errors(&args_value)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Error: argument validation failed for tool '{}':\n{}\n\
             Please fix the arguments and try again.",
            tool.name(),
            errors.join("\n")
        ))
    }
}

pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.chars().count() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} arguments: {arguments}");
}

/// Parse raw JSON arguments into a typed struct, with an error string the
/// model can act on.
pub fn parse_tool_args<T: serde::de::DeserializeOwned>(arguments: &str) -> Result<T, String> {
    serde_json::from_str(arguments).map_err(|e| {
        format!(
            "Error: invalid tool arguments: {e}. \
             Please provide valid JSON matching the tool's parameter schema."
        )
    })
}

// ── Arguments ──────────────────────────────────────────────────────

/// A compact reference from the `<prunable-tools>` list, or a raw id.
#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(untagged)]
pub enum Reference {
    Number(u64),
    Text(String),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Number(n) => write!(f, "{n}"),
            Reference::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Deserialize, JsonSchema, Debug, Default)]
pub struct ContextPruningArgs {
    /// Why context should be pruned now.
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize, JsonSchema, Debug, Default)]
pub struct PruneArgs {
    /// References of the tool outputs to remove.
    #[serde(default)]
    pub ids: Vec<Reference>,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct DistillTargetArgs {
    /// Reference of the tool output to replace.
    pub id: Reference,
    /// The information worth keeping from that output.
    pub distillation: String,
}

#[derive(Deserialize, JsonSchema, Debug, Default)]
pub struct DistillArgs {
    #[serde(default)]
    pub targets: Vec<DistillTargetArgs>,
}

#[derive(Deserialize, JsonSchema, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CompressContent {
    /// First message (or tool reference) of the range.
    #[serde(default)]
    pub start_id: Option<String>,
    /// Last message (or tool reference) of the range, inclusive.
    #[serde(default)]
    pub end_id: Option<String>,
    /// Summary that replaces the range.
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Deserialize, JsonSchema, Debug, Default)]
pub struct CompressArgs {
    /// Short label for the compressed range.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub content: Option<CompressContent>,
}

fn describe(report: &ManualReport, verb: &str) -> String {
    let mut out = if report.pruned.is_empty() {
        format!("Nothing {verb}.")
    } else {
        let names: Vec<String> = report
            .pruned
            .iter()
            .map(|(id, tool)| format!("{tool} ({id})"))
            .collect();
        format!(
            "{} {} tool output(s), ~{} bytes freed: {}",
            capitalize(verb),
            report.pruned.len(),
            report.bytes_freed,
            names.join(", ")
        )
    };
    if !report.skipped.is_empty() {
        out.push_str(&format!(
            "\nSkipped (unknown, protected or already removed): {}",
            report.skipped.join(", ")
        ));
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ── Tools ──────────────────────────────────────────────────────────

/// Asks the judge model which tool outputs are obsolete.
pub struct ContextPruningTool {
    engine: Arc<PruningEngine>,
}

impl ContextPruningTool {
    pub fn new(engine: Arc<PruningEngine>) -> Self {
        Self { engine }
    }
}

impl Tool for ContextPruningTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "context_pruning",
            "Remove tool outputs that are no longer relevant to the task. \
             A separate model reviews the conversation and decides what is obsolete. \
             Call this when the context is getting long or after finishing a subtask.",
            json_schema_for::<ContextPruningArgs>(),
        )
    }

    fn execute<'a>(&'a self, session_id: &'a str, arguments: &'a str) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: ContextPruningArgs = match parse_tool_args(arguments) {
                Ok(a) => a,
                Err(e) => return e,
            };
            if let Some(reason) = &args.reason {
                debug!("context_pruning requested: {reason}");
            }
            match self.engine.run_semantic(session_id).await {
                Ok(SemanticRun::Applied(outcome)) => {
                    self.engine.note_tool_prune(session_id);
                    let mut out = format!(
                        "Pruned {} tool output(s), ~{} bytes freed.",
                        outcome.pruned.len(),
                        outcome.bytes_freed
                    );
                    if self.engine.config().semantic.show_reasoning && !outcome.reasoning.is_empty() {
                        out.push_str(&format!("\nReasoning: {}", outcome.reasoning));
                    }
                    out
                }
                Ok(SemanticRun::NothingEligible) => "No tool outputs are eligible for pruning.".into(),
                Ok(SemanticRun::Dropped) => "Context pruning is already running for this session.".into(),
                Err(e) => format!("Error: context pruning failed: {e}"),
            }
        })
    }
}

pub struct PruneTool {
    engine: Arc<PruningEngine>,
}

impl PruneTool {
    pub fn new(engine: Arc<PruningEngine>) -> Self {
        Self { engine }
    }
}

impl Tool for PruneTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "prune",
            "Remove tool outputs you no longer need, by their number in the <prunable-tools> list.",
            json_schema_for::<PruneArgs>(),
        )
    }

    fn execute<'a>(&'a self, session_id: &'a str, arguments: &'a str) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: PruneArgs = match parse_tool_args(arguments) {
                Ok(a) => a,
                Err(e) => return e,
            };
            let refs: Vec<String> = args.ids.iter().map(ToString::to_string).collect();
            match self.engine.prune_tools(session_id, &refs).await {
                Ok(report) => describe(&report, "pruned"),
                Err(e) => format!("Error: {e}"),
            }
        })
    }
}

pub struct DistillTool {
    engine: Arc<PruningEngine>,
}

impl DistillTool {
    pub fn new(engine: Arc<PruningEngine>) -> Self {
        Self { engine }
    }
}

impl Tool for DistillTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "distill",
            "Replace tool outputs with a short distillation of what matters in them. \
             Use when an output is large but a few facts from it are still needed.",
            json_schema_for::<DistillArgs>(),
        )
    }

    fn execute<'a>(&'a self, session_id: &'a str, arguments: &'a str) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: DistillArgs = match parse_tool_args(arguments) {
                Ok(a) => a,
                Err(e) => return e,
            };
            let targets: Vec<DistillTarget> = args
                .targets
                .into_iter()
                .map(|t| DistillTarget {
                    id: t.id.to_string(),
                    distillation: t.distillation,
                })
                .collect();
            match self.engine.distill_tools(session_id, &targets).await {
                Ok(report) => describe(&report, "distilled"),
                Err(e) => format!("Error: {e}"),
            }
        })
    }
}

pub struct CompressTool {
    engine: Arc<PruningEngine>,
}

impl CompressTool {
    pub fn new(engine: Arc<PruningEngine>) -> Self {
        Self { engine }
    }
}

impl Tool for CompressTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "compress",
            "Replace a finished stretch of the conversation with a summary. \
             startId and endId are message ids or numbers from the <prunable-tools> list.",
            json_schema_for::<CompressArgs>(),
        )
    }

    fn execute<'a>(&'a self, session_id: &'a str, arguments: &'a str) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: CompressArgs = match parse_tool_args(arguments) {
                Ok(a) => a,
                Err(e) => return e,
            };
            let content = args.content.unwrap_or_default();
            let request = CompressRequest {
                topic: args.topic,
                start_id: content.start_id,
                end_id: content.end_id,
                summary: content.summary,
            };
            match self.engine.compress(session_id, &request).await {
                Ok(report) => format!(
                    "Compressed {} message(s) and {} tool output(s) as \"{}\", ~{} bytes freed.",
                    report.messages, report.tools, report.topic, report.bytes_freed
                ),
                Err(e) => format!("Error: {e}"),
            }
        })
    }
}

/// The tool set for `engine`: `context_pruning` when semantic pruning runs on
/// tool calls, plus every manual tool whose permission is not `deny`.
pub fn pruning_tools(engine: &Arc<PruningEngine>) -> ToolSet {
    let config = engine.config();
    let allowed = |p: Permission| p != Permission::Deny;
    ToolSet::new()
        .with_if(
            config.semantic_on_tool(),
            ContextPruningTool::new(Arc::clone(engine)),
        )
        .with_if(
            allowed(config.tools.prune.permission),
            PruneTool::new(Arc::clone(engine)),
        )
        .with_if(
            allowed(config.tools.distill.permission),
            DistillTool::new(Arc::clone(engine)),
        )
        .with_if(
            allowed(config.tools.compress.permission),
            CompressTool::new(Arc::clone(engine)),
        )
}
