//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! [`PruneConfig::load`] layers a global file and a project file over the
//! defaults; each layer is deep-merged as a JSON object, so a project file
//! only needs the keys it changes.
//!
//! ```ignore
//! let config = PruneConfig::default()
//!     .with_protected_tool("deploy")
//!     .with_purge_turns(6);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{PruneError, Result};

/// Tools whose outputs are never redacted, whatever the config says.
pub const DEFAULT_PROTECTED_TOOLS: &[&str] = &[
    "task",
    "todowrite",
    "todoread",
    "context_pruning",
    "prune",
    "distill",
    "compress",
    "batch",
];

/// Name of the only strategy that can run on idle or on tool invocation.
pub const SEMANTIC_STRATEGY: &str = "semantic";

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct PruneConfig {
    pub enabled: bool,
    pub debug: bool,
    pub protected_tools: Vec<String>,
    pub strategies: StrategiesConfig,
    pub semantic: SemanticConfig,
    pub manual_mode: ManualModeConfig,
    pub tools: ToolPermissions,
    /// Number of transforms with new tool activity between nudges.
    pub nudge_frequency: u32,
    pub commands: CommandsConfig,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
            protected_tools: DEFAULT_PROTECTED_TOOLS.iter().map(|s| s.to_string()).collect(),
            strategies: StrategiesConfig::default(),
            semantic: SemanticConfig::default(),
            manual_mode: ManualModeConfig::default(),
            tools: ToolPermissions::default(),
            nudge_frequency: 10,
            commands: CommandsConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategiesConfig {
    pub deduplication: DeduplicationConfig,
    pub supersede_writes: SupersedeWritesConfig,
    pub purge_errors: PurgeErrorsConfig,
    /// Strategies run when the session goes idle.
    pub on_idle: Vec<String>,
    /// Strategies run when the model invokes the `context_pruning` tool.
    pub on_tool: Vec<String>,
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        Self {
            deduplication: DeduplicationConfig::default(),
            supersede_writes: SupersedeWritesConfig::default(),
            purge_errors: PurgeErrorsConfig::default(),
            on_idle: Vec::new(),
            on_tool: vec![SEMANTIC_STRATEGY.to_string()],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct DeduplicationConfig {
    pub enabled: bool,
    pub protected_tools: Vec<String>,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            protected_tools: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct SupersedeWritesConfig {
    pub enabled: bool,
}

impl Default for SupersedeWritesConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct PurgeErrorsConfig {
    pub enabled: bool,
    /// Age in turns after which an errored call becomes eligible.
    pub turns: u32,
    pub protected_tools: Vec<String>,
}

impl Default for PurgeErrorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            turns: 4,
            protected_tools: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct SemanticConfig {
    /// Judge model. Falls back to the session's model, then [`crate::DEFAULT_MODEL`].
    pub model: Option<String>,
    pub max_tokens: u32,
    pub show_reasoning: bool,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 1024,
            show_reasoning: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct ManualModeConfig {
    pub enabled: bool,
    /// Keep running the heuristic strategies while manual mode is on.
    pub automatic_strategies: bool,
}

impl Default for ManualModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            automatic_strategies: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    Allow,
    Ask,
    Deny,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
#[serde(default)]
pub struct ToolPermission {
    pub permission: Permission,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ToolPermissions {
    pub prune: ToolPermission,
    pub distill: ToolPermission,
    pub compress: ToolPermission,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CommandsConfig {
    pub enabled: bool,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl PruneConfig {
    /// Add a globally protected tool (builder pattern).
    pub fn with_protected_tool(mut self, tool: impl Into<String>) -> Self {
        self.protected_tools.push(tool.into());
        self
    }

    /// Set the purge-errors age threshold (builder pattern).
    pub fn with_purge_turns(mut self, turns: u32) -> Self {
        self.strategies.purge_errors.turns = turns;
        self
    }

    /// Start every new session in manual mode (builder pattern).
    pub fn with_manual_mode(mut self, enabled: bool) -> Self {
        self.manual_mode.enabled = enabled;
        self
    }

    /// Set the judge model (builder pattern).
    pub fn with_semantic_model(mut self, model: impl Into<String>) -> Self {
        self.semantic.model = Some(model.into());
        self
    }

    /// Whether `tool` is protected globally or by one of `extra`.
    ///
    /// Matching is case-insensitive.
    pub fn is_protected(&self, tool: &str, extra: &[String]) -> bool {
        self.protected_tools
            .iter()
            .chain(extra.iter())
            .any(|p| p.eq_ignore_ascii_case(tool))
    }

    pub fn semantic_on_idle(&self) -> bool {
        self.strategies.on_idle.iter().any(|s| s == SEMANTIC_STRATEGY)
    }

    pub fn semantic_on_tool(&self) -> bool {
        self.strategies.on_tool.iter().any(|s| s == SEMANTIC_STRATEGY)
    }

    /// Build a config from a JSON value layered over the defaults.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut base = serde_json::to_value(Self::default())?;
        let mut layer = value;
        normalize_permissions(&mut layer);
        deep_merge(&mut base, layer);
        Self::from_merged(base)
    }

    /// Load the global file, then the project file, over the defaults.
    ///
    /// Missing or unparsable files are skipped with a warning. Never fails.
    pub fn load(global: Option<&Path>, project: Option<&Path>) -> Self {
        let mut merged = match serde_json::to_value(Self::default()) {
            Ok(v) => v,
            Err(_) => return Self::default(),
        };

        for path in [global, project].into_iter().flatten() {
            match read_layer(path) {
                Ok(Some(mut layer)) => {
                    debug!("Loaded config layer from {}", path.display());
                    normalize_permissions(&mut layer);
                    deep_merge(&mut merged, layer);
                }
                Ok(None) => {}
                Err(e) => warn!("Ignoring config {}: {e}", path.display()),
            }
        }

        Self::from_merged(merged).unwrap_or_else(|e| {
            warn!("Config did not validate, using defaults: {e}");
            Self::default()
        })
    }

    fn from_merged(merged: Value) -> Result<Self> {
        let mut config: Self =
            serde_json::from_value(merged).map_err(|e| PruneError::Config(e.to_string()))?;
        for tool in DEFAULT_PROTECTED_TOOLS {
            if !config.is_protected(tool, &[]) {
                config.protected_tools.push(tool.to_string());
            }
        }
        Ok(config)
    }
}

fn read_layer(path: &Path) -> Result<Option<Value>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value: Value = serde_json::from_str(&text)?;
    if !value.is_object() {
        return Err(PruneError::Config("top level must be an object".into()));
    }
    Ok(Some(value))
}

/// Recursively merge `overlay` into `base`. Objects merge key by key;
/// everything else is replaced.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Drop permission values that are not `allow`, `ask` or `deny`.
fn normalize_permissions(layer: &mut Value) {
    let Some(tools) = layer.get_mut("tools").and_then(Value::as_object_mut) else {
        return;
    };
    for name in ["prune", "distill", "compress"] {
        let Some(entry) = tools.get_mut(name).and_then(Value::as_object_mut) else {
            continue;
        };
        let valid = entry
            .get("permission")
            .and_then(Value::as_str)
            .is_some_and(|p| matches!(p, "allow" | "ask" | "deny"));
        if !valid && entry.contains_key("permission") {
            warn!("Invalid permission for tool {name}, falling back to allow");
            entry.remove("permission");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let c = PruneConfig::default();
        assert!(c.enabled);
        assert_eq!(c.strategies.purge_errors.turns, 4);
        assert_eq!(c.nudge_frequency, 10);
        assert!(c.semantic_on_tool());
        assert!(!c.semantic_on_idle());
        assert!(c.is_protected("TodoWrite", &[]));
        assert!(!c.is_protected("read", &[]));
    }

    #[test]
    fn empty_object_is_valid() {
        let c = PruneConfig::from_value(json!({})).unwrap();
        assert_eq!(c.tools.prune.permission, Permission::Allow);
    }

    #[test]
    fn nested_keys_merge_over_defaults() {
        let c = PruneConfig::from_value(json!({
            "strategies": {"purgeErrors": {"turns": 9}},
            "manualMode": {"enabled": true}
        }))
        .unwrap();
        assert_eq!(c.strategies.purge_errors.turns, 9);
        assert!(c.strategies.purge_errors.enabled);
        assert!(c.strategies.deduplication.enabled);
        assert!(c.manual_mode.enabled);
        assert!(c.manual_mode.automatic_strategies);
    }

    #[test]
    fn invalid_permission_falls_back_to_allow() {
        let c = PruneConfig::from_value(json!({
            "tools": {"prune": {"permission": "sometimes"}, "compress": {"permission": "deny"}}
        }))
        .unwrap();
        assert_eq!(c.tools.prune.permission, Permission::Allow);
        assert_eq!(c.tools.compress.permission, Permission::Deny);
    }

    #[test]
    fn default_protected_tools_survive_override() {
        let c = PruneConfig::from_value(json!({"protectedTools": ["deploy"]})).unwrap();
        assert!(c.is_protected("deploy", &[]));
        assert!(c.is_protected("task", &[]));
    }

    #[test]
    fn builders() {
        let c = PruneConfig::default()
            .with_protected_tool("Deploy")
            .with_purge_turns(7)
            .with_manual_mode(true)
            .with_semantic_model("m/x");
        assert!(c.is_protected("deploy", &[]));
        assert_eq!(c.strategies.purge_errors.turns, 7);
        assert!(c.manual_mode.enabled);
        assert_eq!(c.semantic.model.as_deref(), Some("m/x"));
    }

    #[test]
    fn load_layers_global_then_project() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.json");
        let project = dir.path().join("project.json");
        std::fs::write(&global, r#"{"nudgeFrequency": 3, "debug": true}"#).unwrap();
        std::fs::write(&project, r#"{"nudgeFrequency": 5}"#).unwrap();

        let c = PruneConfig::load(Some(&global), Some(&project));
        assert_eq!(c.nudge_frequency, 5);
        assert!(c.debug);
    }

    #[test]
    fn load_skips_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let corrupt = dir.path().join("bad.json");
        std::fs::write(&corrupt, "{ not json").unwrap();
        let missing = dir.path().join("nope.json");

        let c = PruneConfig::load(Some(&missing), Some(&corrupt));
        assert_eq!(c.nudge_frequency, 10);
    }
}
