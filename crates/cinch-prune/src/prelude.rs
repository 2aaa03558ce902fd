//! Convenience re-exports for embedding the engine in a host.
//!
//! ```ignore
//! use cinch_prune::prelude::*;
//! ```
//!
//! Strategy functions, wire-format internals and prompt builders are left
//! out; import those from their modules directly.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    Message, MessageRole, PLACEHOLDER, Part, PruneError, Result, ToolPart, ToolState, ToolStatus,
};

// ── Engine and hooks ────────────────────────────────────────────────
pub use crate::commands::CommandOutput;
pub use crate::config::PruneConfig;
pub use crate::hooks::{ChatParams, PipelineMode, PruningEngine};
pub use crate::host::{HostClient, InMemoryHost, SessionInfo};

// ── State ───────────────────────────────────────────────────────────
pub use crate::state::persist::{PersistedSessionState, SessionPersistence};
pub use crate::state::store::SessionStore;
pub use crate::state::{PruneOrigin, PruneSource, SessionState};

// ── Decisions and redaction ─────────────────────────────────────────
pub use crate::redact::{OutboundRequest, RedactOutcome, Redactor, RequestInterceptor};
pub use crate::semantic::judge::{Judge, OpenRouterJudge};
pub use crate::semantic::{SemanticOutcome, SemanticRun};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{Tool, ToolDef, ToolFuture, ToolSet};
