//! File-backed session state.
//!
//! Layout: `<base>/sessions/<session-id>.json`, written atomically through a
//! temp file and a rename. A file that fails to parse is treated as absent.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{CompressSummary, PruneOrigin, PruneState, SessionState};
use crate::error::{PruneError, Result};
use crate::short_id;

/// Reject ids that could escape the sessions directory. Runs before any I/O.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(PruneError::InvalidSessionId(session_id.to_string()))
    }
}

/// Identifier-to-weight mapping as stored on disk.
///
/// Older files stored a bare array of identifiers; those load with weight 0.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum StoredWeights {
    Map(HashMap<String, Value>),
    Legacy(Vec<String>),
}

impl Default for StoredWeights {
    fn default() -> Self {
        StoredWeights::Map(HashMap::new())
    }
}

impl StoredWeights {
    fn into_weights(self) -> HashMap<String, u64> {
        match self {
            StoredWeights::Map(map) => map
                .into_iter()
                .map(|(id, w)| {
                    let weight = w
                        .as_u64()
                        .or_else(|| w.as_f64().map(|f| f.max(0.0) as u64))
                        .unwrap_or(0);
                    (id, weight)
                })
                .collect(),
            StoredWeights::Legacy(ids) => ids.into_iter().map(|id| (id, 0)).collect(),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct StoredPrune {
    #[serde(default, alias = "toolIds")]
    tools: StoredWeights,
    #[serde(default, alias = "messageIds")]
    messages: StoredWeights,
    #[serde(default)]
    origins: HashMap<String, Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    #[serde(default)]
    prune: StoredPrune,
    #[serde(default)]
    compress_summaries: Vec<CompressSummary>,
    #[serde(default)]
    distillations: HashMap<String, String>,
    #[serde(default)]
    last_compaction: i64,
    #[serde(default)]
    saved_at: Option<String>,
}

/// The persisted part of a [`SessionState`].
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSessionState {
    pub session_id: String,
    pub prune: PruneState,
    pub compress_summaries: Vec<CompressSummary>,
    pub distillations: HashMap<String, String>,
    pub last_compaction: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<String>,
}

impl PersistedSessionState {
    pub fn from_state(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            prune: state.prune.clone(),
            compress_summaries: state.compress_summaries.clone(),
            distillations: state.distillations.clone(),
            last_compaction: state.last_compaction,
            saved_at: Some(Utc::now().to_rfc3339()),
        }
    }

    /// Merge the persisted fields into `state`. Entries already present in
    /// `state` win, so a late restore never undoes newer decisions.
    pub fn apply_to(self, state: &mut SessionState) {
        for (id, weight) in self.prune.tools {
            state.prune.tools.entry(id).or_insert(weight);
        }
        for (id, weight) in self.prune.messages {
            state.prune.messages.entry(id).or_insert(weight);
        }
        for (id, origin) in self.prune.origins {
            state.prune.origins.entry(id).or_insert(origin);
        }
        for summary in self.compress_summaries {
            if !state.compress_summaries.contains(&summary) {
                state.compress_summaries.push(summary);
            }
        }
        for (id, text) in self.distillations {
            state.distillations.entry(id).or_insert(text);
        }
        state.last_compaction = state.last_compaction.max(self.last_compaction);
    }

    fn from_stored(session_id: &str, stored: StoredSession) -> Self {
        let tools = stored.prune.tools.into_weights();
        // Drop origins that do not parse or point at an unknown tool.
        let origins = stored
            .prune
            .origins
            .into_iter()
            .filter(|(id, _)| tools.contains_key(id))
            .filter_map(|(id, v)| serde_json::from_value::<PruneOrigin>(v).ok().map(|o| (id, o)))
            .collect();
        Self {
            session_id: session_id.to_string(),
            prune: PruneState {
                tools,
                messages: stored.prune.messages.into_weights(),
                origins,
            },
            compress_summaries: stored.compress_summaries,
            distillations: stored.distillations,
            last_compaction: stored.last_compaction,
            saved_at: stored.saved_at,
        }
    }
}

/// Stores one JSON record per session under a base directory.
#[derive(Clone, Debug)]
pub struct SessionPersistence {
    sessions_dir: PathBuf,
}

impl SessionPersistence {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            sessions_dir: base_dir.as_ref().join("sessions"),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    pub fn session_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.sessions_dir.join(format!("{session_id}.json")))
    }

    pub async fn save(&self, state: &SessionState) -> Result<()> {
        let final_path = self.session_path(&state.session_id)?;
        let tmp_path = self
            .sessions_dir
            .join(format!(".{}.json.tmp", state.session_id));

        tokio::fs::create_dir_all(&self.sessions_dir).await?;
        let json = serde_json::to_string_pretty(&PersistedSessionState::from_state(state))?;
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;

        debug!(
            "Saved session {} ({} tools, {} messages)",
            short_id(&state.session_id),
            state.prune.tools.len(),
            state.prune.messages.len()
        );
        Ok(())
    }

    /// Load a session. Missing and corrupted files both yield `None`.
    pub async fn load(&self, session_id: &str) -> Result<Option<PersistedSessionState>> {
        let path = self.session_path(session_id)?;
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(j) => j,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<StoredSession>(&json) {
            Ok(stored) => Ok(Some(PersistedSessionState::from_stored(session_id, stored))),
            Err(e) => {
                warn!("Ignoring corrupted state for session {}: {e}", short_id(session_id));
                Ok(None)
            }
        }
    }

    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        let path = self.session_path(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of every stored session, sorted.
    pub async fn list_session_ids(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.sessions_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json")
                && validate_session_id(id).is_ok()
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
