//! Host hook surface.
//!
//! [`PruningEngine`] owns the shared [`SessionStore`] and wires each host
//! hook to the component that handles it:
//!
//! | Hook | Handler |
//! |---|---|
//! | pre-request parameters | [`PruningEngine::on_chat_params`] |
//! | message transform (pre-send) | [`PruningEngine::on_messages_transform`] |
//! | outbound network request | [`PruningEngine::redactor`] |
//! | idle session | [`PruningEngine::on_idle`] |
//! | tool invocation | [`PruningEngine::tool_set`] |
//! | `/dcp` command | [`PruningEngine::handle_command`] |
//! | post-response | [`PruningEngine::persist`] |
//!
//! The pre-send and post-response pipelines never fail the host: an error is
//! logged and reported as [`PipelineMode::FailOpen`], and the transcript or
//! response continues unchanged.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::commands::{self, CommandOutput, Subcommand, parse_dcp_command};
use crate::config::{Permission, PruneConfig};
use crate::correlator::{build_position_map, is_position_correlated_provider};
use crate::error::{PruneError, Result};
use crate::host::HostClient;
use crate::manual::{self, CompressReport, CompressRequest, DistillTarget, ManualReport};
use crate::redact::Redactor;
use crate::scheduler::Scheduler;
use crate::semantic::judge::Judge;
use crate::semantic::{SemanticPruner, SemanticRun};
use crate::state::SessionState;
use crate::state::persist::SessionPersistence;
use crate::state::reconcile::{check_session, reconcile_prune_origins};
use crate::state::store::SessionStore;
use crate::strategies::StrategyRunner;
use crate::tools::{ToolSet, pruning_tools};
use crate::transform::{apply_redactions, inject_prune_context, is_internal_agent};
use crate::{Message, short_id};

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Normal,
    /// Something failed; the host proceeds as if the engine were absent.
    FailOpen,
}

/// Provider and model resolved for the next request of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatParams {
    pub session_id: String,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    /// Context window of the model, in tokens.
    pub context_limit: Option<u64>,
}

pub struct PruningEngine {
    config: PruneConfig,
    store: SessionStore,
    host: Arc<dyn HostClient>,
    strategies: StrategyRunner,
    semantic: SemanticPruner,
    redactor: Redactor,
    persistence: Option<SessionPersistence>,
    scheduler: Scheduler,
}

impl PruningEngine {
    pub fn new(config: PruneConfig, host: Arc<dyn HostClient>, judge: Arc<dyn Judge>) -> Self {
        let store = SessionStore::new();
        Self {
            semantic: SemanticPruner::new(store.clone(), judge),
            redactor: Redactor::new(store.clone(), Arc::clone(&host)),
            strategies: StrategyRunner::default(),
            persistence: None,
            scheduler: Scheduler::new(),
            config,
            store,
            host,
        }
    }

    /// Persist session state under `persistence` after every response.
    pub fn with_persistence(mut self, persistence: SessionPersistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn config(&self) -> &PruneConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// The outbound-request interceptor to register with the host.
    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn semantic(&self) -> &SemanticPruner {
        &self.semantic
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ── Session lifecycle ──────────────────────────────────────────

    /// Create state for a session on first sight and restore persisted
    /// decisions into it. A failed restore is retried on the next call.
    async fn prepare_session(&self, session_id: &str, messages: &[Message]) {
        self.store
            .ensure_initialized(
                self.host.as_ref(),
                session_id,
                messages,
                self.config.manual_mode.enabled,
            )
            .await;
        if !self.store.read(session_id, |s| s.restore_pending).unwrap_or(false) {
            return;
        }
        match self.restore(session_id).await {
            Ok(_) => {}
            Err(e @ PruneError::InvalidSessionId(_)) => {
                warn!("Not restoring session {}: {e}", short_id(session_id));
                self.store.with_session(session_id, |s| s.restore_pending = false);
            }
            Err(e) => warn!("Restoring session {} failed, will retry: {e}", short_id(session_id)),
        }
    }

    /// Load persisted state into a tracked session. Returns whether any
    /// state was found.
    pub async fn restore(&self, session_id: &str) -> Result<bool> {
        let persisted = match &self.persistence {
            Some(persistence) => persistence.load(session_id).await?,
            None => None,
        };
        let restored = self
            .store
            .with_session(session_id, |s| {
                s.restore_pending = false;
                match persisted {
                    Some(persisted) if !s.is_sub_agent => {
                        persisted.apply_to(s);
                        true
                    }
                    _ => false,
                }
            })
            .unwrap_or(false);
        if restored {
            info!("Restored persisted state for session {}", short_id(session_id));
        }
        Ok(restored)
    }

    /// Post-response pipeline: write the session's state to disk.
    pub async fn persist(&self, session_id: &str) -> PipelineMode {
        let Some(persistence) = &self.persistence else {
            return PipelineMode::Normal;
        };
        let Some(state) = self.store.snapshot(session_id) else {
            return PipelineMode::Normal;
        };
        if state.is_sub_agent {
            return PipelineMode::Normal;
        }
        match persistence.save(&state).await {
            Ok(()) => PipelineMode::Normal,
            Err(e) => {
                warn!("Failed to persist session {}: {e}", short_id(session_id));
                PipelineMode::FailOpen
            }
        }
    }

    /// Forget a session and cancel its pending background work.
    pub fn drop_session(&self, session_id: &str) -> Option<SessionState> {
        self.scheduler.cancel(session_id);
        self.store.drop_session(session_id)
    }

    // ── Hooks ──────────────────────────────────────────────────────

    /// Pre-request parameter hook: record the model in use and, for
    /// providers whose tool results carry no call ids, rebuild the position map.
    pub async fn on_chat_params(&self, params: &ChatParams) -> Result<()> {
        let session_id = params.session_id.as_str();
        let correlated = params
            .provider_id
            .as_deref()
            .is_some_and(is_position_correlated_provider);

        let messages = if correlated || !self.store.contains(session_id) {
            self.host.session_messages(session_id, None).await?
        } else {
            Vec::new()
        };
        self.prepare_session(session_id, &messages).await;

        self.store
            .with_session(session_id, |s| {
                s.model.provider_id = params.provider_id.clone();
                s.model.model_id = params.model_id.clone();
                if params.context_limit.is_some() {
                    s.model_context_limit = params.context_limit;
                }
                if correlated {
                    check_session(s, &messages);
                    let map = build_position_map(s, &messages);
                    debug!("Position map for {} has {} entries", short_id(session_id), map.len());
                    s.position_map = map;
                }
            })
            .ok_or_else(|| PruneError::UnknownSession(session_id.to_string()))
    }

    /// Pre-send pipeline over the host's transcript.
    ///
    /// `system_prompt` is used to recognise the host's internal helper agents,
    /// which do not get prunable-tools context.
    pub async fn on_messages_transform(
        &self,
        session_id: &str,
        messages: &mut Vec<Message>,
        system_prompt: Option<&str>,
    ) -> PipelineMode {
        if !self.config.enabled {
            return PipelineMode::Normal;
        }
        match self.transform(session_id, messages, system_prompt).await {
            Ok(()) => PipelineMode::Normal,
            Err(e) => {
                warn!("Message transform failed for {}, continuing: {e}", short_id(session_id));
                PipelineMode::FailOpen
            }
        }
    }

    async fn transform(
        &self,
        session_id: &str,
        messages: &mut Vec<Message>,
        system_prompt: Option<&str>,
    ) -> Result<()> {
        self.prepare_session(session_id, messages).await;
        let config = &self.config;
        let internal = system_prompt.is_some_and(is_internal_agent);

        self.store
            .with_session(session_id, |s| {
                check_session(s, messages);
                if s.is_sub_agent {
                    return;
                }
                reconcile_prune_origins(s, messages);
                if !s.manual_mode || config.manual_mode.automatic_strategies {
                    self.strategies.run(s, config, messages);
                }
                apply_redactions(s, messages);
                if !internal {
                    inject_prune_context(s, config, messages);
                }
            })
            .ok_or_else(|| PruneError::UnknownSession(session_id.to_string()))
    }

    /// Idle-session hook. Schedules a semantic run when configured to.
    /// A trigger that arrives while a run for the session is outstanding is
    /// dropped. Returns whether a run was scheduled.
    pub fn on_idle(self: &Arc<Self>, session_id: &str) -> bool {
        if !self.config.enabled || !self.config.semantic_on_idle() {
            return false;
        }
        if self.semantic.is_in_flight(session_id) {
            debug!("Semantic run in flight for {}, ignoring idle", short_id(session_id));
            return false;
        }
        let engine = Arc::clone(self);
        let id = session_id.to_string();
        self.scheduler
            .schedule(session_id, Duration::ZERO, async move {
                engine.run_semantic(&id).await.map(|_| ())
            })
    }

    /// One semantic decision over the session's current transcript.
    pub async fn run_semantic(&self, session_id: &str) -> Result<SemanticRun> {
        let messages = self.host.session_messages(session_id, None).await?;
        self.prepare_session(session_id, &messages).await;
        let skip = self
            .store
            .with_session(session_id, |s| {
                check_session(s, &messages);
                s.is_sub_agent
            })
            .unwrap_or(true);
        if skip {
            return Ok(SemanticRun::NothingEligible);
        }

        let run = self.semantic.run(session_id, &messages, &self.config).await?;
        if matches!(run, SemanticRun::Applied(_)) {
            self.persist(session_id).await;
        }
        Ok(run)
    }

    /// Suppress the next prunable-tools injection for `session_id`.
    pub fn note_tool_prune(&self, session_id: &str) {
        self.store.with_session(session_id, |s| s.last_tool_prune = true);
    }

    /// Tools the model can call.
    pub fn tool_set(self: &Arc<Self>) -> ToolSet {
        pruning_tools(self)
    }

    /// Command hook. Returns `None` when `text` is not a `/dcp` command or
    /// commands are disabled.
    pub async fn handle_command(&self, session_id: &str, text: &str) -> Option<CommandOutput> {
        if !self.config.commands.enabled {
            return None;
        }
        let command = parse_dcp_command(text)?;
        let subcommand = Subcommand::from_command(&command);
        debug!("Command {subcommand:?} for {}", short_id(session_id));
        let output = self
            .with_transcript(session_id, |s, config, messages| {
                Ok(commands::execute(s, config, messages, subcommand))
            })
            .await;
        Some(output.unwrap_or_else(|e| CommandOutput::Message(format!("Error: {e}"))))
    }

    /// Extra system-prompt text describing the pruning tools, or `None` in
    /// manual mode and for sub-agents.
    pub fn system_prompt_addition(&self, session_id: &str) -> Option<String> {
        let (manual, sub_agent) = self
            .store
            .read(session_id, |s| (s.manual_mode, s.is_sub_agent))
            .unwrap_or((self.config.manual_mode.enabled, false));
        if !self.config.enabled || manual || sub_agent {
            return None;
        }
        let tools = &self.config.tools;
        let available: Vec<&str> = [
            ("prune", tools.prune.permission),
            ("distill", tools.distill.permission),
            ("compress", tools.compress.permission),
        ]
        .into_iter()
        .filter(|(_, p)| *p != Permission::Deny)
        .map(|(name, _)| name)
        .collect();
        if available.is_empty() {
            return None;
        }
        Some(format!(
            "Tool outputs that can be removed are listed in <prunable-tools> messages, each with a number. \
             Keep the context lean: once an output is no longer needed, remove it with the {} tool(s). \
             Never remove outputs you still depend on.",
            available.join(", ")
        ))
    }

    // ── Manual operations ──────────────────────────────────────────

    /// Run `op` against the session's state and live transcript, then persist.
    async fn with_transcript<R>(
        &self,
        session_id: &str,
        op: impl FnOnce(&mut SessionState, &PruneConfig, &[Message]) -> Result<R>,
    ) -> Result<R> {
        let messages = self.host.session_messages(session_id, None).await?;
        self.prepare_session(session_id, &messages).await;
        let result = self
            .store
            .with_session(session_id, |s| {
                check_session(s, &messages);
                op(s, &self.config, &messages)
            })
            .ok_or_else(|| PruneError::UnknownSession(session_id.to_string()))??;
        self.persist(session_id).await;
        Ok(result)
    }

    pub async fn prune_tools(&self, session_id: &str, references: &[String]) -> Result<ManualReport> {
        self.with_transcript(session_id, |s, config, messages| {
            manual::prune_refs(s, config, messages, references)
        })
        .await
    }

    pub async fn distill_tools(
        &self,
        session_id: &str,
        targets: &[DistillTarget],
    ) -> Result<ManualReport> {
        self.with_transcript(session_id, |s, config, messages| {
            manual::distill_targets(s, config, messages, targets)
        })
        .await
    }

    pub async fn compress(&self, session_id: &str, request: &CompressRequest) -> Result<CompressReport> {
        self.with_transcript(session_id, |s, config, messages| {
            manual::compress_range(s, config, messages, request)
        })
        .await
    }

    pub async fn sweep(&self, session_id: &str, count: Option<usize>) -> Result<ManualReport> {
        self.with_transcript(session_id, |s, config, messages| {
            Ok(manual::sweep(s, config, messages, count))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{InMemoryHost, SessionInfo};
    use crate::semantic::judge::JudgeFuture;
    use crate::{PLACEHOLDER, Part};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedJudge(String);

    impl Judge for ScriptedJudge {
        fn complete<'a>(&'a self, _: &'a str, _: &'a str, _: u32) -> JudgeFuture<'a> {
            let reply = self.0.clone();
            Box::pin(async move { Ok(reply) })
        }
    }

    fn transcript() -> Vec<Message> {
        vec![
            Message::user("u1", 1, "read it twice"),
            Message::assistant(
                "a1",
                2,
                vec![
                    Part::StepStart,
                    Part::tool("c1", "read", json!({"filePath": "a.rs"}), "old contents"),
                    Part::tool("c2", "read", json!({"filePath": "a.rs"}), "new contents"),
                    Part::tool("c3", "grep", json!({"pattern": "fn"}), "matches"),
                ],
            ),
        ]
    }

    fn engine(host: &InMemoryHost, reply: &str) -> Arc<PruningEngine> {
        Arc::new(PruningEngine::new(
            PruneConfig::default(),
            Arc::new(host.clone()),
            Arc::new(ScriptedJudge(reply.into())),
        ))
    }

    fn host() -> InMemoryHost {
        let host = InMemoryHost::new().with_session(SessionInfo::top_level("ses_1"));
        host.set_messages("ses_1", transcript());
        host
    }

    #[tokio::test]
    async fn transform_dedups_redacts_and_injects() {
        let host = host();
        let engine = engine(&host, "{}");
        let mut msgs = transcript();
        let mode = engine.on_messages_transform("ses_1", &mut msgs, None).await;
        assert_eq!(mode, PipelineMode::Normal);

        let state = engine.store().snapshot("ses_1").unwrap();
        assert!(state.prune.is_tool_pruned("c1"));
        let first = msgs[1].tool_parts().next().unwrap();
        assert_eq!(first.state.output.as_deref(), Some(PLACEHOLDER));
        assert!(msgs.last().unwrap().text().contains("<prunable-tools>"));
    }

    #[tokio::test]
    async fn internal_agents_get_no_context() {
        let host = host();
        let engine = engine(&host, "{}");
        let mut msgs = transcript();
        engine
            .on_messages_transform("ses_1", &mut msgs, Some("You are a title generator."))
            .await;
        assert_eq!(msgs.len(), 2);
    }

    #[tokio::test]
    async fn failed_session_lookup_is_treated_as_top_level() {
        let host = InMemoryHost::new();
        let engine = engine(&host, "{}");
        let mut msgs = transcript();
        let mode = engine.on_messages_transform("ghost", &mut msgs, None).await;
        assert_eq!(mode, PipelineMode::Normal);
        assert!(!engine.store().snapshot("ghost").unwrap().is_sub_agent);
        assert_eq!(msgs[1].tool_parts().next().unwrap().state.output.as_deref(), Some(PLACEHOLDER));
    }

    #[tokio::test]
    async fn failed_restore_is_retried_on_the_next_turn() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = SessionPersistence::new(dir.path());
        let path = persistence.session_path("ses_1").unwrap();
        // A directory where the state file belongs makes the read fail.
        std::fs::create_dir_all(&path).unwrap();

        let engine = PruningEngine::new(
            PruneConfig::default(),
            Arc::new(host()),
            Arc::new(ScriptedJudge("{}".into())),
        )
        .with_persistence(SessionPersistence::new(dir.path()));
        let mut msgs = transcript();
        let mode = engine.on_messages_transform("ses_1", &mut msgs, None).await;
        assert_eq!(mode, PipelineMode::Normal);
        assert!(engine.store().read("ses_1", |s| s.restore_pending).unwrap());

        std::fs::remove_dir(&path).unwrap();
        let mut saved = SessionState::new("ses_1");
        saved.prune.tools.insert("c3".into(), 7);
        persistence.save(&saved).await.unwrap();

        let mut msgs = transcript();
        engine.on_messages_transform("ses_1", &mut msgs, None).await;
        let state = engine.store().snapshot("ses_1").unwrap();
        assert!(!state.restore_pending);
        assert_eq!(state.prune.tools.get("c3"), Some(&7));
        assert!(state.prune.is_tool_pruned("c1"));
    }

    #[tokio::test]
    async fn sub_agent_transcripts_are_untouched() {
        let host = InMemoryHost::new().with_session(SessionInfo::child("sub", "ses_1"));
        let engine = engine(&host, "{}");
        let mut msgs = transcript();
        engine.on_messages_transform("sub", &mut msgs, None).await;
        assert_eq!(msgs.len(), 2);
        assert!(engine.store().snapshot("sub").unwrap().prune.tools.is_empty());
    }

    #[tokio::test]
    async fn chat_params_record_model_and_position_map() {
        let host = host();
        let engine = engine(&host, "{}");
        engine
            .on_chat_params(&ChatParams {
                session_id: "ses_1".into(),
                provider_id: Some("google".into()),
                model_id: Some("gemini-2.5-pro".into()),
                context_limit: Some(1_000_000),
            })
            .await
            .unwrap();
        let state = engine.store().snapshot("ses_1").unwrap();
        assert_eq!(state.model.model_id.as_deref(), Some("gemini-2.5-pro"));
        assert_eq!(state.model_context_limit, Some(1_000_000));
        assert_eq!(state.position_map.len(), 3);
    }

    #[tokio::test]
    async fn idle_runs_semantic_when_configured() {
        let host = host();
        let mut config = PruneConfig::default();
        config.strategies.on_idle = vec!["semantic".into()];
        let engine = Arc::new(PruningEngine::new(
            config,
            Arc::new(host.clone()),
            Arc::new(ScriptedJudge(r#"{"pruned_tool_call_ids": ["c1"]}"#.into())),
        ));
        assert!(engine.on_idle("ses_1"));
        assert!(engine.scheduler().take("ses_1").unwrap().join().await);
        let state = engine.store().snapshot("ses_1").unwrap();
        assert!(state.prune.is_tool_pruned("c1"));
    }

    /// Answers `c1` after a delay on the first call, nothing afterwards.
    struct SlowJudge {
        calls: AtomicUsize,
    }

    impl Judge for SlowJudge {
        fn complete<'a>(&'a self, _: &'a str, _: &'a str, _: u32) -> JudgeFuture<'a> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if call == 0 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(r#"{"pruned_tool_call_ids": ["c1"]}"#.to_string())
                } else {
                    Ok(r#"{"pruned_tool_call_ids": []}"#.to_string())
                }
            })
        }
    }

    #[tokio::test]
    async fn idle_trigger_during_a_run_is_dropped() {
        let host = host();
        let mut config = PruneConfig::default();
        config.strategies.on_idle = vec!["semantic".into()];
        let judge = Arc::new(SlowJudge {
            calls: AtomicUsize::new(0),
        });
        let engine = Arc::new(PruningEngine::new(
            config,
            Arc::new(host.clone()),
            Arc::clone(&judge) as Arc<dyn Judge>,
        ));

        assert!(engine.on_idle("ses_1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!engine.on_idle("ses_1"));

        assert!(engine.scheduler().take("ses_1").unwrap().join().await);
        assert!(engine.store().snapshot("ses_1").unwrap().prune.is_tool_pruned("c1"));
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_is_off_by_default() {
        let engine = engine(&host(), "{}");
        assert!(!engine.on_idle("ses_1"));
    }

    #[tokio::test]
    async fn commands_toggle_manual_mode() {
        let host = host();
        let engine = engine(&host, "{}");
        let out = engine.handle_command("ses_1", "/dcp manual on").await.unwrap();
        assert!(out.text().starts_with("Manual mode is on"));
        assert!(engine.system_prompt_addition("ses_1").is_none());
        assert!(engine.handle_command("ses_1", "hello").await.is_none());

        let mut msgs = transcript();
        engine.on_messages_transform("ses_1", &mut msgs, None).await;
        assert_eq!(msgs.len(), 2);
    }

    #[tokio::test]
    async fn persists_and_restores_across_engines() {
        let dir = tempfile::tempdir().unwrap();
        let host = host();
        let first = Arc::new(
            PruningEngine::new(
                PruneConfig::default(),
                Arc::new(host.clone()),
                Arc::new(ScriptedJudge("{}".into())),
            )
            .with_persistence(SessionPersistence::new(dir.path())),
        );
        first.prune_tools("ses_1", &["c3".into()]).await.unwrap();

        let second = PruningEngine::new(
            PruneConfig::default(),
            Arc::new(host.clone()),
            Arc::new(ScriptedJudge("{}".into())),
        )
        .with_persistence(SessionPersistence::new(dir.path()));
        let mut msgs = transcript();
        second.on_messages_transform("ses_1", &mut msgs, None).await;
        let state = second.store().snapshot("ses_1").unwrap();
        assert_eq!(state.prune.tools.get("c3"), Some(&7));
    }
}
