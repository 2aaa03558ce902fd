//! Model-in-the-loop pruning.
//!
//! A run collects the eligible tool calls (finished, not yet redacted, not
//! protected, not the most recent call), asks the [`Judge`](judge::Judge)
//! which of them are obsolete, validates the reply against the
//! [`JudgeVerdict`](verdict::JudgeVerdict) schema, and keeps only ids that
//! were on the eligible list. Nothing in the session changes unless the whole
//! round trip succeeds.
//!
//! At most one run per session is in flight. A trigger that arrives while
//! one is running is dropped, not queued.

pub mod judge;
pub mod prompt;
pub mod verdict;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::PruneConfig;
use crate::error::Result;
use crate::state::store::SessionStore;
use crate::state::{PruneOrigin, PruneSource, SessionState};
use crate::strategies::{ToolCallRecord, collect_tool_calls};
use crate::{DEFAULT_MODEL, Message, short_id};
use judge::Judge;
use verdict::{filter_verdict, parse_verdict};

/// Outcome of a semantic run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemanticRun {
    Applied(SemanticOutcome),
    /// There was nothing the judge could choose from.
    NothingEligible,
    /// Another run for the same session was already in flight.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SemanticOutcome {
    pub model: String,
    /// Ids newly redacted by this run.
    pub pruned: Vec<String>,
    /// Ids the judge returned that were not eligible.
    pub rejected: Vec<String>,
    pub reasoning: String,
    pub bytes_freed: u64,
}

/// Removes the session from the in-flight set when dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, session_id: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string());
        inserted.then(|| Self {
            set: Arc::clone(set),
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.session_id);
    }
}

/// Tool calls the judge may choose from.
pub fn eligible_calls(
    state: &SessionState,
    config: &PruneConfig,
    messages: &[Message],
) -> Vec<ToolCallRecord> {
    let mut records = collect_tool_calls(state, messages);
    records.pop();
    records.retain(|r| {
        !state.prune.is_tool_pruned(&r.call_id) && !config.is_protected(&r.tool, &[])
    });
    records
}

/// Judge model: configured model, else the session's model, else the default.
pub fn select_model(config: &PruneConfig, state: Option<&SessionState>) -> String {
    config
        .semantic
        .model
        .clone()
        .or_else(|| {
            let model = &state?.model;
            match (&model.provider_id, &model.model_id) {
                (Some(p), Some(m)) if !m.contains('/') => Some(format!("{p}/{m}")),
                (_, Some(m)) => Some(m.clone()),
                _ => None,
            }
        })
        .unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

#[derive(Clone)]
pub struct SemanticPruner {
    store: SessionStore,
    judge: Arc<dyn Judge>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SemanticPruner {
    pub fn new(store: SessionStore, judge: Arc<dyn Judge>) -> Self {
        Self {
            store,
            judge,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_in_flight(&self, session_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(session_id)
    }

    /// Run one semantic decision for `session_id` over `messages`.
    ///
    /// Judge and verdict failures are returned without touching state.
    pub async fn run(
        &self,
        session_id: &str,
        messages: &[Message],
        config: &PruneConfig,
    ) -> Result<SemanticRun> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, session_id) else {
            debug!("Semantic run already in flight for {}, dropping trigger", short_id(session_id));
            return Ok(SemanticRun::Dropped);
        };

        let Some((eligible, redacted, model)) = self.store.read(session_id, |s| {
            (
                eligible_calls(s, config, messages),
                s.prune.tools.clone(),
                select_model(config, Some(s)),
            )
        }) else {
            return Ok(SemanticRun::NothingEligible);
        };
        if eligible.is_empty() {
            return Ok(SemanticRun::NothingEligible);
        }

        let eligible_ids: Vec<String> = eligible.iter().map(|r| r.call_id.clone()).collect();
        let prompt = prompt::build_analysis_prompt(
            &eligible_ids,
            messages,
            &redacted,
            &config.protected_tools,
        );

        info!(
            "Semantic analysis for {}: {} eligible call(s), model {}",
            short_id(session_id),
            eligible_ids.len(),
            model
        );
        let raw = self
            .judge
            .complete(&model, &prompt, config.semantic.max_tokens)
            .await?;
        let verdict = parse_verdict(&raw)?;
        let (accepted, rejected) = filter_verdict(&verdict, &eligible_ids);
        if !rejected.is_empty() {
            warn!("Judge returned {} ineligible id(s), ignoring them", rejected.len());
        }

        let by_id: HashMap<&str, &ToolCallRecord> =
            eligible.iter().map(|r| (r.call_id.as_str(), r)).collect();
        let applied = self
            .store
            .with_session(session_id, |s| {
                let mut pruned = Vec::new();
                let mut bytes = 0;
                for id in &accepted {
                    let Some(record) = by_id.get(id.as_str()) else {
                        continue;
                    };
                    let origin = PruneOrigin {
                        source: PruneSource::Semantic,
                        origin_message_id: record.message_id.clone(),
                    };
                    if s.prune.mark_tool(id, record.size, origin) {
                        pruned.push(id.clone());
                        bytes += record.size;
                    }
                }
                (pruned, bytes)
            })
            .unwrap_or_default();

        info!(
            "Semantic analysis pruned {} call(s) for {}",
            applied.0.len(),
            short_id(session_id)
        );
        Ok(SemanticRun::Applied(SemanticOutcome {
            model,
            pruned: applied.0,
            rejected,
            reasoning: verdict.reasoning,
            bytes_freed: applied.1,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Part;
    use crate::error::PruneError;
    use crate::semantic::judge::JudgeFuture;
    use serde_json::json;

    struct FixedJudge(std::result::Result<String, String>);

    impl Judge for FixedJudge {
        fn complete<'a>(&'a self, _: &'a str, _: &'a str, _: u32) -> JudgeFuture<'a> {
            let reply = self.0.clone().map_err(PruneError::Judge);
            Box::pin(async move { reply })
        }
    }

    fn transcript() -> Vec<Message> {
        vec![Message::assistant(
            "m1",
            1,
            vec![
                Part::StepStart,
                Part::tool("a", "read", json!({"filePath": "x"}), "aaaa"),
                Part::tool("b", "grep", json!({"pattern": "y"}), "bb"),
                Part::tool("t", "task", json!({}), "sub-agent result"),
                Part::tool("last", "bash", json!({}), "latest"),
            ],
        )]
    }

    fn pruner(reply: std::result::Result<&str, &str>) -> (SessionStore, SemanticPruner) {
        let store = SessionStore::new();
        store.create("s", false);
        let judge = FixedJudge(reply.map(str::to_string).map_err(str::to_string));
        let pruner = SemanticPruner::new(store.clone(), Arc::new(judge));
        (store, pruner)
    }

    #[test]
    fn eligible_excludes_protected_pruned_and_latest() {
        let mut state = SessionState::new("s");
        state.prune.tools.insert("b".into(), 2);
        let ids: Vec<_> = eligible_calls(&state, &PruneConfig::default(), &transcript())
            .into_iter()
            .map(|r| r.call_id)
            .collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn model_selection_order() {
        let config = PruneConfig::default();
        assert_eq!(select_model(&config, None), DEFAULT_MODEL);

        let mut state = SessionState::new("s");
        state.model.provider_id = Some("anthropic".into());
        state.model.model_id = Some("claude-sonnet-4".into());
        assert_eq!(select_model(&config, Some(&state)), "anthropic/claude-sonnet-4");

        let config = config.with_semantic_model("openai/gpt-5-mini");
        assert_eq!(select_model(&config, Some(&state)), "openai/gpt-5-mini");
    }

    #[tokio::test]
    async fn applies_only_eligible_ids() {
        let (store, pruner) =
            pruner(Ok(r#"{"pruned_tool_call_ids": ["a", "z", "t", "last"], "reasoning": "stale"}"#));
        let run = pruner.run("s", &transcript(), &PruneConfig::default()).await.unwrap();

        let SemanticRun::Applied(outcome) = run else {
            panic!("expected applied run");
        };
        assert_eq!(outcome.pruned, vec!["a"]);
        assert_eq!(outcome.rejected, vec!["z", "t", "last"]);
        assert_eq!(outcome.reasoning, "stale");
        assert_eq!(outcome.bytes_freed, 4);

        let state = store.snapshot("s").unwrap();
        assert_eq!(state.prune.tools.len(), 1);
        assert_eq!(state.prune.origins["a"].source, PruneSource::Semantic);
        assert!(!pruner.is_in_flight("s"));
    }

    #[tokio::test]
    async fn judge_failure_leaves_state_untouched() {
        let (store, pruner) = pruner(Err("timeout"));
        let err = pruner.run("s", &transcript(), &PruneConfig::default()).await;
        assert!(matches!(err, Err(PruneError::Judge(_))));
        assert!(store.snapshot("s").unwrap().prune.tools.is_empty());
        assert!(!pruner.is_in_flight("s"));
    }

    #[tokio::test]
    async fn malformed_verdict_leaves_state_untouched() {
        let (store, pruner) = pruner(Ok(r#"{"ids": ["a"]}"#));
        let err = pruner.run("s", &transcript(), &PruneConfig::default()).await;
        assert!(matches!(err, Err(PruneError::JudgeResponse(_))));
        assert!(store.snapshot("s").unwrap().prune.tools.is_empty());
    }

    #[tokio::test]
    async fn concurrent_trigger_is_dropped() {
        let (_, pruner) = pruner(Ok(r#"{"pruned_tool_call_ids": []}"#));
        let _held = InFlightGuard::acquire(&pruner.in_flight, "s").unwrap();
        let run = pruner.run("s", &transcript(), &PruneConfig::default()).await.unwrap();
        assert_eq!(run, SemanticRun::Dropped);
    }

    #[tokio::test]
    async fn nothing_eligible_skips_judge() {
        let (_, pruner) = pruner(Err("must not be called"));
        let msgs = vec![Message::assistant(
            "m",
            1,
            vec![Part::tool("only", "read", json!({}), "x")],
        )];
        let run = pruner.run("s", &msgs, &PruneConfig::default()).await.unwrap();
        assert_eq!(run, SemanticRun::NothingEligible);
    }
}
