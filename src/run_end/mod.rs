//! Run-end pipeline (spec.md §4.8): `learn_update` consolidation gated on
//! accumulated suggestions, and an opt-in `why_trace` pass that cites the
//! minimal supporting claim set for the run's final decision.
//!
//! Grounded on `src/agent/activity_log.rs`'s end-of-session summary write
//! and `original_source/mi/why.py` for the candidate-gathering + minimal-
//! subset-selection shape.

use crate::config::RunEndConfig;
use crate::mind::{record_mind_failure, MindCallState, MindMediator};
use crate::memory_recall::MemoryBackend;
use crate::store::{EdgeType, EvidenceKind, EvidenceLog, EvidenceRecord, MinedOutput, ThoughtDbStore, Visibility};
use anyhow::Result;
use serde::Deserialize;
use std::collections::HashSet;

const LEARNED_PREFERENCE_TAG: &str = "mi:learned_preference";

#[derive(Debug, Clone, Default)]
pub struct RunEndResult {
    pub learn_update_ran: bool,
    pub learn_update_applied: bool,
    pub written_claims: usize,
    pub retracted_claims: usize,
    pub why_trace_ran: bool,
    pub why_trace_edges: usize,
}

pub struct RunEndContext<'a> {
    pub mediator: &'a MindMediator,
    pub batch_id: &'a str,
    pub thread_id: &'a str,
    pub project_id: &'a str,
    pub config: &'a RunEndConfig,
    pub evidence_log: &'a EvidenceLog,
    pub thoughtdb_store: &'a ThoughtDbStore,
    pub memory: Option<&'a dyn MemoryBackend>,
    pub allowed_event_ids: &'a HashSet<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LearnUpdateResponse {
    #[serde(default)]
    new_claims: Vec<crate::store::MinedClaim>,
    #[serde(default)]
    retract_claim_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WhyTraceResponse {
    #[serde(default)]
    chosen_claim_ids: Vec<String>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    rationale: Option<String>,
}

/// Run both run-end steps and flush best-effort memory ingestion. Neither
/// step's failure should abort the other (spec.md §5: memory-index updates
/// are best-effort and must not raise).
pub async fn run_end_pipeline(ctx: &RunEndContext<'_>, run_summary_text: &str) -> Result<RunEndResult> {
    let mut result = RunEndResult::default();

    match maybe_learn_update(ctx, run_summary_text).await {
        Ok(Some(outcome)) => {
            result.learn_update_ran = true;
            result.learn_update_applied = outcome.applied;
            result.written_claims = outcome.written_claims;
            result.retracted_claims = outcome.retracted_claims;
        }
        Ok(None) => {}
        Err(e) => {
            ctx.evidence_log.append(EvidenceRecord::new(
                ctx.batch_id,
                ctx.thread_id,
                EvidenceKind::StateWarning { component: "run_end.learn_update".to_string(), message: e.to_string() },
            ))?;
        }
    }

    if ctx.config.why_trace_enabled {
        match run_why_trace(ctx).await {
            Ok(edges) => {
                result.why_trace_ran = true;
                result.why_trace_edges = edges;
            }
            Err(e) => {
                ctx.evidence_log.append(EvidenceRecord::new(
                    ctx.batch_id,
                    ctx.thread_id,
                    EvidenceKind::StateWarning { component: "run_end.why_trace".to_string(), message: e.to_string() },
                ))?;
            }
        }
    }

    if let Some(memory) = ctx.memory {
        if !run_summary_text.trim().is_empty() {
            memory.ingest_snapshot(ctx.project_id, run_summary_text).await.ok();
        }
    }

    Ok(result)
}

struct LearnUpdateOutcome {
    applied: bool,
    written_claims: usize,
    retracted_claims: usize,
}

/// Gate: `≥ min_new_suggestions_per_run` accumulated `learn_suggested`
/// records *and* `≥ min_active_learned_claims` mi-tagged preference claims
/// must already exist (spec.md §4.8).
async fn maybe_learn_update(ctx: &RunEndContext<'_>, run_summary_text: &str) -> Result<Option<LearnUpdateOutcome>> {
    let records = ctx.evidence_log.iter()?;
    let suggestion_count = records.iter().filter(|r| matches!(r.kind, EvidenceKind::LearnSuggested { .. })).count();
    if suggestion_count < ctx.config.min_new_suggestions_per_run {
        return Ok(None);
    }

    let project_view = ctx.thoughtdb_store.project.load_view()?;
    let active_learned = project_view.claims_tagged(LEARNED_PREFERENCE_TAG).len();
    if active_learned < ctx.config.min_active_learned_claims {
        return Ok(None);
    }

    let prompt = format!(
        "Run summary:\n\n{run_summary_text}\n\n{suggestion_count} preference suggestions accumulated this run. \
         Propose a bounded patch: at most {} new claims, at most {} retractions, minimum confidence {:.2}.",
        ctx.config.max_claims, ctx.config.max_retracts, ctx.config.min_confidence
    );
    let outcome = ctx.mediator.call("learn_update", &prompt, "learn_update", ctx.batch_id).await;
    let (resp, state) = match (outcome.state, outcome.value) {
        (MindCallState::Ok, Some(v)) => match serde_json::from_value::<LearnUpdateResponse>(v) {
            Ok(r) => (r, MindCallState::Ok),
            Err(_) => {
                record_mind_failure(
                    ctx.evidence_log, ctx.batch_id, ctx.thread_id, "learn_update", "learn_update",
                    MindCallState::Error, &outcome.transcript_path, Some("response did not match schema".to_string()),
                )?;
                (LearnUpdateResponse::default(), MindCallState::Error)
            }
        },
        (state, _) => {
            record_mind_failure(ctx.evidence_log, ctx.batch_id, ctx.thread_id, "learn_update", "learn_update", state, &outcome.transcript_path, outcome.error)?;
            (LearnUpdateResponse::default(), state)
        }
    };

    if state != MindCallState::Ok {
        ctx.evidence_log.append(EvidenceRecord::new(
            ctx.batch_id,
            ctx.thread_id,
            EvidenceKind::LearnUpdate {
                input_summary: run_summary_text.to_string(),
                output: serde_json::json!({}),
                applied: false,
            },
        ))?;
        return Ok(Some(LearnUpdateOutcome { applied: false, written_claims: 0, retracted_claims: 0 }));
    }

    let mut new_claims = resp.new_claims.clone();
    new_claims.retain(|c| c.confidence >= ctx.config.min_confidence);
    new_claims.truncate(ctx.config.max_claims);
    let mined = MinedOutput { claims: new_claims, edges: vec![] };
    let mine_outcome =
        ctx.thoughtdb_store.apply_mined_output(&mined, ctx.allowed_event_ids, ctx.config.min_confidence, ctx.config.max_claims)?;

    let mut retracted = 0usize;
    for claim_id in resp.retract_claim_ids.iter().take(ctx.config.max_retracts) {
        if project_view.claims_by_id.contains_key(claim_id) {
            ctx.thoughtdb_store.project.append_claim_retract(claim_id)?;
            retracted += 1;
        } else {
            ctx.thoughtdb_store.global.append_claim_retract(claim_id)?;
            retracted += 1;
        }
    }

    let applied = !mine_outcome.written.is_empty() || retracted > 0;
    ctx.evidence_log.append(EvidenceRecord::new(
        ctx.batch_id,
        ctx.thread_id,
        EvidenceKind::LearnUpdate {
            input_summary: run_summary_text.to_string(),
            output: serde_json::to_value(&mine_outcome)?,
            applied,
        },
    ))?;

    Ok(Some(LearnUpdateOutcome { applied, written_claims: mine_outcome.written.len(), retracted_claims: retracted }))
}

/// `why_trace` (opt-in, spec.md §4.8): pick the last `decide_next`/`evidence`
/// event, gather up to `top_k` candidate claims via memory recall + direct
/// citation, ask Mind for the minimal supporting subset, and materialize
/// `depends_on` edges above the confidence threshold.
async fn run_why_trace(ctx: &RunEndContext<'_>) -> Result<usize> {
    let records = ctx.evidence_log.iter()?;
    let target = records
        .iter()
        .rev()
        .find(|r| matches!(r.kind, EvidenceKind::DecideNext { .. } | EvidenceKind::Evidence { .. }));
    let target = match target {
        Some(t) => t,
        None => return Ok(0),
    };
    let target_event_id = match &target.event_id {
        Some(id) => id.clone(),
        None => return Ok(0),
    };

    let project_view = ctx.thoughtdb_store.project.load_view()?;
    let mut candidates: Vec<(String, String)> = project_view
        .claims_by_id
        .iter()
        .filter(|(_, c)| c.source_refs.contains(&target_event_id))
        .map(|(id, c)| (id.clone(), c.text.clone()))
        .collect();

    if let Some(memory) = ctx.memory {
        let query = describe_target(target);
        if let Ok(recalled) = memory.recall(&query, ctx.config.why_trace_top_k).await {
            for item in recalled {
                if candidates.len() >= ctx.config.why_trace_top_k {
                    break;
                }
                candidates.push((item.project_id.clone(), item.text));
            }
        }
    }
    candidates.truncate(ctx.config.why_trace_top_k);
    if candidates.is_empty() {
        return Ok(0);
    }

    let candidates_text = candidates.iter().map(|(id, text)| format!("- {id}: {text}")).collect::<Vec<_>>().join("\n");
    let prompt = format!(
        "Decision under review:\n{}\n\nCandidate supporting claims:\n{candidates_text}\n\n\
         Choose the minimal subset that actually supports this decision.",
        describe_target(target)
    );

    let outcome = ctx.mediator.call("why_trace", &prompt, "why_trace", ctx.batch_id).await;
    let resp = match (outcome.state, outcome.value) {
        (MindCallState::Ok, Some(v)) => match serde_json::from_value::<WhyTraceResponse>(v) {
            Ok(r) => r,
            Err(_) => {
                record_mind_failure(
                    ctx.evidence_log, ctx.batch_id, ctx.thread_id, "why_trace", "why_trace",
                    MindCallState::Error, &outcome.transcript_path, Some("response did not match schema".to_string()),
                )?;
                return Ok(0);
            }
        },
        (state, _) => {
            record_mind_failure(ctx.evidence_log, ctx.batch_id, ctx.thread_id, "why_trace", "why_trace", state, &outcome.transcript_path, outcome.error)?;
            return Ok(0);
        }
    };

    if resp.confidence < ctx.config.why_trace_confidence_threshold || !ctx.config.why_trace_write_edges {
        return Ok(0);
    }

    let known_ids: HashSet<&String> = candidates.iter().map(|(id, _)| id).collect();
    let mut written = 0usize;
    for claim_id in &resp.chosen_claim_ids {
        if !known_ids.contains(claim_id) {
            continue;
        }
        ctx.thoughtdb_store.project.append_edge(EdgeType::DependsOn, &target_event_id, claim_id, Visibility::Project, vec![target_event_id.clone()])?;
        written += 1;
    }
    Ok(written)
}

fn describe_target(record: &EvidenceRecord) -> String {
    match &record.kind {
        EvidenceKind::DecideNext { next_action, status, notes, .. } => {
            format!("decide_next -> {next_action} (status={status}){}", notes.as_deref().map(|n| format!(": {n}")).unwrap_or_default())
        }
        EvidenceKind::Evidence { facts, .. } => format!("evidence: {}", facts.join("; ")),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ClaimType, Scope};

    fn store_in_tempdir() -> (ThoughtDbStore, EvidenceLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ThoughtDbStore::new("p1", dir.path().join("project/thoughtdb"), dir.path().join("global/thoughtdb"));
        let log = EvidenceLog::new(dir.path().join("evidence.jsonl"));
        (store, log, dir)
    }

    fn mediator_in_tempdir(dir: &std::path::Path) -> MindMediator {
        let provider = crate::mind::provider::AnthropicProvider::new("claude".into(), "unused".into(), 1).unwrap();
        MindMediator::new(Box::new(provider), dir.join("transcripts"))
    }

    #[tokio::test]
    async fn learn_update_is_skipped_below_suggestion_threshold() {
        let (store, log, dir) = store_in_tempdir();
        let mediator = mediator_in_tempdir(dir.path());
        let config = RunEndConfig { min_new_suggestions_per_run: 3, ..RunEndConfig::default() };
        let allowed = HashSet::new();
        let ctx = RunEndContext {
            mediator: &mediator,
            batch_id: "b5",
            thread_id: "t1",
            project_id: "p1",
            config: &config,
            evidence_log: &log,
            thoughtdb_store: &store,
            memory: None,
            allowed_event_ids: &allowed,
        };
        let result = run_end_pipeline(&ctx, "run summary").await.unwrap();
        assert!(!result.learn_update_ran);
    }

    #[tokio::test]
    async fn why_trace_noop_when_disabled() {
        let (store, log, dir) = store_in_tempdir();
        let mediator = mediator_in_tempdir(dir.path());
        let config = RunEndConfig { why_trace_enabled: false, ..RunEndConfig::default() };
        let allowed = HashSet::new();
        let ctx = RunEndContext {
            mediator: &mediator,
            batch_id: "b5",
            thread_id: "t1",
            project_id: "p1",
            config: &config,
            evidence_log: &log,
            thoughtdb_store: &store,
            memory: None,
            allowed_event_ids: &allowed,
        };
        let result = run_end_pipeline(&ctx, "run summary").await.unwrap();
        assert!(!result.why_trace_ran);
    }

    #[tokio::test]
    async fn why_trace_returns_zero_when_no_decide_or_evidence_events_exist() {
        let (store, log, dir) = store_in_tempdir();
        let _ = store.project.append_claim_create(ClaimType::Fact, "x", Visibility::Project, None, None, vec![], vec!["ev_1".into()], 0.9, String::new());
        let mediator = mediator_in_tempdir(dir.path());
        let config = RunEndConfig { why_trace_enabled: true, ..RunEndConfig::default() };
        let allowed = HashSet::new();
        let ctx = RunEndContext {
            mediator: &mediator,
            batch_id: "b5",
            thread_id: "t1",
            project_id: "p1",
            config: &config,
            evidence_log: &log,
            thoughtdb_store: &store,
            memory: None,
            allowed_event_ids: &allowed,
        };
        let edges = run_why_trace(&ctx).await.unwrap();
        assert_eq!(edges, 0);
        let _ = Scope::Project;
    }
}
