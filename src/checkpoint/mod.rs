//! Checkpoint + mining pipeline (spec.md §4.7): fires after a batch when
//! `checkpoint_decide` permits, materializes a snapshot, and conditionally
//! mines workflows/preferences/claims and deterministic nodes from the
//! segment buffer.
//!
//! Grounded on `src/agent/reflection.rs` (periodic Mind-style review of
//! recent activity gated by a decision call) and
//! `original_source/mi/runtime/autopilot/checkpoint.py` for the exact
//! occurrence-count thresholds and at-most-once key.

use crate::mind::{record_mind_failure, MindCallState, MindMediator};
use crate::signature::normalize_text;
use crate::store::{
    ClaimType, EdgeType, EvidenceKind, EvidenceLog, EvidenceRecord, NodeType, SegmentRecord, SegmentState, ThoughtDb,
    ThoughtDbStore, Visibility,
};
use crate::workflow::{Workflow, WorkflowRegistry, WorkflowStep, WorkflowTrigger, TriggerMode};
use crate::config::MiningConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// `(batch_id, checkpoint_kind)` joined key, stored on
/// `ProjectOverlay::last_checkpoint_key` by the caller for at-most-once
/// gating (spec.md §4.7).
pub fn checkpoint_key(batch_id: &str, checkpoint_kind: &str) -> String {
    format!("{batch_id}:{checkpoint_kind}")
}

const MAX_BULLETS_PER_SECTION: usize = 20;

/// Compose the snapshot text from segment records, grouped by kind into
/// bullet sections, each deduplicated and capped (spec.md §4.7 step 1).
pub fn build_snapshot_text(records: &[SegmentRecord]) -> String {
    let sections: [(&str, &str); 7] = [
        ("facts", "Facts"),
        ("actions", "Actions"),
        ("results", "Results"),
        ("unknowns", "Unknowns"),
        ("risk", "Risk"),
        ("recall", "Recall"),
        ("workflow", "Workflows"),
    ];
    let mut buckets: HashMap<&str, Vec<String>> = HashMap::new();
    for record in records {
        let bucket = sections.iter().map(|(k, _)| *k).find(|k| record.kind.contains(k)).unwrap_or("facts");
        let entry = buckets.entry(bucket).or_default();
        if !entry.contains(&record.summary) {
            entry.push(record.summary.clone());
        }
    }

    let mut out = String::new();
    for (key, label) in sections {
        if let Some(lines) = buckets.get(key) {
            if lines.is_empty() {
                continue;
            }
            out.push_str(&format!("{label}:\n"));
            for line in lines.iter().take(MAX_BULLETS_PER_SECTION) {
                out.push_str(&format!("- {line}\n"));
            }
        }
    }
    out
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CheckpointDecideResponse {
    should_checkpoint: bool,
    #[serde(default)]
    checkpoint_kind: Option<String>,
    #[serde(default)]
    status_hint: Option<String>,
    #[serde(default)]
    should_mine_workflow: bool,
    #[serde(default)]
    should_mine_preferences: bool,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SuggestWorkflowResponse {
    #[serde(default)]
    should_suggest: bool,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    trigger_pattern: Option<String>,
    #[serde(default)]
    steps: Vec<WorkflowStep>,
    #[serde(default)]
    allow_single_if_high_benefit: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct MinedPreference {
    scope: String,
    text: String,
    #[serde(default)]
    tag: Option<String>,
    confidence: f64,
    #[serde(default)]
    source_event_ids: Vec<String>,
    #[serde(default)]
    auto_learn: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MinePreferencesResponse {
    #[serde(default)]
    preferences: Vec<MinedPreference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WorkflowCandidates {
    #[serde(default)]
    occurrences: HashMap<String, u32>,
}

impl WorkflowCandidates {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, path: &Path) -> Result<()> {
        crate::store::atomic_write_json(path, self)
    }

    fn bump(&mut self, signature: &str) -> u32 {
        let count = self.occurrences.entry(signature.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PreferenceCandidates {
    #[serde(default)]
    occurrences: HashMap<String, u32>,
}

impl PreferenceCandidates {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, path: &Path) -> Result<()> {
        crate::store::atomic_write_json(path, self)
    }

    fn bump(&mut self, signature: &str) -> u32 {
        let count = self.occurrences.entry(signature.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

fn workflow_signature(name: &str, trigger_pattern: &str, steps: &[WorkflowStep]) -> String {
    let steps_part = steps.iter().map(|s| normalize_text(&s.description)).collect::<Vec<_>>().join(";");
    sha256_hex(&format!("{}|{}|{}", normalize_text(name), normalize_text(trigger_pattern), steps_part))
}

fn preference_signature(scope: &str, text: &str) -> String {
    sha256_hex(&format!("{}|{}", scope, normalize_text(text)))
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointResult {
    pub attempted: bool,
    pub checkpointed: bool,
    pub checkpoint_kind: Option<String>,
    pub mined_workflow_id: Option<String>,
    pub mined_claims: usize,
    pub mined_node_ids: Vec<String>,
    pub learn_suggested_events: usize,
}

/// Everything the checkpoint pipeline needs; grouped to keep the entry
/// point's argument list manageable (spec.md §9's "explicit state" design
/// note applies here too).
pub struct CheckpointContext<'a> {
    pub mediator: &'a MindMediator,
    pub batch_id: &'a str,
    pub thread_id: &'a str,
    pub mining: &'a MiningConfig,
    pub evidence_log: &'a EvidenceLog,
    pub thoughtdb_store: &'a ThoughtDbStore,
    pub workflow_registry: &'a WorkflowRegistry,
    pub candidates_dir: &'a Path,
    pub allowed_event_ids: &'a HashSet<String>,
}

/// Run the full checkpoint pipeline for one batch (spec.md §4.7). Returns
/// early with `attempted=false` when no mining feature is enabled, or with
/// `checkpointed=false` when `checkpoint_decide` declines or the breaker is
/// open/errored.
pub async fn run_checkpoint_pipeline(
    ctx: CheckpointContext<'_>,
    segment: &mut SegmentState,
    last_checkpoint_key: Option<&str>,
) -> Result<CheckpointResult> {
    let mut result = CheckpointResult::default();
    let any_mining_enabled =
        ctx.mining.wf_auto_mine || ctx.mining.pref_auto_mine || ctx.mining.tdb_auto_mine || ctx.mining.tdb_auto_nodes;
    if !any_mining_enabled {
        return Ok(result);
    }
    result.attempted = true;

    let snapshot_text = build_snapshot_text(&segment.records);
    let decide_prompt = format!("Recent activity since the last checkpoint:\n\n{snapshot_text}");
    let outcome = ctx.mediator.call("checkpoint_decide", &decide_prompt, "checkpoint_decide", ctx.batch_id).await;
    let decision = match (outcome.state, outcome.value) {
        (MindCallState::Ok, Some(value)) => match serde_json::from_value::<CheckpointDecideResponse>(value) {
            Ok(d) => d,
            Err(_) => {
                record_mind_failure(
                    ctx.evidence_log, ctx.batch_id, ctx.thread_id, "checkpoint_decide", "checkpoint_decide",
                    MindCallState::Error, &outcome.transcript_path, Some("response did not match schema".to_string()),
                )?;
                return Ok(result);
            }
        },
        (state, _) => {
            record_mind_failure(ctx.evidence_log, ctx.batch_id, ctx.thread_id, "checkpoint_decide", "checkpoint_decide", state, &outcome.transcript_path, outcome.error)?;
            return Ok(result);
        }
    };

    if !decision.should_checkpoint {
        return Ok(result);
    }

    let checkpoint_kind = decision.checkpoint_kind.clone().unwrap_or_else(|| "generic".to_string());
    let key = checkpoint_key(ctx.batch_id, &checkpoint_kind);
    if last_checkpoint_key == Some(key.as_str()) {
        return Ok(result);
    }

    result.checkpointed = true;
    result.checkpoint_kind = Some(checkpoint_kind.clone());

    ctx.evidence_log.append(EvidenceRecord::new(
        ctx.batch_id,
        ctx.thread_id,
        EvidenceKind::Snapshot {
            checkpoint_kind: checkpoint_kind.clone(),
            status_hint: decision.status_hint.clone(),
            tags: decision.tags.clone(),
            text: snapshot_text.clone(),
            source_refs: ctx.allowed_event_ids.iter().cloned().collect(),
        },
    ))?;

    if decision.should_mine_workflow && ctx.mining.wf_auto_mine {
        result.mined_workflow_id = mine_workflow(&ctx, &snapshot_text).await?;
    }

    if decision.should_mine_preferences && ctx.mining.pref_auto_mine {
        result.learn_suggested_events = mine_preferences(&ctx, &snapshot_text).await?;
    }

    if ctx.mining.tdb_auto_mine {
        result.mined_claims = mine_claims(&ctx, &snapshot_text).await?;
    }

    if ctx.mining.tdb_auto_nodes {
        result.mined_node_ids = materialize_nodes(&ctx.thoughtdb_store.project, &segment.records)?;
    }

    // spec.md §4.7 step 6 / §3 lifecycle: the buffer is flushed and cleared
    // on checkpoint so the next checkpoint doesn't re-snapshot and re-mine
    // records already captured here.
    segment.clear();

    Ok(result)
}

async fn mine_workflow(ctx: &CheckpointContext<'_>, snapshot_text: &str) -> Result<Option<String>> {
    let prompt = format!("Recent activity:\n\n{snapshot_text}\n\nShould this be captured as a reusable workflow?");
    let outcome = ctx.mediator.call("suggest_workflow", &prompt, "suggest_workflow", ctx.batch_id).await;
    let resp = match (outcome.state, outcome.value) {
        (MindCallState::Ok, Some(v)) => match serde_json::from_value::<SuggestWorkflowResponse>(v) {
            Ok(r) => r,
            Err(_) => {
                record_mind_failure(
                    ctx.evidence_log, ctx.batch_id, ctx.thread_id, "suggest_workflow", "suggest_workflow",
                    MindCallState::Error, &outcome.transcript_path, Some("response did not match schema".to_string()),
                )?;
                return Ok(None);
            }
        },
        (state, _) => {
            record_mind_failure(ctx.evidence_log, ctx.batch_id, ctx.thread_id, "suggest_workflow", "suggest_workflow", state, &outcome.transcript_path, outcome.error)?;
            return Ok(None);
        }
    };
    if !resp.should_suggest {
        return Ok(None);
    }
    let name = resp.name.unwrap_or_else(|| "Untitled workflow".to_string());
    let pattern = resp.trigger_pattern.unwrap_or_default();
    if pattern.trim().is_empty() {
        return Ok(None);
    }
    let signature = workflow_signature(&name, &pattern, &resp.steps);

    let candidates_path = ctx.candidates_dir.join("workflows.json");
    let mut candidates = WorkflowCandidates::load(&candidates_path)?;
    let occurrences = candidates.bump(&signature);
    candidates.save(&candidates_path)?;

    let high_benefit = ctx.mining.allow_single_if_high_benefit && resp.allow_single_if_high_benefit;
    if occurrences < ctx.mining.min_occurrences && !high_benefit {
        return Ok(None);
    }

    let workflow = Workflow {
        workflow_id: crate::ids::new_workflow_id(),
        name,
        enabled: true,
        trigger: WorkflowTrigger { mode: TriggerMode::TaskContains, pattern },
        steps: resp.steps,
    };
    let workflow_id = workflow.workflow_id.clone();
    ctx.workflow_registry.save_project_workflow(&workflow)?;
    Ok(Some(workflow_id))
}

async fn mine_preferences(ctx: &CheckpointContext<'_>, snapshot_text: &str) -> Result<usize> {
    let prompt = format!("Recent activity:\n\n{snapshot_text}\n\nExtract any durable user preferences.");
    let outcome = ctx.mediator.call("mine_preferences", &prompt, "mine_preferences", ctx.batch_id).await;
    let resp = match (outcome.state, outcome.value) {
        (MindCallState::Ok, Some(v)) => match serde_json::from_value::<MinePreferencesResponse>(v) {
            Ok(r) => r,
            Err(_) => {
                record_mind_failure(
                    ctx.evidence_log, ctx.batch_id, ctx.thread_id, "mine_preferences", "mine_preferences",
                    MindCallState::Error, &outcome.transcript_path, Some("response did not match schema".to_string()),
                )?;
                return Ok(0);
            }
        },
        (state, _) => {
            record_mind_failure(ctx.evidence_log, ctx.batch_id, ctx.thread_id, "mine_preferences", "mine_preferences", state, &outcome.transcript_path, outcome.error)?;
            return Ok(0);
        }
    };
    if resp.preferences.is_empty() {
        return Ok(0);
    }

    let candidates_path = ctx.candidates_dir.join("preferences.json");
    let mut candidates = PreferenceCandidates::load(&candidates_path)?;
    let mut events_appended = 0usize;

    for pref in &resp.preferences {
        if pref.text.trim().is_empty() {
            continue;
        }
        let signature = preference_signature(&pref.scope, &pref.text);
        candidates.bump(&signature);

        let visibility = if pref.scope == "global" { Visibility::Global } else { Visibility::Project };
        let mut applied_claim_ids = Vec::new();

        if pref.auto_learn {
            let ev_ids: Vec<String> = pref
                .source_event_ids
                .iter()
                .filter(|id| ctx.allowed_event_ids.contains(*id))
                .cloned()
                .collect();
            let db = if pref.scope == "global" { &ctx.thoughtdb_store.global } else { &ctx.thoughtdb_store.project };
            let tags = pref.tag.clone().into_iter().collect();
            let claim_id = db.append_claim_create(
                ClaimType::Preference,
                &pref.text,
                visibility,
                None,
                None,
                tags,
                ev_ids,
                pref.confidence,
                "mined preference".to_string(),
            )?;
            applied_claim_ids.push(claim_id);
        }

        ctx.evidence_log.append(EvidenceRecord::new(
            ctx.batch_id,
            ctx.thread_id,
            EvidenceKind::LearnSuggested {
                source: "mine_preferences".to_string(),
                auto_learn: pref.auto_learn,
                learn_suggested: pref_as_value(pref),
                applied_claim_ids,
            },
        ))?;
        events_appended += 1;
    }

    candidates.save(&candidates_path)?;
    Ok(events_appended)
}

fn pref_as_value(pref: &MinedPreference) -> Value {
    serde_json::json!({
        "scope": pref.scope,
        "text": pref.text,
        "tag": pref.tag,
        "confidence": pref.confidence,
        "auto_learn": pref.auto_learn,
    })
}

async fn mine_claims(ctx: &CheckpointContext<'_>, snapshot_text: &str) -> Result<usize> {
    let prompt = format!("Recent activity:\n\n{snapshot_text}\n\nExtract atomic claims worth remembering.");
    let outcome = ctx.mediator.call("mine_claims", &prompt, "mine_claims", ctx.batch_id).await;
    let mined = match (outcome.state, outcome.value) {
        (MindCallState::Ok, Some(v)) => match serde_json::from_value::<crate::store::MinedOutput>(v) {
            Ok(m) => m,
            Err(_) => {
                record_mind_failure(
                    ctx.evidence_log, ctx.batch_id, ctx.thread_id, "mine_claims", "mine_claims",
                    MindCallState::Error, &outcome.transcript_path, Some("response did not match schema".to_string()),
                )?;
                return Ok(0);
            }
        },
        (state, _) => {
            record_mind_failure(ctx.evidence_log, ctx.batch_id, ctx.thread_id, "mine_claims", "mine_claims", state, &outcome.transcript_path, outcome.error)?;
            return Ok(0);
        }
    };
    let result = ctx.thoughtdb_store.apply_mined_output(&mined, ctx.allowed_event_ids, ctx.mining.min_confidence, ctx.mining.max_claims)?;
    Ok(result.written.len())
}

/// Deterministically materialize `decision | action | summary` nodes from
/// the segment buffer, no Mind call (spec.md §4.7 step 5).
fn materialize_nodes(project_db: &ThoughtDb, records: &[SegmentRecord]) -> Result<Vec<String>> {
    let mut buckets: HashMap<NodeType, Vec<&SegmentRecord>> = HashMap::new();
    for record in records {
        let node_type = classify_node_type(&record.kind);
        buckets.entry(node_type).or_default().push(record);
    }

    let mut node_ids = Vec::new();
    for (node_type, recs) in buckets {
        if recs.is_empty() {
            continue;
        }
        let title = match node_type {
            NodeType::Decision => "Decision summary",
            NodeType::Action => "Actions taken",
            NodeType::Summary => "Batch summary",
        };
        let text = recs.iter().map(|r| r.summary.as_str()).collect::<Vec<_>>().join("\n");
        let source_refs: Vec<String> = recs.iter().map(|r| r.event_id.clone()).collect();
        let node_id = project_db.append_node(node_type, title, &text, Visibility::Project, source_refs.clone())?;
        for event_id in &source_refs {
            project_db.append_edge(EdgeType::DerivedFrom, &node_id, event_id, Visibility::Project, vec![])?;
        }
        node_ids.push(node_id);
    }
    Ok(node_ids)
}

fn classify_node_type(kind: &str) -> NodeType {
    if kind.contains("decide") {
        NodeType::Decision
    } else if kind.contains("action") || kind.contains("hands") {
        NodeType::Action
    } else {
        NodeType::Summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(kind: &str, summary: &str, id: &str) -> SegmentRecord {
        SegmentRecord { event_id: id.to_string(), kind: kind.to_string(), summary: summary.to_string() }
    }

    #[test]
    fn build_snapshot_text_groups_and_dedupes_by_kind() {
        let records = vec![
            rec("evidence_fact", "uses postgres", "ev_1"),
            rec("evidence_fact", "uses postgres", "ev_2"),
            rec("evidence_action", "ran migration", "ev_3"),
        ];
        let text = build_snapshot_text(&records);
        assert_eq!(text.matches("uses postgres").count(), 1);
        assert!(text.contains("Facts:"));
        assert!(text.contains("Actions:"));
    }

    #[test]
    fn checkpoint_key_combines_batch_and_kind() {
        assert_eq!(checkpoint_key("b3", "routine"), "b3:routine");
    }

    #[test]
    fn classify_node_type_matches_kind_substrings() {
        assert_eq!(classify_node_type("decide_next"), NodeType::Decision);
        assert_eq!(classify_node_type("hands_input"), NodeType::Action);
        assert_eq!(classify_node_type("evidence"), NodeType::Summary);
    }

    #[test]
    fn materialize_nodes_writes_one_node_per_bucket_with_derived_from_edges() {
        let dir = tempfile::tempdir().unwrap();
        let db = ThoughtDb::new(crate::store::Scope::Project, "p1", dir.path());
        let records = vec![rec("decide_next", "chose to continue", "ev_1"), rec("hands_input", "ran tests", "ev_2")];
        let node_ids = materialize_nodes(&db, &records).unwrap();
        assert_eq!(node_ids.len(), 2);
        let view = db.load_view().unwrap();
        assert_eq!(view.edges.len(), 2);
        assert!(view.edges.iter().all(|e| e.edge_type == EdgeType::DerivedFrom));
    }

    #[tokio::test]
    async fn run_checkpoint_pipeline_is_noop_when_no_mining_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let evidence_log = EvidenceLog::new(dir.path().join("evidence.jsonl"));
        let store = ThoughtDbStore::new("p1", dir.path().join("project/thoughtdb"), dir.path().join("global/thoughtdb"));
        let registry = WorkflowRegistry::new(dir.path().join("workflows"), dir.path().join("global_workflows"));
        let provider = crate::mind::provider::AnthropicProvider::new("claude".into(), "unused".into(), 1).unwrap();
        let mediator = MindMediator::new(Box::new(provider), dir.path().join("transcripts"));
        let mining = MiningConfig {
            wf_auto_mine: false,
            pref_auto_mine: false,
            tdb_auto_mine: false,
            tdb_auto_nodes: false,
            ..MiningConfig::default()
        };
        let allowed = HashSet::new();
        let ctx = CheckpointContext {
            mediator: &mediator,
            batch_id: "b1",
            thread_id: "t1",
            mining: &mining,
            evidence_log: &evidence_log,
            thoughtdb_store: &store,
            workflow_registry: &registry,
            candidates_dir: dir.path(),
            allowed_event_ids: &allowed,
        };
        let mut segment = SegmentState::default();
        let result = run_checkpoint_pipeline(ctx, &mut segment, None).await.unwrap();
        assert!(!result.attempted);
        assert!(!result.checkpointed);
    }
}
