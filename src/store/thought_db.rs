//! Thought DB: three append-only JSONL streams per scope (claims, edges,
//! nodes), a materialized as-of view, and `apply_mined_output` — the sole
//! entry point for Mind-produced batches of claims+edges (spec.md §3, §4.3,
//! §8). Ported field-for-field from `original_source/mi/thoughtdb.py`.

use crate::ids;
use crate::signature::claim_signature;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Project,
    Global,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Project,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Project => "project",
            Scope::Global => "global",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimType {
    Fact,
    Preference,
    Goal,
    Assumption,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    DependsOn,
    Supports,
    Contradicts,
    DerivedFrom,
    Mentions,
    Supersedes,
    SameAs,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Decision,
    Action,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub claim_type: ClaimType,
    pub text: String,
    pub scope: Scope,
    pub visibility: Visibility,
    pub asserted_ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// `event_id`s from the allowed EvidenceLog set at mining time (1-5).
    pub source_refs: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub edge_id: String,
    pub edge_type: EdgeType,
    pub from_id: String,
    pub to_id: String,
    pub scope: Scope,
    pub visibility: Visibility,
    pub source_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub node_type: NodeType,
    pub title: String,
    pub text: String,
    pub scope: Scope,
    pub visibility: Visibility,
    pub source_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
enum ClaimStreamRecord {
    Claim(Claim),
    ClaimRetract { claim_id: String, ts: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
enum NodeStreamRecord {
    Node(Node),
    NodeRetract { node_id: String, ts: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Active,
    Superseded,
    Retracted,
    Unknown,
}

/// Materialized view of a single scope's Thought DB.
#[derive(Debug, Default)]
pub struct ThoughtDbView {
    pub scope: Option<Scope>,
    pub claims_by_id: HashMap<String, Claim>,
    pub nodes_by_id: HashMap<String, Node>,
    pub edges: Vec<Edge>,
    pub redirects_same_as: HashMap<String, String>,
    pub superseded_ids: HashSet<String>,
    pub retracted_ids: HashSet<String>,
    pub retracted_node_ids: HashSet<String>,
}

impl ThoughtDbView {
    pub fn resolve_id(&self, start: &str) -> String {
        let mut cur = start.trim().to_string();
        if cur.is_empty() {
            return cur;
        }
        let mut seen = HashSet::new();
        for _ in 0..20 {
            if seen.contains(&cur) {
                break;
            }
            seen.insert(cur.clone());
            match self.redirects_same_as.get(&cur) {
                Some(next) if next != &cur => cur = next.clone(),
                _ => break,
            }
        }
        cur
    }

    pub fn claim_status(&self, claim_id: &str) -> ClaimStatus {
        if claim_id.trim().is_empty() {
            return ClaimStatus::Unknown;
        }
        if self.retracted_ids.contains(claim_id) {
            return ClaimStatus::Retracted;
        }
        if self.superseded_ids.contains(claim_id) {
            return ClaimStatus::Superseded;
        }
        ClaimStatus::Active
    }

    pub fn node_status(&self, node_id: &str) -> ClaimStatus {
        if node_id.trim().is_empty() {
            return ClaimStatus::Unknown;
        }
        if self.retracted_node_ids.contains(node_id) {
            return ClaimStatus::Retracted;
        }
        if self.superseded_ids.contains(node_id) {
            return ClaimStatus::Superseded;
        }
        ClaimStatus::Active
    }

    /// Active, non-alias claims tagged with `tag`, project claims first
    /// (used by operational-defaults resolution, spec.md §4.4).
    pub fn claims_tagged(&self, tag: &str) -> Vec<&Claim> {
        let mut out: Vec<&Claim> = self
            .claims_by_id
            .iter()
            .filter(|(id, c)| {
                c.tags.iter().any(|t| t == tag)
                    && !self.redirects_same_as.contains_key(*id)
                    && self.claim_status(id) == ClaimStatus::Active
            })
            .map(|(_, c)| c)
            .collect();
        out.sort_by(|a, b| b.asserted_ts.cmp(&a.asserted_ts));
        out
    }
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => continue,
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<T>(&line) {
            out.push(value);
        }
    }
    Ok(out)
}

fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let line = serde_json::to_string(value).context("failed to serialize thought db record")?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").context("failed to write thought db record")?;
    file.flush().context("failed to flush thought db stream")?;
    Ok(())
}

/// One scope's three append streams (`claims.jsonl`, `edges.jsonl`, `nodes.jsonl`).
pub struct ThoughtDb {
    scope: Scope,
    project_id: String,
    claims_path: PathBuf,
    edges_path: PathBuf,
    nodes_path: PathBuf,
}

impl ThoughtDb {
    pub fn new(scope: Scope, project_id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            scope,
            project_id: project_id.into(),
            claims_path: dir.join("claims.jsonl"),
            edges_path: dir.join("edges.jsonl"),
            nodes_path: dir.join("nodes.jsonl"),
        }
    }

    pub fn append_claim_create(
        &self,
        claim_type: ClaimType,
        text: &str,
        visibility: Visibility,
        valid_from: Option<String>,
        valid_to: Option<String>,
        tags: Vec<String>,
        source_refs: Vec<String>,
        confidence: f64,
        notes: String,
    ) -> Result<String> {
        let claim = Claim {
            claim_id: ids::new_claim_id(),
            claim_type,
            text: text.to_string(),
            scope: self.scope,
            visibility,
            asserted_ts: ids::now_rfc3339(),
            valid_from,
            valid_to,
            tags,
            source_refs,
            confidence,
            notes,
        };
        let claim_id = claim.claim_id.clone();
        append_jsonl(&self.claims_path, &ClaimStreamRecord::Claim(claim))?;
        Ok(claim_id)
    }

    pub fn append_claim_retract(&self, claim_id: &str) -> Result<()> {
        append_jsonl(
            &self.claims_path,
            &ClaimStreamRecord::ClaimRetract {
                claim_id: claim_id.to_string(),
                ts: ids::now_rfc3339(),
            },
        )
    }

    pub fn append_edge(
        &self,
        edge_type: EdgeType,
        from_id: &str,
        to_id: &str,
        visibility: Visibility,
        source_refs: Vec<String>,
    ) -> Result<String> {
        let edge = Edge {
            edge_id: ids::new_edge_id(),
            edge_type,
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            scope: self.scope,
            visibility,
            source_refs,
        };
        let edge_id = edge.edge_id.clone();
        append_jsonl(&self.edges_path, &edge)?;
        Ok(edge_id)
    }

    pub fn append_node(
        &self,
        node_type: NodeType,
        title: &str,
        text: &str,
        visibility: Visibility,
        source_refs: Vec<String>,
    ) -> Result<String> {
        let node = Node {
            node_id: ids::new_node_id(),
            node_type,
            title: title.to_string(),
            text: text.to_string(),
            scope: self.scope,
            visibility,
            source_refs,
        };
        let node_id = node.node_id.clone();
        append_jsonl(&self.nodes_path, &NodeStreamRecord::Node(node))?;
        Ok(node_id)
    }

    pub fn load_view(&self) -> Result<ThoughtDbView> {
        let claim_records: Vec<ClaimStreamRecord> = read_jsonl(&self.claims_path)?;
        let node_records: Vec<NodeStreamRecord> = read_jsonl(&self.nodes_path)?;
        let edges: Vec<Edge> = read_jsonl(&self.edges_path)?;

        let mut claims_by_id = HashMap::new();
        let mut retracted_ids = HashSet::new();
        for rec in claim_records {
            match rec {
                ClaimStreamRecord::Claim(c) => {
                    claims_by_id.insert(c.claim_id.clone(), c);
                }
                ClaimStreamRecord::ClaimRetract { claim_id, .. } => {
                    retracted_ids.insert(claim_id);
                }
            }
        }

        let mut nodes_by_id = HashMap::new();
        let mut retracted_node_ids = HashSet::new();
        for rec in node_records {
            match rec {
                NodeStreamRecord::Node(n) => {
                    nodes_by_id.insert(n.node_id.clone(), n);
                }
                NodeStreamRecord::NodeRetract { node_id, .. } => {
                    retracted_node_ids.insert(node_id);
                }
            }
        }

        let mut redirects_same_as = HashMap::new();
        let mut superseded_ids = HashSet::new();
        for edge in &edges {
            match edge.edge_type {
                EdgeType::SameAs => {
                    redirects_same_as
                        .entry(edge.from_id.clone())
                        .or_insert_with(|| edge.to_id.clone());
                }
                EdgeType::Supersedes => {
                    superseded_ids.insert(edge.from_id.clone());
                }
                _ => {}
            }
        }

        Ok(ThoughtDbView {
            scope: Some(self.scope),
            claims_by_id,
            nodes_by_id,
            edges,
            redirects_same_as,
            superseded_ids,
            retracted_ids,
            retracted_node_ids,
        })
    }

    /// `sha256(claim_type|scope|project_id|normalized_text) -> existing claim_id`
    /// for active, non-retracted claims — used to dedup mined claims.
    fn existing_signature_map(&self, view: &ThoughtDbView) -> HashMap<String, String> {
        let mut out = HashMap::new();
        for (id, claim) in &view.claims_by_id {
            if view.claim_status(id) != ClaimStatus::Active {
                continue;
            }
            let sig = claim_signature(
                claim_type_str(claim.claim_type),
                self.scope.as_str(),
                &self.project_id,
                &claim.text,
            );
            out.entry(sig).or_insert_with(|| id.clone());
        }
        out
    }
}

fn claim_type_str(ct: ClaimType) -> &'static str {
    match ct {
        ClaimType::Fact => "fact",
        ClaimType::Preference => "preference",
        ClaimType::Goal => "goal",
        ClaimType::Assumption => "assumption",
    }
}

fn min_visibility(a: Visibility, b: Visibility) -> Visibility {
    if a <= b {
        a
    } else {
        b
    }
}

/// One claim suggestion inside a `mine_claims`/`learn_update` Mind response.
#[derive(Debug, Clone, Deserialize)]
pub struct MinedClaim {
    pub local_id: String,
    pub claim_type: ClaimType,
    pub text: String,
    #[serde(default = "default_scope")]
    pub scope: Scope,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub valid_from: Option<String>,
    #[serde(default)]
    pub valid_to: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_event_ids: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub notes: String,
}

fn default_scope() -> Scope {
    Scope::Project
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinedEdge {
    pub edge_type: EdgeType,
    pub from_claim_id: String,
    pub to_claim_id: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MinedOutput {
    #[serde(default)]
    pub claims: Vec<MinedClaim>,
    #[serde(default)]
    pub edges: Vec<MinedEdge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WrittenClaim {
    pub local_id: String,
    pub claim_id: String,
    pub scope: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct WrittenEdge {
    pub edge_id: String,
    pub scope: &'static str,
    pub edge_type: EdgeType,
    pub from_id: String,
    pub to_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedItem {
    pub kind: &'static str,
    pub reason: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MineOutcome {
    pub written: Vec<WrittenClaim>,
    pub linked_existing: Vec<WrittenClaim>,
    pub written_edges: Vec<WrittenEdge>,
    pub skipped: Vec<SkippedItem>,
}

/// Holds both scopes' Thought DB streams so `apply_mined_output` can dedup
/// and cross-link across project and global claims in one pass.
pub struct ThoughtDbStore {
    pub project: ThoughtDb,
    pub global: ThoughtDb,
}

impl ThoughtDbStore {
    pub fn new(project_id: impl Into<String>, project_dir: impl Into<PathBuf>, global_dir: impl Into<PathBuf>) -> Self {
        let project_id = project_id.into();
        Self {
            project: ThoughtDb::new(Scope::Project, project_id.clone(), project_dir),
            global: ThoughtDb::new(Scope::Global, project_id, global_dir),
        }
    }

    fn db_for(&self, scope: Scope) -> &ThoughtDb {
        match scope {
            Scope::Project => &self.project,
            Scope::Global => &self.global,
        }
    }

    /// Validate+append mined claims + edges. See spec.md §4.3 and §8
    /// ("Mining idempotence"). Ported from `thoughtdb.py:apply_mined_output`.
    pub fn apply_mined_output(
        &self,
        output: &MinedOutput,
        allowed_event_ids: &HashSet<String>,
        min_confidence: f64,
        max_claims: usize,
    ) -> Result<MineOutcome> {
        let min_conf = min_confidence.clamp(0.0, 1.0);
        let max_n = max_claims.min(20);
        if max_n == 0 {
            return Ok(MineOutcome::default());
        }

        let project_view = self.project.load_view()?;
        let global_view = self.global.load_view()?;
        let mut existing_sig: HashMap<Scope, HashMap<String, String>> = HashMap::new();
        existing_sig.insert(Scope::Project, self.project.existing_signature_map(&project_view));
        existing_sig.insert(Scope::Global, self.global.existing_signature_map(&global_view));

        let mut sugs: Vec<&MinedClaim> = output
            .claims
            .iter()
            .filter(|c| !c.text.trim().is_empty() && c.confidence >= min_conf)
            .collect();
        sugs.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
        sugs.truncate(max_n);

        let mut outcome = MineOutcome::default();
        let mut local_to_claim: HashMap<String, String> = HashMap::new();
        let mut local_meta: HashMap<String, (Scope, Visibility)> = HashMap::new();
        let mut seen_local_ids: HashSet<String> = HashSet::new();

        for raw in sugs {
            if seen_local_ids.contains(&raw.local_id) {
                outcome.skipped.push(SkippedItem {
                    kind: "claim",
                    reason: "duplicate_local_id".into(),
                    detail: raw.local_id.clone(),
                });
                continue;
            }
            seen_local_ids.insert(raw.local_id.clone());

            let visibility = raw.visibility.unwrap_or(match raw.scope {
                Scope::Global => Visibility::Global,
                Scope::Project => Visibility::Project,
            });

            let ev_ids: Vec<String> = raw
                .source_event_ids
                .iter()
                .filter(|id| allowed_event_ids.contains(*id))
                .cloned()
                .collect();
            if ev_ids.is_empty() {
                outcome.skipped.push(SkippedItem {
                    kind: "claim",
                    reason: "no_valid_source_event_ids".into(),
                    detail: truncate(&raw.text, 200),
                });
                continue;
            }

            let db = self.db_for(raw.scope);
            let sig = claim_signature(claim_type_str(raw.claim_type), db.scope.as_str(), &db.project_id, &raw.text);
            let sig_map = existing_sig.entry(raw.scope).or_default();
            if let Some(existing_id) = sig_map.get(&sig) {
                local_to_claim.insert(raw.local_id.clone(), existing_id.clone());
                local_meta.insert(raw.local_id.clone(), (raw.scope, visibility));
                outcome.linked_existing.push(WrittenClaim {
                    local_id: raw.local_id.clone(),
                    claim_id: existing_id.clone(),
                    scope: db.scope.as_str(),
                });
                continue;
            }

            let claim_id = match db.append_claim_create(
                raw.claim_type,
                &raw.text,
                visibility,
                raw.valid_from.clone(),
                raw.valid_to.clone(),
                raw.tags.clone(),
                ev_ids,
                raw.confidence,
                raw.notes.clone(),
            ) {
                Ok(id) => id,
                Err(e) => {
                    outcome.skipped.push(SkippedItem {
                        kind: "claim",
                        reason: format!("write_error:{e}"),
                        detail: truncate(&raw.text, 200),
                    });
                    continue;
                }
            };

            sig_map.insert(sig, claim_id.clone());
            local_to_claim.insert(raw.local_id.clone(), claim_id.clone());
            local_meta.insert(raw.local_id.clone(), (raw.scope, visibility));
            outcome.written.push(WrittenClaim {
                local_id: raw.local_id.clone(),
                claim_id,
                scope: db.scope.as_str(),
            });
        }

        // Edges: refs may be a local_id from this batch or an existing claim id.
        let resolve_ref = |r: &str| -> Option<(Scope, String, Visibility)> {
            if r.trim().is_empty() {
                return None;
            }
            if let Some(claim_id) = local_to_claim.get(r) {
                let (scope, vis) = local_meta.get(r).copied().unwrap();
                return Some((scope, claim_id.clone(), vis));
            }
            if let Some(c) = project_view.claims_by_id.get(r) {
                return Some((Scope::Project, r.to_string(), c.visibility));
            }
            if let Some(c) = global_view.claims_by_id.get(r) {
                return Some((Scope::Global, r.to_string(), c.visibility));
            }
            None
        };

        let max_edges = (max_n * 6).min(40);
        for raw in output.edges.iter().take(max_edges) {
            if raw.from_claim_id.trim().is_empty() || raw.to_claim_id.trim().is_empty() {
                outcome.skipped.push(SkippedItem {
                    kind: "edge",
                    reason: "missing_fields".into(),
                    detail: format!("{:?}:{}->{}", raw.edge_type, raw.from_claim_id, raw.to_claim_id),
                });
                continue;
            }
            if raw.confidence < min_conf {
                outcome.skipped.push(SkippedItem {
                    kind: "edge",
                    reason: "below_confidence".into(),
                    detail: format!("{:?}:{}->{}", raw.edge_type, raw.from_claim_id, raw.to_claim_id),
                });
                continue;
            }

            let from = resolve_ref(&raw.from_claim_id);
            let to = resolve_ref(&raw.to_claim_id);
            let (from, to) = match (from, to) {
                (Some(f), Some(t)) => (f, t),
                _ => {
                    outcome.skipped.push(SkippedItem {
                        kind: "edge",
                        reason: "unresolved_ref".into(),
                        detail: format!("{:?}:{}->{}", raw.edge_type, raw.from_claim_id, raw.to_claim_id),
                    });
                    continue;
                }
            };

            if from.0 != to.0 {
                outcome.skipped.push(SkippedItem {
                    kind: "edge",
                    reason: "cross_scope_edge".into(),
                    detail: format!("{:?}:{}->{}", raw.edge_type, raw.from_claim_id, raw.to_claim_id),
                });
                continue;
            }

            let db = self.db_for(from.0);
            let visibility = min_visibility(from.2, to.2);
            let edge_id = match db.append_edge(raw.edge_type, &from.1, &to.1, visibility, vec![]) {
                Ok(id) => id,
                Err(e) => {
                    outcome.skipped.push(SkippedItem {
                        kind: "edge",
                        reason: format!("write_error:{e}"),
                        detail: format!("{:?}:{}->{}", raw.edge_type, raw.from_claim_id, raw.to_claim_id),
                    });
                    continue;
                }
            };
            outcome.written_edges.push(WrittenEdge {
                edge_id,
                scope: db.scope.as_str(),
                edge_type: raw.edge_type,
                from_id: from.1,
                to_id: to.1,
            });
        }

        Ok(outcome)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s[..max].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as Set;

    fn store_in_tempdir() -> (ThoughtDbStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ThoughtDbStore::new(
            "proj1",
            dir.path().join("project/thoughtdb"),
            dir.path().join("global/thoughtdb"),
        );
        (store, dir)
    }

    fn mined(local_id: &str, text: &str, confidence: f64, event_id: &str) -> MinedOutput {
        MinedOutput {
            claims: vec![MinedClaim {
                local_id: local_id.to_string(),
                claim_type: ClaimType::Fact,
                text: text.to_string(),
                scope: Scope::Project,
                visibility: None,
                valid_from: None,
                valid_to: None,
                tags: vec![],
                source_event_ids: vec![event_id.to_string()],
                confidence,
                notes: String::new(),
            }],
            edges: vec![],
        }
    }

    #[test]
    fn apply_mined_output_writes_new_claim() {
        let (store, _dir) = store_in_tempdir();
        let mut allowed = Set::new();
        allowed.insert("ev_1".to_string());
        let outcome = store
            .apply_mined_output(&mined("c1", "uses postgres", 0.95, "ev_1"), &allowed, 0.8, 6)
            .unwrap();
        assert_eq!(outcome.written.len(), 1);
        assert!(outcome.linked_existing.is_empty());
    }

    #[test]
    fn apply_mined_output_is_idempotent_on_replay() {
        let (store, _dir) = store_in_tempdir();
        let mut allowed = Set::new();
        allowed.insert("ev_1".to_string());
        let input = mined("c1", "uses postgres", 0.95, "ev_1");

        let first = store.apply_mined_output(&input, &allowed, 0.8, 6).unwrap();
        assert_eq!(first.written.len(), 1);

        let second = store.apply_mined_output(&input, &allowed, 0.8, 6).unwrap();
        assert_eq!(second.written.len(), 0);
        assert_eq!(second.linked_existing.len(), 1);
        assert_eq!(second.linked_existing[0].claim_id, first.written[0].claim_id);
    }

    #[test]
    fn apply_mined_output_skips_claim_without_allowed_source() {
        let (store, _dir) = store_in_tempdir();
        let allowed = Set::new(); // nothing allowed
        let outcome = store
            .apply_mined_output(&mined("c1", "uses postgres", 0.95, "ev_1"), &allowed, 0.8, 6)
            .unwrap();
        assert!(outcome.written.is_empty());
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].reason, "no_valid_source_event_ids");
    }

    #[test]
    fn apply_mined_output_drops_claims_below_confidence() {
        let (store, _dir) = store_in_tempdir();
        let mut allowed = Set::new();
        allowed.insert("ev_1".to_string());
        let outcome = store
            .apply_mined_output(&mined("c1", "uses postgres", 0.5, "ev_1"), &allowed, 0.8, 6)
            .unwrap();
        assert!(outcome.written.is_empty());
        assert!(outcome.skipped.is_empty()); // filtered pre-loop, not "skipped"
    }

    #[test]
    fn view_resolves_same_as_and_supersedes() {
        let (store, _dir) = store_in_tempdir();
        let a = store
            .project
            .append_claim_create(ClaimType::Fact, "a", Visibility::Project, None, None, vec![], vec!["ev_1".into()], 0.9, String::new())
            .unwrap();
        let b = store
            .project
            .append_claim_create(ClaimType::Fact, "b", Visibility::Project, None, None, vec![], vec!["ev_1".into()], 0.9, String::new())
            .unwrap();
        store
            .project
            .append_edge(EdgeType::Supersedes, &a, &b, Visibility::Project, vec![])
            .unwrap();
        let c = store
            .project
            .append_claim_create(ClaimType::Fact, "c", Visibility::Project, None, None, vec![], vec!["ev_1".into()], 0.9, String::new())
            .unwrap();
        let d = store
            .project
            .append_claim_create(ClaimType::Fact, "d", Visibility::Project, None, None, vec![], vec!["ev_1".into()], 0.9, String::new())
            .unwrap();
        store
            .project
            .append_edge(EdgeType::SameAs, &c, &d, Visibility::Project, vec![])
            .unwrap();

        let view = store.project.load_view().unwrap();
        assert_eq!(view.claim_status(&a), ClaimStatus::Superseded);
        assert_eq!(view.claim_status(&b), ClaimStatus::Active);
        assert_eq!(view.resolve_id(&c), d);
    }

    #[test]
    fn edge_visibility_is_floor_of_endpoints() {
        let (store, _dir) = store_in_tempdir();
        let a = store
            .project
            .append_claim_create(ClaimType::Fact, "a", Visibility::Global, None, None, vec![], vec!["ev_1".into()], 0.9, String::new())
            .unwrap();
        let b = store
            .project
            .append_claim_create(ClaimType::Fact, "b", Visibility::Private, None, None, vec![], vec!["ev_1".into()], 0.9, String::new())
            .unwrap();

        let mut allowed = Set::new();
        allowed.insert("ev_1".into());
        let output = MinedOutput {
            claims: vec![],
            edges: vec![MinedEdge {
                edge_type: EdgeType::Supports,
                from_claim_id: a,
                to_claim_id: b,
                confidence: 0.9,
            }],
        };
        let outcome = store.apply_mined_output(&output, &allowed, 0.8, 6).unwrap();
        assert_eq!(outcome.written_edges.len(), 1);
        assert_eq!(outcome.written_edges[0].scope, "project");
        let view = store.project.load_view().unwrap();
        assert_eq!(view.edges[0].visibility, Visibility::Private);
    }

    #[test]
    fn claim_retract_marks_retracted() {
        let (store, _dir) = store_in_tempdir();
        let a = store
            .project
            .append_claim_create(ClaimType::Fact, "a", Visibility::Project, None, None, vec![], vec!["ev_1".into()], 0.9, String::new())
            .unwrap();
        store.project.append_claim_retract(&a).unwrap();
        let view = store.project.load_view().unwrap();
        assert_eq!(view.claim_status(&a), ClaimStatus::Retracted);
    }
}
