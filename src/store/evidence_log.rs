//! EvidenceLog: an append-only JSONL audit trail, one file per scope
//! (project or global), grounded on `ActivityLogger` (spec.md §3, §6).

use crate::ids;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Every EvidenceLog `kind` named in spec.md §3, one variant per row of the
/// table. `#[serde(tag = "kind")]` flattens the variant's own fields into
/// the same JSON object as the envelope fields below — matching "one JSON
/// object per line, keys sorted".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidenceKind {
    HandsInput {
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        light_injection: Option<String>,
        prompt_sha256: String,
        transcript_path: String,
    },
    Evidence {
        #[serde(default)]
        facts: Vec<String>,
        #[serde(default)]
        actions: Vec<String>,
        #[serde(default)]
        results: Vec<String>,
        #[serde(default)]
        unknowns: Vec<String>,
        #[serde(default)]
        risk_signals: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcript_observation: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo_observation: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mind_transcript_ref: Option<String>,
    },
    WorkflowProgress {
        workflow_id: String,
        #[serde(default)]
        completed_step_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_step_id: Option<String>,
    },
    RiskEvent {
        category: String,
        severity: String,
        should_ask_user: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mitigation: Option<String>,
        #[serde(default)]
        learn_suggested: bool,
    },
    CheckPlan {
        should_run_checks: bool,
        needs_testless_strategy: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hands_check_input: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
    },
    AutoAnswer {
        should_answer: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hands_answer_input: Option<String>,
        needs_user_input: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ask_user_question: Option<String>,
        #[serde(default)]
        unanswered_questions: Vec<String>,
    },
    DecideNext {
        next_action: String,
        status: String,
        confidence: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_hands_input: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ask_user_question: Option<String>,
        #[serde(default)]
        update_project_overlay: serde_json::Value,
        #[serde(default)]
        learn_suggested: Vec<serde_json::Value>,
    },
    UserInput {
        question: String,
        answer: String,
    },
    LoopGuard {
        pattern: String,
        reason: String,
    },
    LoopBreak {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_instruction: Option<String>,
    },
    CrossProjectRecall {
        reason: String,
        query: String,
        #[serde(default)]
        items: Vec<String>,
    },
    Snapshot {
        checkpoint_kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_hint: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
        text: String,
        #[serde(default)]
        source_refs: Vec<String>,
    },
    LearnSuggested {
        source: String,
        auto_learn: bool,
        learn_suggested: serde_json::Value,
        #[serde(default)]
        applied_claim_ids: Vec<String>,
    },
    LearnApplied {
        learn_suggestion_id: String,
        claim_id: String,
    },
    LearnUpdate {
        input_summary: String,
        output: serde_json::Value,
        applied: bool,
    },
    MindError {
        schema: String,
        tag: String,
        transcript_path: String,
        error: String,
    },
    MindSkipped {
        schema: String,
        tag: String,
    },
    HandsResumeFailed {
        thread_id: String,
        error: String,
    },
    StateWarning {
        component: String,
        message: String,
    },
    MiDefaultsSet {
        ask_when_uncertain: bool,
        refactor_intent: String,
        testless_verification_strategy: Option<String>,
    },
    WorkflowTrigger {
        workflow_id: String,
        workflow_name: String,
        trigger_pattern: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    pub batch_id: String,
    pub thread_id: String,
    #[serde(flatten)]
    pub kind: EvidenceKind,
}

impl EvidenceRecord {
    pub fn new(batch_id: impl Into<String>, thread_id: impl Into<String>, kind: EvidenceKind) -> Self {
        Self {
            event_id: None,
            ts: None,
            batch_id: batch_id.into(),
            thread_id: thread_id.into(),
            kind,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            EvidenceKind::HandsInput { .. } => "hands_input",
            EvidenceKind::Evidence { .. } => "evidence",
            EvidenceKind::WorkflowProgress { .. } => "workflow_progress",
            EvidenceKind::RiskEvent { .. } => "risk_event",
            EvidenceKind::CheckPlan { .. } => "check_plan",
            EvidenceKind::AutoAnswer { .. } => "auto_answer",
            EvidenceKind::DecideNext { .. } => "decide_next",
            EvidenceKind::UserInput { .. } => "user_input",
            EvidenceKind::LoopGuard { .. } => "loop_guard",
            EvidenceKind::LoopBreak { .. } => "loop_break",
            EvidenceKind::CrossProjectRecall { .. } => "cross_project_recall",
            EvidenceKind::Snapshot { .. } => "snapshot",
            EvidenceKind::LearnSuggested { .. } => "learn_suggested",
            EvidenceKind::LearnApplied { .. } => "learn_applied",
            EvidenceKind::LearnUpdate { .. } => "learn_update",
            EvidenceKind::MindError { .. } => "mind_error",
            EvidenceKind::MindSkipped { .. } => "mind_skipped",
            EvidenceKind::HandsResumeFailed { .. } => "hands_resume_failed",
            EvidenceKind::StateWarning { .. } => "state_warning",
            EvidenceKind::MiDefaultsSet { .. } => "mi_defaults_set",
            EvidenceKind::WorkflowTrigger { .. } => "workflow_trigger",
        }
    }
}

/// Append-only JSONL file. One file per scope (project `evidence.jsonl`, or
/// a global counterpart). `append` assigns `event_id`/`ts` when absent so
/// callers can build a record without worrying about ordering, then flushes
/// immediately (spec.md §6: "Writers must flush to disk on each append").
pub struct EvidenceLog {
    path: PathBuf,
}

impl EvidenceLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, mut record: EvidenceRecord) -> Result<EvidenceRecord> {
        if record.event_id.is_none() {
            record.event_id = Some(ids::new_event_id());
        }
        if record.ts.is_none() {
            record.ts = Some(ids::now_rfc3339());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        // Sort keys: serialize through serde_json::Value, which we re-emit
        // via a BTreeMap for deterministic key order (spec.md §6).
        let value = serde_json::to_value(&record).context("failed to serialize evidence record")?;
        let sorted = sort_keys(value);
        let line = serde_json::to_string(&sorted).context("failed to encode evidence record")?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open evidence log {}", self.path.display()))?;
        writeln!(file, "{line}").context("failed to write evidence record")?;
        file.flush().context("failed to flush evidence log")?;

        Ok(record)
    }

    /// Iterate records, tolerating and skipping malformed trailing lines.
    pub fn iter(&self) -> Result<Vec<EvidenceRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("failed to open evidence log {}", self.path.display()))?;
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
            if let Ok(record) = serde_json::from_str::<EvidenceRecord>(&line) {
                out.push(record);
            }
            // Malformed lines (partial writes, truncated trailing line) are
            // skipped silently per spec.md §6.
        }
        Ok(out)
    }
}

fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            for k in keys {
                sorted.insert(k.clone(), sort_keys(map[&k].clone()));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_keys).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_in_tempdir() -> (EvidenceLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = EvidenceLog::new(dir.path().join("evidence.jsonl"));
        (log, dir)
    }

    #[test]
    fn append_assigns_event_id_and_ts() {
        let (log, _dir) = log_in_tempdir();
        let record = EvidenceRecord::new(
            "b1",
            "t1",
            EvidenceKind::Evidence {
                facts: vec!["ran ls".into()],
                actions: vec![],
                results: vec![],
                unknowns: vec![],
                risk_signals: vec![],
                transcript_observation: None,
                repo_observation: None,
                mind_transcript_ref: None,
            },
        );
        let appended = log.append(record).unwrap();
        assert!(appended.event_id.unwrap().starts_with("ev_"));
        assert!(appended.ts.is_some());
    }

    #[test]
    fn event_id_and_ts_are_monotone_non_decreasing_in_append_order() {
        let (log, _dir) = log_in_tempdir();
        let mut prev_ts: Option<String> = None;
        for i in 0..5 {
            let record = EvidenceRecord::new(
                format!("b{i}"),
                "t1",
                EvidenceKind::StateWarning {
                    component: "test".into(),
                    message: format!("msg {i}"),
                },
            );
            let appended = log.append(record).unwrap();
            let ts = appended.ts.unwrap();
            if let Some(prev) = &prev_ts {
                assert!(ts >= *prev);
            }
            prev_ts = Some(ts);
        }
    }

    #[test]
    fn iter_tolerates_malformed_trailing_line() {
        let (log, dir) = log_in_tempdir();
        log.append(EvidenceRecord::new(
            "b1",
            "t1",
            EvidenceKind::StateWarning {
                component: "x".into(),
                message: "ok".into(),
            },
        ))
        .unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("evidence.jsonl"))
            .unwrap();
        write!(file, "{{not valid json").unwrap();

        let records = log.iter().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn iter_on_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = EvidenceLog::new(dir.path().join("does_not_exist.jsonl"));
        assert!(log.iter().unwrap().is_empty());
    }

    #[test]
    fn serialized_line_has_sorted_keys() {
        let (log, dir) = log_in_tempdir();
        log.append(EvidenceRecord::new(
            "b1",
            "t1",
            EvidenceKind::UserInput {
                question: "q".into(),
                answer: "a".into(),
            },
        ))
        .unwrap();
        let contents = std::fs::read_to_string(dir.path().join("evidence.jsonl")).unwrap();
        let line = contents.lines().next().unwrap();
        // "answer" < "batch_id" < "event_id" < "kind" < "question" < "thread_id" < "ts"
        let answer_pos = line.find("\"answer\"").unwrap();
        let batch_pos = line.find("\"batch_id\"").unwrap();
        let kind_pos = line.find("\"kind\"").unwrap();
        assert!(answer_pos < batch_pos);
        assert!(batch_pos < kind_pos);
    }
}
