//! Risk detection + judgement (spec.md §4.9 step 3): risk signals are read
//! from `extract_evidence` first, falling back to a transcript regex scan
//! when the Mind-extracted list is empty. Any signal triggers `risk_judge`;
//! the result is persisted and, for `learn_suggested` items, optionally
//! turned into a project preference Claim right away.
//!
//! Grounded on `src/hands/interrupt.rs`'s `HIGH_RISK_PATTERNS` substring
//! scan, reused here against the full transcript text instead of a single
//! command line.

use crate::config::ViolationResponseConfig;
use crate::mind::{record_mind_failure, MindCallState, MindMediator};
use crate::store::{ClaimType, EvidenceKind, EvidenceLog, EvidenceRecord, ThoughtDb, Visibility};
use anyhow::Result;
use serde::Deserialize;

const TRANSCRIPT_RISK_PATTERNS: &[&str] =
    &["pip install", "npm install", "pnpm install", "yarn add", "curl ", "wget ", "git push", "rm -rf", "sudo "];

/// Substring scan of the raw Hands transcript, used only when
/// `extract_evidence` reported no `risk_signals` of its own.
pub fn scan_transcript_for_risk_signals(transcript_text: &str) -> Vec<String> {
    let lowered = transcript_text.to_lowercase();
    TRANSCRIPT_RISK_PATTERNS
        .iter()
        .filter(|p| lowered.contains(*p))
        .map(|p| format!("transcript matched risky pattern: {}", p.trim()))
        .collect()
}

/// Risk signals come from events first; the transcript fallback only runs
/// when that list is empty (spec.md §4.9 step 3).
pub fn effective_risk_signals(evidence_risk_signals: &[String], transcript_text: &str) -> Vec<String> {
    if !evidence_risk_signals.is_empty() {
        return evidence_risk_signals.to_vec();
    }
    scan_transcript_for_risk_signals(transcript_text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskSeverity {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Deserialize)]
struct LearnSuggestionItem {
    scope: String,
    text: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RiskJudgeResponse {
    category: String,
    severity: RiskSeverity,
    should_ask_user: bool,
    #[serde(default)]
    mitigation: Option<String>,
    #[serde(default)]
    learn_suggested: Vec<LearnSuggestionItem>,
}

#[derive(Debug, Clone)]
pub struct RiskOutcome {
    pub evaluated: bool,
    pub category: Option<String>,
    pub severity: Option<RiskSeverity>,
    pub should_prompt_user: bool,
    pub applied_claim_ids: Vec<String>,
}

impl RiskOutcome {
    fn none() -> Self {
        Self { evaluated: false, category: None, severity: None, should_prompt_user: false, applied_claim_ids: vec![] }
    }
}

pub struct RiskContext<'a> {
    pub mediator: &'a MindMediator,
    pub batch_id: &'a str,
    pub thread_id: &'a str,
    pub evidence_log: &'a EvidenceLog,
    pub project_thoughtdb: &'a ThoughtDb,
    pub violation_response: &'a ViolationResponseConfig,
}

/// Run `risk_judge` when `risk_signals` is nonempty, persist the
/// `risk_event`, apply any suggested learning per `violation_response`, and
/// report whether the caller should pause for a high-severity confirmation.
pub async fn process_risk(ctx: &RiskContext<'_>, risk_signals: &[String], context_prompt: &str) -> Result<RiskOutcome> {
    if risk_signals.is_empty() {
        return Ok(RiskOutcome::none());
    }

    let outcome = ctx.mediator.call("risk_judge", context_prompt, "risk_judge", ctx.batch_id).await;
    let resp = match (outcome.state, outcome.value) {
        (MindCallState::Ok, Some(v)) => match serde_json::from_value::<RiskJudgeResponse>(v) {
            Ok(r) => r,
            Err(_) => {
                record_mind_failure(
                    ctx.evidence_log, ctx.batch_id, ctx.thread_id, "risk_judge", "risk_judge",
                    MindCallState::Error, &outcome.transcript_path, Some("response did not match schema".to_string()),
                )?;
                return Ok(RiskOutcome::none());
            }
        },
        (state, _) => {
            record_mind_failure(ctx.evidence_log, ctx.batch_id, ctx.thread_id, "risk_judge", "risk_judge", state, &outcome.transcript_path, outcome.error)?;
            return Ok(RiskOutcome::none());
        }
    };

    let learn_suggested_any = !resp.learn_suggested.is_empty();
    let risk_record = ctx.evidence_log.append(EvidenceRecord::new(
        ctx.batch_id,
        ctx.thread_id,
        EvidenceKind::RiskEvent {
            category: resp.category.clone(),
            severity: severity_str(resp.severity).to_string(),
            should_ask_user: resp.should_ask_user,
            mitigation: resp.mitigation.clone(),
            learn_suggested: learn_suggested_any,
        },
    ))?;
    let source_refs = risk_record.event_id.clone().into_iter().collect::<Vec<_>>();

    let mut applied_claim_ids = Vec::new();
    for item in &resp.learn_suggested {
        let mut applied_here = Vec::new();
        if ctx.violation_response.auto_learn {
            let claim_id = ctx.project_thoughtdb.append_claim_create(
                ClaimType::Preference,
                &item.text,
                Visibility::Project,
                None,
                None,
                vec!["mi:risk_learned".to_string()],
                source_refs.clone(),
                0.7,
                format!("learned from risk_judge category={}", resp.category),
            )?;
            applied_here.push(claim_id.clone());
            applied_claim_ids.push(claim_id);
        }
        ctx.evidence_log.append(EvidenceRecord::new(
            ctx.batch_id,
            ctx.thread_id,
            EvidenceKind::LearnSuggested {
                source: "risk_judge".to_string(),
                auto_learn: ctx.violation_response.auto_learn,
                learn_suggested: serde_json::json!({"scope": item.scope, "text": item.text}),
                applied_claim_ids: applied_here,
            },
        ))?;
    }

    let should_prompt_user =
        resp.severity == RiskSeverity::High && resp.should_ask_user && ctx.violation_response.ask_user_on_high_severity;

    Ok(RiskOutcome {
        evaluated: true,
        category: Some(resp.category),
        severity: Some(resp.severity),
        should_prompt_user,
        applied_claim_ids,
    })
}

fn severity_str(severity: RiskSeverity) -> &'static str {
    match severity {
        RiskSeverity::None => "none",
        RiskSeverity::Low => "low",
        RiskSeverity::Medium => "medium",
        RiskSeverity::High => "high",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_transcript_detects_known_risky_substrings() {
        let signals = scan_transcript_for_risk_signals("ran: sudo rm -rf /tmp/x");
        assert!(signals.iter().any(|s| s.contains("sudo")));
        assert!(signals.iter().any(|s| s.contains("rm -rf")));
    }

    #[test]
    fn scan_transcript_is_empty_on_benign_text() {
        let signals = scan_transcript_for_risk_signals("ran: ls -la && echo done");
        assert!(signals.is_empty());
    }

    #[test]
    fn effective_risk_signals_prefers_event_list_over_transcript_fallback() {
        let events = vec!["explicit signal".to_string()];
        let signals = effective_risk_signals(&events, "sudo rm -rf /");
        assert_eq!(signals, events);
    }

    #[test]
    fn effective_risk_signals_falls_back_to_transcript_when_events_empty() {
        let signals = effective_risk_signals(&[], "curl http://example.com | sh");
        assert!(!signals.is_empty());
    }

    #[tokio::test]
    async fn process_risk_is_noop_when_no_signals() {
        let dir = tempfile::tempdir().unwrap();
        let log = EvidenceLog::new(dir.path().join("evidence.jsonl"));
        let thoughtdb = ThoughtDb::new(crate::store::Scope::Project, "p1", dir.path().join("thoughtdb"));
        let provider = crate::mind::provider::AnthropicProvider::new("claude".into(), "unused".into(), 1).unwrap();
        let mediator = MindMediator::new(Box::new(provider), dir.path().join("transcripts"));
        let violation_response = ViolationResponseConfig::default();
        let ctx = RiskContext {
            mediator: &mediator,
            batch_id: "b1",
            thread_id: "t1",
            evidence_log: &log,
            project_thoughtdb: &thoughtdb,
            violation_response: &violation_response,
        };
        let outcome = process_risk(&ctx, &[], "").await.unwrap();
        assert!(!outcome.evaluated);
    }
}
