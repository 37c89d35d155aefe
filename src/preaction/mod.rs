//! Pre-action phase: plan minimal checks, resolve the testless-verification
//! strategy once per project, auto-answer Hands' questions, and arbitrate
//! deterministically between auto-answer/checks/`decide_next` (spec.md §4.4).
//!
//! Grounded on `src/brain/mod.rs`'s turn loop (tool-call vs no-tool-call
//! branch) and `src/brain/ask_user.rs` (a question-asking tool surfaced back
//! to the user), generalized into the four preaction steps.

use crate::mind::{record_mind_failure, MindCallState, MindMediator};
use crate::store::{ClaimType, EvidenceLog, ProjectOverlay, TestlessStrategy, ThoughtDb, Visibility};
use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Default)]
pub struct CheckPlan {
    pub should_run_checks: bool,
    pub needs_testless_strategy: bool,
    pub hands_check_input: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CheckPlanResponse {
    should_run_checks: bool,
    needs_testless_strategy: bool,
    #[serde(default)]
    hands_check_input: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AutoAnswer {
    pub should_answer: bool,
    pub hands_answer_input: Option<String>,
    pub needs_user_input: bool,
    pub ask_user_question: Option<String>,
    pub unanswered_questions: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AutoAnswerResponse {
    should_answer: bool,
    #[serde(default)]
    hands_answer_input: Option<String>,
    needs_user_input: bool,
    #[serde(default)]
    ask_user_question: Option<String>,
    #[serde(default)]
    unanswered_questions: Vec<String>,
}

/// Deterministic gate for `plan_min_checks` (spec.md §4.4(a)): Mind is
/// consulted only when at least one of these signals is present.
pub fn needs_check_plan(
    exit_code: i32,
    unknowns: &[String],
    risk_signals: &[String],
    last_hands_message: &str,
    git_status_or_diff_nonempty: bool,
) -> bool {
    exit_code != 0
        || !unknowns.is_empty()
        || !risk_signals.is_empty()
        || looks_like_question(last_hands_message)
        || git_status_or_diff_nonempty
}

const QUESTION_PHRASES: &[&str] = &["do you want", "please confirm", "should i", "shall i", "would you like"];

/// "Looks like a Hands question" heuristic (spec.md §4.4(c)): a `?` or one
/// of a fixed set of phrases.
pub fn looks_like_question(text: &str) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    if text.contains('?') {
        return true;
    }
    let lower = text.to_lowercase();
    QUESTION_PHRASES.iter().any(|p| lower.contains(p))
}

/// `plan_min_checks` (spec.md §4.4(a)). Returns `(plan, mind_call_state)` —
/// callers append a `check_plan` EvidenceLog record regardless of state,
/// using the empty-default payload with `notes` explaining any Mind failure.
/// Any non-`Ok` state is also routed through `record_mind_failure` so the
/// audit trail carries a `mind_skipped`/`mind_error` record (spec.md §4.2).
#[allow(clippy::too_many_arguments)]
pub async fn plan_min_checks(
    mediator: &MindMediator,
    batch_id: &str,
    exit_code: i32,
    unknowns: &[String],
    risk_signals: &[String],
    last_hands_message: &str,
    git_status_or_diff_nonempty: bool,
    context_prompt: &str,
    evidence_log: &EvidenceLog,
    thread_id: &str,
) -> Result<(CheckPlan, MindCallState)> {
    if !needs_check_plan(exit_code, unknowns, risk_signals, last_hands_message, git_status_or_diff_nonempty) {
        return Ok((
            CheckPlan {
                should_run_checks: false,
                needs_testless_strategy: false,
                hands_check_input: None,
                notes: Some("skipped: no uncertainty/risk/question detected".to_string()),
            },
            MindCallState::Ok,
        ));
    }

    let outcome = mediator.call("plan_min_checks", context_prompt, "plan_min_checks", batch_id).await;
    Ok(match (outcome.state, outcome.value) {
        (MindCallState::Ok, Some(value)) => match serde_json::from_value::<CheckPlanResponse>(value) {
            Ok(resp) => (
                CheckPlan {
                    should_run_checks: resp.should_run_checks,
                    needs_testless_strategy: resp.needs_testless_strategy,
                    hands_check_input: resp.hands_check_input,
                    notes: resp.notes,
                },
                MindCallState::Ok,
            ),
            Err(e) => {
                record_mind_failure(
                    evidence_log, batch_id, thread_id, "plan_min_checks", "plan_min_checks",
                    MindCallState::Error, &outcome.transcript_path, Some(e.to_string()),
                )?;
                (
                    CheckPlan {
                        notes: Some(format!("mind response did not match expected shape: {e}")),
                        ..Default::default()
                    },
                    MindCallState::Error,
                )
            }
        },
        (state, _) => {
            record_mind_failure(evidence_log, batch_id, thread_id, "plan_min_checks", "plan_min_checks", state, &outcome.transcript_path, outcome.error.clone())?;
            (
                CheckPlan {
                    notes: Some(format!("mind call {:?}: {}", state, outcome.error.unwrap_or_default())),
                    ..Default::default()
                },
                state,
            )
        }
    })
}

/// Testless-strategy resolution (spec.md §4.4(b)). First syncs the overlay
/// pointer from any existing `mi:testless_verification_strategy` claim; if
/// still unresolved, the caller (orchestrator) prompts the user exactly once
/// per project and calls `canonicalize_testless_strategy` with the answer.
pub fn sync_testless_strategy_from_claims(overlay: &mut ProjectOverlay, project_view: &crate::store::ThoughtDbView) -> bool {
    if overlay.testless_verification_strategy.chosen_once {
        return true;
    }
    if let Some(claim) = project_view.claims_tagged("mi:testless_verification_strategy").first() {
        overlay.testless_verification_strategy = TestlessStrategy {
            chosen_once: true,
            strategy: Some(claim.text.clone()),
            rationale: Some("resolved from existing preference claim".to_string()),
        };
        return true;
    }
    false
}

/// Canonicalize the user's one-time answer as a project-scope preference
/// Claim, and mirror a pointer in the overlay (spec.md §4.4(b), §8 scenario
/// 6 "TLS canonicalization").
pub fn canonicalize_testless_strategy(
    project_thoughtdb: &ThoughtDb,
    overlay: &mut ProjectOverlay,
    answer: &str,
    source_event_id: &str,
) -> Result<String> {
    let claim_id = project_thoughtdb.append_claim_create(
        ClaimType::Preference,
        answer,
        Visibility::Project,
        None,
        None,
        vec!["mi:testless_verification_strategy".to_string()],
        vec![source_event_id.to_string()],
        1.0,
        "resolved via one-time user prompt".to_string(),
    )?;
    overlay.testless_verification_strategy = TestlessStrategy {
        chosen_once: true,
        strategy: Some(answer.to_string()),
        rationale: Some("user-provided, canonicalized once per project".to_string()),
    };
    Ok(claim_id)
}

/// `auto_answer_to_hands` (spec.md §4.4(c)), only invoked when
/// `looks_like_question(last_hands_message)` — callers must not append a
/// `auto_answer` EvidenceLog record when that guard short-circuits this to
/// `Ok`/default without ever consulting Mind (spec.md §8 scenario 1).
pub async fn auto_answer_to_hands(
    mediator: &MindMediator,
    batch_id: &str,
    last_hands_message: &str,
    context_prompt: &str,
    evidence_log: &EvidenceLog,
    thread_id: &str,
) -> Result<(AutoAnswer, MindCallState)> {
    if !looks_like_question(last_hands_message) {
        return Ok((AutoAnswer::default(), MindCallState::Ok));
    }

    let outcome = mediator.call("auto_answer_to_hands", context_prompt, "auto_answer_to_hands", batch_id).await;
    Ok(match (outcome.state, outcome.value) {
        (MindCallState::Ok, Some(value)) => match serde_json::from_value::<AutoAnswerResponse>(value) {
            Ok(resp) => (
                AutoAnswer {
                    should_answer: resp.should_answer,
                    hands_answer_input: resp.hands_answer_input,
                    needs_user_input: resp.needs_user_input,
                    ask_user_question: resp.ask_user_question,
                    unanswered_questions: resp.unanswered_questions,
                },
                MindCallState::Ok,
            ),
            Err(_) => {
                record_mind_failure(
                    evidence_log, batch_id, thread_id, "auto_answer_to_hands", "auto_answer_to_hands",
                    MindCallState::Error, &outcome.transcript_path, Some("response did not match schema".to_string()),
                )?;
                (
                    AutoAnswer {
                        needs_user_input: true,
                        ask_user_question: Some(last_hands_message.to_string()),
                        ..Default::default()
                    },
                    MindCallState::Error,
                )
            }
        },
        (state, _) => {
            record_mind_failure(evidence_log, batch_id, thread_id, "auto_answer_to_hands", "auto_answer_to_hands", state, &outcome.transcript_path, outcome.error)?;
            (
                AutoAnswer {
                    needs_user_input: true,
                    ask_user_question: Some(last_hands_message.to_string()),
                    ..Default::default()
                },
                state,
            )
        }
    })
}

/// The deterministic arbitration table (spec.md §4.4(d), §8 "Pre-action
/// skip rule"): decides whether this batch short-circuits with a queued
/// Hands input (or a user prompt), or proceeds to `decide_next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arbitration {
    /// `needs_user_input=true`: prompt the user, then queue
    /// `answer + hands_check_input` (if checks were also planned).
    NeedsUser { question: String },
    /// `should_answer` or `should_run_checks`: queue this text, skip
    /// `decide_next` this batch.
    QueueNext { text: String },
    /// Neither condition held: proceed to `decide_next`.
    ProceedToDecide,
}

pub fn arbitrate(auto_answer: &AutoAnswer, check_plan: &CheckPlan) -> Arbitration {
    if auto_answer.needs_user_input {
        let question = auto_answer
            .ask_user_question
            .clone()
            .unwrap_or_else(|| "Hands is waiting on a decision — please advise.".to_string());
        return Arbitration::NeedsUser { question };
    }

    if auto_answer.should_answer || check_plan.should_run_checks {
        let mut parts = Vec::new();
        if auto_answer.should_answer {
            if let Some(answer) = &auto_answer.hands_answer_input {
                if !answer.trim().is_empty() {
                    parts.push(answer.clone());
                }
            }
        }
        if check_plan.should_run_checks {
            if let Some(checks) = &check_plan.hands_check_input {
                if !checks.trim().is_empty() {
                    parts.push(checks.clone());
                }
            }
        }
        return Arbitration::QueueNext { text: parts.join("\n\n") };
    }

    Arbitration::ProceedToDecide
}

/// Join the user's answer with any pending check input, skipping empty
/// parts (spec.md §4.4(d)).
pub fn join_answer_and_checks(answer: &str, hands_check_input: Option<&str>) -> String {
    let mut parts = Vec::new();
    if !answer.trim().is_empty() {
        parts.push(answer.to_string());
    }
    if let Some(checks) = hands_check_input {
        if !checks.trim().is_empty() {
            parts.push(checks.to_string());
        }
    }
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_like_question_detects_question_mark_and_phrases() {
        assert!(looks_like_question("Should I proceed with the migration?"));
        assert!(looks_like_question("Please confirm you want to delete this."));
        assert!(!looks_like_question("Ran the tests, all green."));
    }

    #[test]
    fn needs_check_plan_is_false_on_clean_batch() {
        assert!(!needs_check_plan(0, &[], &[], "All done.", false));
    }

    #[test]
    fn needs_check_plan_true_on_nonzero_exit() {
        assert!(needs_check_plan(1, &[], &[], "", false));
    }

    #[test]
    fn needs_check_plan_true_on_risk_signal() {
        assert!(needs_check_plan(0, &[], &["ran rm -rf".to_string()], "", false));
    }

    #[test]
    fn arbitration_needs_user_short_circuits_before_checks() {
        let auto_answer = AutoAnswer {
            needs_user_input: true,
            ask_user_question: Some("delete prod db?".to_string()),
            ..Default::default()
        };
        let plan = CheckPlan { should_run_checks: true, ..Default::default() };
        match arbitrate(&auto_answer, &plan) {
            Arbitration::NeedsUser { question } => assert_eq!(question, "delete prod db?"),
            other => panic!("expected NeedsUser, got {other:?}"),
        }
    }

    #[test]
    fn arbitration_queues_when_should_answer_or_should_run_checks() {
        let auto_answer = AutoAnswer { should_answer: true, hands_answer_input: Some("yes".to_string()), ..Default::default() };
        let plan = CheckPlan { should_run_checks: true, hands_check_input: Some("cargo test".to_string()), ..Default::default() };
        match arbitrate(&auto_answer, &plan) {
            Arbitration::QueueNext { text } => assert_eq!(text, "yes\n\ncargo test"),
            other => panic!("expected QueueNext, got {other:?}"),
        }
    }

    #[test]
    fn arbitration_proceeds_to_decide_when_clean() {
        assert_eq!(arbitrate(&AutoAnswer::default(), &CheckPlan::default()), Arbitration::ProceedToDecide);
    }

    #[test]
    fn join_answer_and_checks_skips_empty_parts() {
        assert_eq!(join_answer_and_checks("run smoke test", None), "run smoke test");
        assert_eq!(join_answer_and_checks("", Some("cargo test")), "cargo test");
        assert_eq!(join_answer_and_checks("", None), "");
    }
}
