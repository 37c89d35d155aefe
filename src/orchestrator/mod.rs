//! The batch orchestrator: wires Hands, Mind, pre-action arbitration,
//! loop-guard, checkpoint mining and run-end consolidation into the single
//! loop `mi run <task>` drives (spec.md §4.9).
//!
//! Grounded on `src/agent/mod.rs`'s turn loop (spawn a tool, read its
//! result, feed it back to the model, repeat until a terminal state),
//! generalized from one model turn per tool call to one Mind consultation
//! per Hands batch, with the extra pre-action/risk/checkpoint phases
//! spec.md §4 adds around that core cadence.

use crate::checkpoint::{self, CheckpointContext};
use crate::config::{Config, MemoryBackendKind, MindProviderKind};
use crate::hands::{self, HandsInvocation};
use crate::ids;
use crate::loopguard::{self, LoopBreakOutcome, LoopGuard};
use crate::memory_recall::{InMemoryBackend, MemoryBackend, SqliteBackend};
use crate::mind::{self, record_mind_failure, MindCallState, MindMediator, MindProvider};
use crate::paths::{identity_key_for_root, GlobalPaths, ProjectIndex, ProjectPaths};
use crate::preaction::{self, Arbitration};
use crate::risk::{self, RiskContext};
use crate::run_end::{self, RunEndContext};
use crate::store::{
    ClaimType, EvidenceKind, EvidenceLog, EvidenceRecord, ProjectOverlay, SegmentRecord, SegmentState,
    ThoughtDb, ThoughtDbStore, Visibility,
};
use crate::workflow::{self, WorkflowRegistry};
use anyhow::Result;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Everything a caller supplies for one `mi run` invocation.
pub struct RunRequest<'a> {
    pub task: &'a str,
    pub project_root: &'a Path,
    pub max_batches: Option<u64>,
    /// One-time answer to the testless-verification-strategy question
    /// (spec.md §4.4(b)); only consulted the first time a project needs it.
    pub testless_strategy_answer: Option<&'a str>,
}

/// Final state of a run (spec.md §4.9). `status` mirrors `decide_next`'s own
/// vocabulary (`done` / `not_done` / `blocked`) plus the orchestrator's own
/// `blocked` reasons (needs-user, high-severity risk, loop-break stop).
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub status: String,
    pub next_action: String,
    pub batches_run: u64,
    pub thread_id: String,
    pub ask_user_question: Option<String>,
}

impl RunOutcome {
    /// Mirrors `original_source/mi/cli.py`'s `run` exit code: 0 only on `done`.
    pub fn exit_code(&self) -> i32 {
        if self.status == "done" {
            0
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EvidenceItemResponse {
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
    #[serde(default)]
    transcript_observation: Option<String>,
    #[serde(default)]
    repo_observation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LearnSuggestedItem {
    scope: String,
    text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DecideNextResponse {
    next_action: String,
    status: String,
    confidence: f64,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    next_hands_input: Option<String>,
    #[serde(default)]
    ask_user_question: Option<String>,
    #[serde(default)]
    update_project_overlay: serde_json::Value,
    #[serde(default)]
    learn_suggested: Vec<LearnSuggestedItem>,
}

/// Drive one full run: resolve the project, seed/resolve operational
/// defaults, match a workflow trigger, then loop Hands batches until a
/// terminal `decide_next` status, a loop-break stop, a high-severity risk
/// pause, a need-user pause, or `max_batches` is exhausted.
pub async fn run(req: RunRequest<'_>) -> Result<RunOutcome> {
    let config = crate::config::load_config()?;

    let global = GlobalPaths::new()?;
    global.ensure_all()?;

    let (git_origin, git_commit) = git_identity(req.project_root);
    let identity_key = identity_key_for_root(req.project_root, git_origin.as_deref(), git_commit.as_deref(), "");
    let mut project_index = ProjectIndex::load(&global.project_index_json())?;
    let project_id = project_index.resolve_or_create(&global.project_index_json(), &identity_key)?;

    let project_paths = ProjectPaths::new(&global, &project_id);
    project_paths.ensure_all()?;

    let mut overlay = ProjectOverlay::load_or_init(
        &project_paths.overlay_json(),
        &project_id,
        &req.project_root.to_string_lossy(),
        &identity_key,
    )?;

    let evidence_log = EvidenceLog::new(project_paths.evidence_jsonl());
    let thoughtdb_store =
        ThoughtDbStore::new(project_id.clone(), project_paths.thoughtdb_dir(), global.global_thoughtdb_dir());
    let workflow_registry = WorkflowRegistry::new(project_paths.workflows_dir(), global.global_workflows_dir());
    let mut segment = SegmentState::load_or_default(&project_paths.segment_state_json())?;

    let mind_provider = build_mind_provider(&config)?;
    let mediator = MindMediator::new(mind_provider, project_paths.mind_transcripts_dir());
    let hands_provider = hands::provider_for_name(&config.hands)?;
    let memory = build_memory_backend(&config, &global)?;

    let defaults = resolve_and_seed_operational_defaults(&thoughtdb_store, &evidence_log, &config, "b0")?;
    info!(ask_when_uncertain = defaults.ask_when_uncertain, refactor_intent = %defaults.refactor_intent, "resolved operational defaults");

    let mut first_batch_marker: Option<String> = None;
    if !overlay.workflow_run.active {
        let workflows = workflow_registry.effective()?;
        if let Some(matched) = workflow::match_trigger(&workflows, req.task) {
            workflow::apply_trigger(&mut overlay.workflow_run, &matched);
            first_batch_marker = Some(workflow::trigger_marker(&matched));
            evidence_log.append(EvidenceRecord::new(
                "b0",
                overlay.hands_state.thread_id.clone().unwrap_or_default(),
                EvidenceKind::WorkflowTrigger {
                    workflow_id: matched.workflow_id,
                    workflow_name: matched.workflow_name,
                    trigger_pattern: matched.trigger_pattern,
                },
            ))?;
        }
    }

    if config.hands.reset_hands {
        overlay.hands_state.thread_id = None;
    }

    let max_batches = req.max_batches.unwrap_or(config.max_batches).max(1);
    let mut loop_guard = LoopGuard::new();
    let mut pending_hands_input = req.task.to_string();
    let mut batches_run = 0u64;
    let mut outcome = RunOutcome { status: "not_done".to_string(), next_action: "max_batches_reached".to_string(), ..Default::default() };

    for n in 1..=max_batches {
        let batch_id = ids::batch_id(n);
        batches_run = n;

        let thread_id_before = overlay.hands_state.thread_id.clone().unwrap_or_default();
        let prompt_sha = sha256_hex(&pending_hands_input);
        let transcript_path = project_paths.hands_transcripts_dir().join(format!("{batch_id}.jsonl"));

        let light_injection = if n == 1 { first_batch_marker.clone() } else { None };
        evidence_log.append(EvidenceRecord::new(
            &batch_id,
            &thread_id_before,
            EvidenceKind::HandsInput {
                input: pending_hands_input.clone(),
                light_injection: light_injection.clone(),
                prompt_sha256: prompt_sha,
                transcript_path: transcript_path.to_string_lossy().to_string(),
            },
        ))?;

        let hands_input_for_run = match &light_injection {
            Some(marker) => format!("{marker}\n\n{pending_hands_input}"),
            None => pending_hands_input.clone(),
        };

        let hands_result = {
            let invocation = HandsInvocation {
                prompt: &hands_input_for_run,
                project_root: req.project_root,
                transcript_path: &transcript_path,
                interrupt_cfg: config.hands.interrupt.clone(),
            };
            if config.hands.continue_hands {
                if let Some(thread_id) = overlay.hands_state.thread_id.clone() {
                    match hands_provider.resume(&thread_id, invocation).await {
                        Ok(r) => r,
                        Err(e) => {
                            evidence_log.append(EvidenceRecord::new(
                                &batch_id,
                                &thread_id,
                                EvidenceKind::HandsResumeFailed { thread_id: thread_id.clone(), error: e.to_string() },
                            ))?;
                            let fallback = HandsInvocation {
                                prompt: &hands_input_for_run,
                                project_root: req.project_root,
                                transcript_path: &transcript_path,
                                interrupt_cfg: config.hands.interrupt.clone(),
                            };
                            hands_provider.exec(fallback).await?
                        }
                    }
                } else {
                    hands_provider.exec(invocation).await?
                }
            } else {
                hands_provider.exec(invocation).await?
            }
        };

        overlay.hands_state.provider = Some(hands_provider.name().to_string());
        if !hands_result.thread_id.is_empty() {
            overlay.hands_state.thread_id = Some(hands_result.thread_id.clone());
        }
        overlay.hands_state.updated_ts = Some(ids::now_rfc3339());
        let thread_id = overlay.hands_state.thread_id.clone().unwrap_or_default();
        segment.reset_for_thread(&thread_id);

        let transcript_text = std::fs::read_to_string(&hands_result.raw_transcript_path).unwrap_or_default();

        // --- extract_evidence ---
        let extract_prompt = format!(
            "Hands input:\n{hands_input_for_run}\n\nHands exit code: {}\nLast agent message:\n{}\n\nRaw transcript (tail):\n{}",
            hands_result.exit_code,
            hands_result.last_agent_message,
            truncate_tail(&transcript_text, 8000),
        );
        let extract_outcome = mediator.call("extract_evidence", &extract_prompt, "extract_evidence", &batch_id).await;
        let evidence_item = match (extract_outcome.state, extract_outcome.value) {
            (MindCallState::Ok, Some(v)) => match serde_json::from_value::<EvidenceItemResponse>(v) {
                Ok(r) => r,
                Err(_) => {
                    record_mind_failure(
                        &evidence_log, &batch_id, &thread_id, "extract_evidence", "extract_evidence",
                        MindCallState::Error, &extract_outcome.transcript_path, Some("response did not match schema".to_string()),
                    )?;
                    EvidenceItemResponse::default()
                }
            },
            (state, _) => {
                record_mind_failure(&evidence_log, &batch_id, &thread_id, "extract_evidence", "extract_evidence", state, &extract_outcome.transcript_path, extract_outcome.error)?;
                EvidenceItemResponse::default()
            }
        };
        let evidence_record = evidence_log.append(EvidenceRecord::new(
            &batch_id,
            &thread_id,
            EvidenceKind::Evidence {
                facts: evidence_item.facts.clone(),
                actions: evidence_item.actions.clone(),
                results: evidence_item.results.clone(),
                unknowns: evidence_item.unknowns.clone(),
                risk_signals: evidence_item.risk_signals.clone(),
                transcript_observation: evidence_item.transcript_observation.clone(),
                repo_observation: evidence_item.repo_observation.clone(),
                mind_transcript_ref: Some(extract_outcome.transcript_path.clone()),
            },
        ))?;
        segment.push(
            SegmentRecord {
                event_id: evidence_record.event_id.clone().unwrap_or_default(),
                kind: "evidence".to_string(),
                summary: evidence_item.facts.first().cloned().unwrap_or_else(|| "no new facts".to_string()),
            },
            config.segment_max_records,
        );

        // --- workflow progress (spec.md §2: runs right after evidence
        // extraction, unconditionally once per active-workflow batch) ---
        if overlay.workflow_run.active {
            let workflow_progress_prompt = format!(
                "Hands exit code: {}\nLast agent message:\n{}\n\nEvidence this batch — facts: {:?}; actions: {:?}; results: {:?}; unknowns: {:?}.",
                hands_result.exit_code, hands_result.last_agent_message,
                evidence_item.facts, evidence_item.actions, evidence_item.results, evidence_item.unknowns,
            );
            advance_workflow_progress(&mediator, &batch_id, &mut overlay, &workflow_progress_prompt, &evidence_log, &thread_id).await?;
        }

        // --- risk ---
        let risk_signals = risk::effective_risk_signals(&evidence_item.risk_signals, &transcript_text);
        let risk_ctx = RiskContext {
            mediator: &mediator,
            batch_id: &batch_id,
            thread_id: &thread_id,
            evidence_log: &evidence_log,
            project_thoughtdb: &thoughtdb_store.project,
            violation_response: &config.violation_response,
        };
        let risk_prompt = format!("Risk signals detected this batch:\n{}", risk_signals.join("\n"));
        let risk_outcome = risk::process_risk(&risk_ctx, &risk_signals, &risk_prompt).await?;
        if risk_outcome.should_prompt_user {
            outcome = RunOutcome {
                status: "blocked".to_string(),
                next_action: "ask_user".to_string(),
                batches_run,
                thread_id: thread_id.clone(),
                ask_user_question: Some(format!(
                    "High-severity risk detected ({}). Confirm before continuing.",
                    risk_outcome.category.clone().unwrap_or_default()
                )),
            };
            overlay.save(&project_paths.overlay_json())?;
            segment.save(&project_paths.segment_state_json())?;
            return finish_run(&mediator, &batch_id, &thread_id, &project_id, &config, &evidence_log, &thoughtdb_store, memory.as_ref(), outcome).await;
        }

        // --- pre-action ---
        let unknowns = evidence_item.unknowns.clone();
        let git_dirty = git_status_nonempty(req.project_root);
        let preaction_prompt = format!(
            "Last Hands message:\n{}\n\nUnknowns: {:?}\nRisk signals: {:?}\nExit code: {}",
            hands_result.last_agent_message, unknowns, risk_signals, hands_result.exit_code
        );
        let (check_plan, _) = preaction::plan_min_checks(
            &mediator, &batch_id, hands_result.exit_code, &unknowns, &risk_signals,
            &hands_result.last_agent_message, git_dirty, &preaction_prompt, &evidence_log, &thread_id,
        ).await?;
        evidence_log.append(EvidenceRecord::new(
            &batch_id, &thread_id,
            EvidenceKind::CheckPlan {
                should_run_checks: check_plan.should_run_checks,
                needs_testless_strategy: check_plan.needs_testless_strategy,
                hands_check_input: check_plan.hands_check_input.clone(),
                notes: check_plan.notes.clone(),
            },
        ))?;

        if check_plan.needs_testless_strategy {
            let project_view = thoughtdb_store.project.load_view()?;
            let already_resolved = preaction::sync_testless_strategy_from_claims(&mut overlay, &project_view);
            if !already_resolved {
                if let Some(answer) = req.testless_strategy_answer {
                    let source_id = evidence_record.event_id.clone().unwrap_or_default();
                    preaction::canonicalize_testless_strategy(&thoughtdb_store.project, &mut overlay, answer, &source_id)?;
                } else {
                    outcome = RunOutcome {
                        status: "blocked".to_string(),
                        next_action: "ask_user".to_string(),
                        batches_run,
                        thread_id: thread_id.clone(),
                        ask_user_question: Some(
                            "This project has no verification strategy on record yet. What should I do when there is no test suite to run?".to_string(),
                        ),
                    };
                    overlay.save(&project_paths.overlay_json())?;
                    segment.save(&project_paths.segment_state_json())?;
                    return finish_run(&mediator, &batch_id, &thread_id, &project_id, &config, &evidence_log, &thoughtdb_store, memory.as_ref(), outcome).await;
                }
            }
        }

        let (auto_answer, _) = preaction::auto_answer_to_hands(
            &mediator, &batch_id, &hands_result.last_agent_message, &preaction_prompt, &evidence_log, &thread_id,
        ).await?;
        // Only append `auto_answer` when the pre-action phase actually
        // consulted Mind for it (spec.md §4.4(c), §8 scenario 1: a clean
        // batch emits no `auto_answer` record at all).
        if preaction::looks_like_question(&hands_result.last_agent_message) {
            evidence_log.append(EvidenceRecord::new(
                &batch_id, &thread_id,
                EvidenceKind::AutoAnswer {
                    should_answer: auto_answer.should_answer,
                    hands_answer_input: auto_answer.hands_answer_input.clone(),
                    needs_user_input: auto_answer.needs_user_input,
                    ask_user_question: auto_answer.ask_user_question.clone(),
                    unanswered_questions: auto_answer.unanswered_questions.clone(),
                },
            ))?;
        }

        let arbitration = preaction::arbitrate(&auto_answer, &check_plan);
        let next_candidate = match &arbitration {
            Arbitration::NeedsUser { question } => question.clone(),
            Arbitration::QueueNext { text } => text.clone(),
            Arbitration::ProceedToDecide => String::new(),
        };

        if let Some(pattern) = loop_guard.push(&hands_result.last_agent_message, &next_candidate) {
            evidence_log.append(EvidenceRecord::new(
                &batch_id, &thread_id,
                EvidenceKind::LoopGuard { pattern: pattern.as_str().to_string(), reason: "repeating tail pattern detected".to_string() },
            ))?;
            let (loop_outcome, _) =
                loopguard::handle_loop_detected(&mediator, &batch_id, config.ask_when_uncertain, &preaction_prompt).await;
            let (action_str, new_instruction) = match &loop_outcome {
                LoopBreakOutcome::Stop => ("stop".to_string(), None),
                LoopBreakOutcome::RunChecksThenContinue { hands_check_input } => ("run_checks_then_continue".to_string(), hands_check_input.clone()),
                LoopBreakOutcome::SendNewInstruction { text } => ("send_new_instruction".to_string(), Some(text.clone())),
                LoopBreakOutcome::AskUser { question } => ("ask_user".to_string(), Some(question.clone())),
                LoopBreakOutcome::Blocked => ("blocked".to_string(), None),
            };
            evidence_log.append(EvidenceRecord::new(
                &batch_id, &thread_id,
                EvidenceKind::LoopBreak { action: action_str.clone(), new_instruction: new_instruction.clone() },
            ))?;
            match loop_outcome {
                LoopBreakOutcome::Stop => {
                    outcome = RunOutcome { status: "blocked".to_string(), next_action: "stop".to_string(), batches_run, thread_id: thread_id.clone(), ask_user_question: None };
                    overlay.save(&project_paths.overlay_json())?;
                    segment.save(&project_paths.segment_state_json())?;
                    return finish_run(&mediator, &batch_id, &thread_id, &project_id, &config, &evidence_log, &thoughtdb_store, memory.as_ref(), outcome).await;
                }
                LoopBreakOutcome::Blocked => {
                    outcome = RunOutcome { status: "blocked".to_string(), next_action: "loop_blocked".to_string(), batches_run, thread_id: thread_id.clone(), ask_user_question: None };
                    overlay.save(&project_paths.overlay_json())?;
                    segment.save(&project_paths.segment_state_json())?;
                    return finish_run(&mediator, &batch_id, &thread_id, &project_id, &config, &evidence_log, &thoughtdb_store, memory.as_ref(), outcome).await;
                }
                LoopBreakOutcome::AskUser { question } => {
                    outcome = RunOutcome { status: "blocked".to_string(), next_action: "ask_user".to_string(), batches_run, thread_id: thread_id.clone(), ask_user_question: Some(question) };
                    overlay.save(&project_paths.overlay_json())?;
                    segment.save(&project_paths.segment_state_json())?;
                    return finish_run(&mediator, &batch_id, &thread_id, &project_id, &config, &evidence_log, &thoughtdb_store, memory.as_ref(), outcome).await;
                }
                LoopBreakOutcome::SendNewInstruction { text } => {
                    pending_hands_input = text;
                    overlay.save(&project_paths.overlay_json())?;
                    segment.save(&project_paths.segment_state_json())?;
                    continue;
                }
                LoopBreakOutcome::RunChecksThenContinue { hands_check_input } => {
                    pending_hands_input = hands_check_input.unwrap_or(next_candidate);
                    overlay.save(&project_paths.overlay_json())?;
                    segment.save(&project_paths.segment_state_json())?;
                    continue;
                }
            }
        }

        match arbitration {
            Arbitration::NeedsUser { question } => {
                outcome = RunOutcome { status: "blocked".to_string(), next_action: "ask_user".to_string(), batches_run, thread_id: thread_id.clone(), ask_user_question: Some(question) };
                overlay.save(&project_paths.overlay_json())?;
                segment.save(&project_paths.segment_state_json())?;
                return finish_run(&mediator, &batch_id, &thread_id, &project_id, &config, &evidence_log, &thoughtdb_store, memory.as_ref(), outcome).await;
            }
            Arbitration::QueueNext { text } => {
                pending_hands_input = text;
                maybe_checkpoint(&mediator, &batch_id, &thread_id, &config, &evidence_log, &thoughtdb_store, &workflow_registry, &project_paths, &mut segment, &mut overlay).await?;
                overlay.save(&project_paths.overlay_json())?;
                segment.save(&project_paths.segment_state_json())?;
                continue;
            }
            Arbitration::ProceedToDecide => {
                let decide_prompt = format!(
                    "{preaction_prompt}\n\nEvidence this batch — facts: {:?}; actions: {:?}; results: {:?}; unknowns: {:?}.\nDecide the next action.",
                    evidence_item.facts, evidence_item.actions, evidence_item.results, evidence_item.unknowns
                );
                let decide_outcome = mediator.call("decide_next", &decide_prompt, "decide_next", &batch_id).await;
                let decision = match (decide_outcome.state, decide_outcome.value) {
                    (MindCallState::Ok, Some(v)) => match serde_json::from_value::<DecideNextResponse>(v) {
                        Ok(d) => d,
                        Err(_) => {
                            record_mind_failure(&evidence_log, &batch_id, &thread_id, "decide_next", "decide_next", MindCallState::Error, &decide_outcome.transcript_path, Some("response did not match schema".to_string()))?;
                            DecideNextResponse { next_action: "ask_user".to_string(), status: "blocked".to_string(), confidence: 0.0, ..Default::default() }
                        }
                    },
                    (state, _) => {
                        record_mind_failure(&evidence_log, &batch_id, &thread_id, "decide_next", "decide_next", state, &decide_outcome.transcript_path, decide_outcome.error)?;
                        DecideNextResponse { next_action: "ask_user".to_string(), status: "blocked".to_string(), confidence: 0.0, ..Default::default() }
                    }
                };

                evidence_log.append(EvidenceRecord::new(
                    &batch_id, &thread_id,
                    EvidenceKind::DecideNext {
                        next_action: decision.next_action.clone(),
                        status: decision.status.clone(),
                        confidence: decision.confidence,
                        notes: decision.notes.clone(),
                        next_hands_input: decision.next_hands_input.clone(),
                        ask_user_question: decision.ask_user_question.clone(),
                        update_project_overlay: decision.update_project_overlay.clone(),
                        learn_suggested: decision.learn_suggested.iter().map(|i| serde_json::json!({"scope": i.scope, "text": i.text})).collect(),
                    },
                ))?;

                apply_overlay_patch(&mut overlay, &decision.update_project_overlay);
                if config.mining.pref_auto_mine && !decision.learn_suggested.is_empty() {
                    apply_decide_learn_suggested(&thoughtdb_store, &evidence_log, &batch_id, &thread_id, &decision.learn_suggested)?;
                }

                segment.push(
                    SegmentRecord {
                        event_id: ids::new_event_id(),
                        kind: "decide_next".to_string(),
                        summary: format!("{}:{} conf={:.2}", decision.status, decision.next_action, decision.confidence),
                    },
                    config.segment_max_records,
                );

                maybe_checkpoint(&mediator, &batch_id, &thread_id, &config, &evidence_log, &thoughtdb_store, &workflow_registry, &project_paths, &mut segment, &mut overlay).await?;

                overlay.save(&project_paths.overlay_json())?;
                segment.save(&project_paths.segment_state_json())?;

                match decision.next_action.as_str() {
                    "stop" => {
                        outcome = RunOutcome { status: decision.status.clone(), next_action: decision.next_action.clone(), batches_run, thread_id: thread_id.clone(), ask_user_question: None };
                        return finish_run(&mediator, &batch_id, &thread_id, &project_id, &config, &evidence_log, &thoughtdb_store, memory.as_ref(), outcome).await;
                    }
                    "ask_user" => {
                        outcome = RunOutcome { status: "blocked".to_string(), next_action: "ask_user".to_string(), batches_run, thread_id: thread_id.clone(), ask_user_question: decision.ask_user_question.clone() };
                        return finish_run(&mediator, &batch_id, &thread_id, &project_id, &config, &evidence_log, &thoughtdb_store, memory.as_ref(), outcome).await;
                    }
                    _ => {
                        if decision.status == "done" || decision.status == "blocked" {
                            outcome = RunOutcome { status: decision.status.clone(), next_action: decision.next_action.clone(), batches_run, thread_id: thread_id.clone(), ask_user_question: None };
                            return finish_run(&mediator, &batch_id, &thread_id, &project_id, &config, &evidence_log, &thoughtdb_store, memory.as_ref(), outcome).await;
                        }
                        pending_hands_input = decision.next_hands_input.clone().unwrap_or_else(|| "Continue.".to_string());
                    }
                }
            }
        }
    }

    let final_batch_id = ids::batch_id(batches_run.max(1));
    let final_thread_id = overlay.hands_state.thread_id.clone().unwrap_or_default();
    finish_run(&mediator, &final_batch_id, &final_thread_id, &project_id, &config, &evidence_log, &thoughtdb_store, memory.as_ref(), outcome).await
}

/// Run the run-end pipeline once, at any terminal exit point, then return
/// the outcome unchanged (spec.md §4.8: run-end fires once per run, not
/// once per batch).
async fn finish_run(
    mediator: &MindMediator,
    batch_id: &str,
    thread_id: &str,
    project_id: &str,
    config: &Config,
    evidence_log: &EvidenceLog,
    thoughtdb_store: &ThoughtDbStore,
    memory: &dyn MemoryBackend,
    outcome: RunOutcome,
) -> Result<RunOutcome> {
    let allowed_event_ids = collect_all_event_ids(evidence_log)?;
    let summary = format!("Run ended with status={} next_action={}", outcome.status, outcome.next_action);
    let ctx = RunEndContext {
        mediator,
        batch_id,
        thread_id,
        project_id,
        config: &config.run_end,
        evidence_log,
        thoughtdb_store,
        memory: Some(memory),
        allowed_event_ids: &allowed_event_ids,
    };
    match run_end::run_end_pipeline(&ctx, &summary).await {
        Ok(result) => info!(?result, "run-end pipeline complete"),
        Err(e) => warn!(error = %e, "run-end pipeline failed"),
    }
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn maybe_checkpoint(
    mediator: &MindMediator,
    batch_id: &str,
    thread_id: &str,
    config: &Config,
    evidence_log: &EvidenceLog,
    thoughtdb_store: &ThoughtDbStore,
    workflow_registry: &WorkflowRegistry,
    project_paths: &ProjectPaths,
    segment: &mut SegmentState,
    overlay: &mut ProjectOverlay,
) -> Result<()> {
    let allowed_event_ids = collect_all_event_ids(evidence_log)?;
    let ctx = CheckpointContext {
        mediator,
        batch_id,
        thread_id,
        mining: &config.mining,
        evidence_log,
        thoughtdb_store,
        workflow_registry,
        candidates_dir: &project_paths.candidates_dir(),
        allowed_event_ids: &allowed_event_ids,
    };
    let result = checkpoint::run_checkpoint_pipeline(ctx, segment, overlay.last_checkpoint_key.as_deref()).await?;
    if result.checkpointed {
        if let Some(kind) = &result.checkpoint_kind {
            overlay.last_checkpoint_key = Some(checkpoint::checkpoint_key(batch_id, kind));
        }
    }
    Ok(())
}

async fn advance_workflow_progress(
    mediator: &MindMediator,
    batch_id: &str,
    overlay: &mut ProjectOverlay,
    context_prompt: &str,
    evidence_log: &EvidenceLog,
    thread_id: &str,
) -> Result<()> {
    let (applied, _) =
        workflow::advance_workflow(mediator, batch_id, &mut overlay.workflow_run, context_prompt, evidence_log, thread_id).await?;
    evidence_log.append(EvidenceRecord::new(
        batch_id,
        thread_id,
        EvidenceKind::WorkflowProgress {
            workflow_id: overlay.workflow_run.workflow_id.clone().unwrap_or_default(),
            completed_step_ids: applied.completed_step_ids,
            next_step_id: applied.next_step_id,
        },
    ))?;
    Ok(())
}

fn apply_overlay_patch(overlay: &mut ProjectOverlay, patch: &serde_json::Value) {
    let Some(obj) = patch.as_object() else { return };
    let merge = |field: &mut Vec<String>, key: &str| {
        if let Some(arr) = obj.get(key).and_then(|v| v.as_array()) {
            for v in arr {
                if let Some(s) = v.as_str() {
                    if !field.contains(&s.to_string()) {
                        field.push(s.to_string());
                    }
                }
            }
        }
    };
    merge(&mut overlay.host_bindings, "host_bindings");
    merge(&mut overlay.stack_hints, "stack_hints");
    merge(&mut overlay.global_workflow_overrides, "global_workflow_overrides");
}

/// `decide_next.learn_suggested` entries are Mind's routine preference
/// capture, gated on `mining.pref_auto_mine` rather than
/// `violation_response.auto_learn` (which governs risk-violation learning
/// only; see DESIGN.md).
fn apply_decide_learn_suggested(
    thoughtdb_store: &ThoughtDbStore,
    evidence_log: &EvidenceLog,
    batch_id: &str,
    thread_id: &str,
    entries: &[LearnSuggestedItem],
) -> Result<Vec<String>> {
    let mut applied = Vec::new();
    for item in entries {
        let (db, visibility): (&ThoughtDb, Visibility) = if item.scope == "global" {
            (&thoughtdb_store.global, Visibility::Global)
        } else {
            (&thoughtdb_store.project, Visibility::Project)
        };
        let claim_id = db.append_claim_create(
            ClaimType::Preference,
            &item.text,
            visibility,
            None,
            None,
            vec!["mi:decide_next_learned".to_string()],
            vec![],
            0.7,
            "learned via decide_next".to_string(),
        )?;
        evidence_log.append(EvidenceRecord::new(
            batch_id,
            thread_id,
            EvidenceKind::LearnSuggested {
                source: "decide_next".to_string(),
                auto_learn: true,
                learn_suggested: serde_json::json!({"scope": item.scope, "text": item.text}),
                applied_claim_ids: vec![claim_id.clone()],
            },
        ))?;
        applied.push(claim_id);
    }
    Ok(applied)
}

/// Resolved view of `ask_when_uncertain`/`refactor_intent` (spec.md §4's
/// Thought DB View + Operational Defaults component): project-tagged
/// preference claims win over global ones, which win over `config.json`'s
/// hard defaults. The first run for a project that has neither seeds both
/// as project-scope preference claims, recorded once via an idempotent
/// `mi_defaults_set` EvidenceLog marker.
pub struct OperationalDefaults {
    pub ask_when_uncertain: bool,
    pub refactor_intent: String,
}

const TAG_ASK_WHEN_UNCERTAIN: &str = "mi:ask_when_uncertain";
const TAG_REFACTOR_INTENT: &str = "mi:refactor_intent";

fn resolve_and_seed_operational_defaults(
    thoughtdb_store: &ThoughtDbStore,
    evidence_log: &EvidenceLog,
    config: &Config,
    batch_id: &str,
) -> Result<OperationalDefaults> {
    let project_view = thoughtdb_store.project.load_view()?;
    let global_view = thoughtdb_store.global.load_view()?;

    let ask_claim = project_view
        .claims_tagged(TAG_ASK_WHEN_UNCERTAIN)
        .first()
        .or_else(|| global_view.claims_tagged(TAG_ASK_WHEN_UNCERTAIN).first())
        .copied();
    let refactor_claim = project_view
        .claims_tagged(TAG_REFACTOR_INTENT)
        .first()
        .or_else(|| global_view.claims_tagged(TAG_REFACTOR_INTENT).first())
        .copied();

    if ask_claim.is_none() && refactor_claim.is_none() {
        let already_seeded = evidence_log
            .iter()?
            .iter()
            .any(|r| matches!(r.kind, EvidenceKind::MiDefaultsSet { .. }));
        if !already_seeded {
            thoughtdb_store.project.append_claim_create(
                ClaimType::Preference,
                if config.ask_when_uncertain { "true" } else { "false" },
                Visibility::Project,
                None,
                None,
                vec![TAG_ASK_WHEN_UNCERTAIN.to_string()],
                vec![],
                1.0,
                "seeded from config.json default on first run".to_string(),
            )?;
            thoughtdb_store.project.append_claim_create(
                ClaimType::Preference,
                &config.refactor_intent,
                Visibility::Project,
                None,
                None,
                vec![TAG_REFACTOR_INTENT.to_string()],
                vec![],
                1.0,
                "seeded from config.json default on first run".to_string(),
            )?;
            evidence_log.append(EvidenceRecord::new(
                batch_id,
                "",
                EvidenceKind::MiDefaultsSet {
                    ask_when_uncertain: config.ask_when_uncertain,
                    refactor_intent: config.refactor_intent.clone(),
                    testless_verification_strategy: None,
                },
            ))?;
        }
        return Ok(OperationalDefaults { ask_when_uncertain: config.ask_when_uncertain, refactor_intent: config.refactor_intent.clone() });
    }

    let ask_when_uncertain = ask_claim.map(|c| c.text.trim() == "true").unwrap_or(config.ask_when_uncertain);
    let refactor_intent = refactor_claim.map(|c| c.text.clone()).unwrap_or_else(|| config.refactor_intent.clone());
    Ok(OperationalDefaults { ask_when_uncertain, refactor_intent })
}

fn build_mind_provider(config: &Config) -> Result<Box<dyn MindProvider>> {
    let name = match config.mind.provider {
        MindProviderKind::CodexSchema => "codex_schema",
        MindProviderKind::OpenaiCompatible => "openai_compatible",
        MindProviderKind::Anthropic => "anthropic",
    };
    let api_key = match config.mind.provider {
        MindProviderKind::CodexSchema => String::new(),
        _ => crate::config::resolve_mind_api_key(&config.mind)?,
    };
    mind::provider_for_name(name, config.mind.model.clone(), api_key, config.mind.base_url.clone(), config.mind.timeout_s)
}

fn build_memory_backend(config: &Config, global: &GlobalPaths) -> Result<Box<dyn MemoryBackend>> {
    Ok(match config.memory_backend {
        MemoryBackendKind::InMemory => Box::new(InMemoryBackend::new()),
        MemoryBackendKind::SqliteFts => Box::new(SqliteBackend::open(&global.memory_sqlite())?),
    })
}

fn collect_all_event_ids(evidence_log: &EvidenceLog) -> Result<HashSet<String>> {
    Ok(evidence_log.iter()?.into_iter().filter_map(|r| r.event_id).collect())
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

fn truncate_tail(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        text.to_string()
    } else {
        chars[chars.len() - max_chars..].iter().collect()
    }
}

/// Best-effort `git remote get-url origin` / `git rev-parse HEAD`, used only
/// to stabilize project identity across directory renames (spec.md §3).
pub(crate) fn git_identity(root: &Path) -> (Option<String>, Option<String>) {
    let run = |args: &[&str]| -> Option<String> {
        let output = std::process::Command::new("git").arg("-C").arg(root).args(args).output().ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    };
    (run(&["remote", "get-url", "origin"]), run(&["rev-parse", "HEAD"]))
}

fn git_status_nonempty(root: &Path) -> bool {
    std::process::Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["status", "--porcelain"])
        .output()
        .map(|o| o.status.success() && !o.stdout.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_deterministic() {
        assert_eq!(sha256_hex("hello"), sha256_hex("hello"));
        assert_ne!(sha256_hex("hello"), sha256_hex("world"));
    }

    #[test]
    fn truncate_tail_keeps_only_the_last_n_chars() {
        let long = "x".repeat(100);
        assert_eq!(truncate_tail(&long, 10).len(), 10);
        assert_eq!(truncate_tail("short", 10), "short");
    }

    #[test]
    fn apply_overlay_patch_merges_without_duplicates() {
        let mut overlay = ProjectOverlay::default();
        overlay.stack_hints.push("rust".to_string());
        let patch = serde_json::json!({"stack_hints": ["rust", "postgres"]});
        apply_overlay_patch(&mut overlay, &patch);
        assert_eq!(overlay.stack_hints, vec!["rust".to_string(), "postgres".to_string()]);
    }

    #[test]
    fn resolve_and_seed_operational_defaults_seeds_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThoughtDbStore::new("p1", dir.path().join("project/thoughtdb"), dir.path().join("global/thoughtdb"));
        let log = EvidenceLog::new(dir.path().join("evidence.jsonl"));
        let config = Config::default();

        let first = resolve_and_seed_operational_defaults(&store, &log, &config, "b0").unwrap();
        assert_eq!(first.ask_when_uncertain, config.ask_when_uncertain);
        assert_eq!(first.refactor_intent, config.refactor_intent);

        let seeded_count = log.iter().unwrap().iter().filter(|r| matches!(r.kind, EvidenceKind::MiDefaultsSet { .. })).count();
        assert_eq!(seeded_count, 1);

        let second = resolve_and_seed_operational_defaults(&store, &log, &config, "b0").unwrap();
        assert_eq!(second.ask_when_uncertain, config.ask_when_uncertain);
        let seeded_count_again = log.iter().unwrap().iter().filter(|r| matches!(r.kind, EvidenceKind::MiDefaultsSet { .. })).count();
        assert_eq!(seeded_count_again, 1, "mi_defaults_set must not be re-emitted once claims exist");
    }
}
