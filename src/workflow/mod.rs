//! Workflow registry (project + global), trigger matching at run start, and
//! per-batch progress application (spec.md §4.6). Workflows are one JSON
//! file per id under `workflows/wf_*.json` — plain files, not an append
//! stream, since a workflow is edited/overridden as a whole unit.
//!
//! Grounded on `src/agent/backlog.rs`'s per-item JSON file layout (one file
//! per backlog entry, loaded by directory scan), generalized to workflow
//! definitions with project-over-global override precedence.

use crate::mind::{record_mind_failure, MindCallState, MindMediator};
use crate::store::{EvidenceLog, WorkflowRun};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    TaskContains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    pub mode: TriggerMode,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub trigger: WorkflowTrigger,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

fn default_true() -> bool {
    true
}

fn load_all_workflows(dir: &Path) -> Result<Vec<Workflow>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let contents = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        if contents.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Workflow>(&contents) {
            Ok(wf) => out.push(wf),
            Err(_) => continue,
        }
    }
    Ok(out)
}

fn save_workflow(dir: &Path, workflow: &Workflow) -> Result<()> {
    let path = dir.join(format!("{}.json", workflow.workflow_id));
    crate::store::atomic_write_json(&path, workflow)
}

/// Effective registry: `project ∪ (global with project overrides applied)`.
/// Project precedence: same `workflow_id` in both → project record wins
/// entirely (spec.md §4.6).
pub struct WorkflowRegistry {
    pub project_dir: PathBuf,
    pub global_dir: PathBuf,
}

impl WorkflowRegistry {
    pub fn new(project_dir: impl Into<PathBuf>, global_dir: impl Into<PathBuf>) -> Self {
        Self { project_dir: project_dir.into(), global_dir: global_dir.into() }
    }

    /// The merged, enabled set used for trigger matching and progress.
    pub fn effective(&self) -> Result<Vec<Workflow>> {
        let project = load_all_workflows(&self.project_dir)?;
        let global = load_all_workflows(&self.global_dir)?;
        let mut by_id: HashMap<String, Workflow> = HashMap::new();
        for wf in global {
            by_id.insert(wf.workflow_id.clone(), wf);
        }
        for wf in project {
            by_id.insert(wf.workflow_id.clone(), wf);
        }
        Ok(by_id.into_values().filter(|wf| wf.enabled).collect())
    }

    pub fn save_project_workflow(&self, workflow: &Workflow) -> Result<()> {
        save_workflow(&self.project_dir, workflow)
    }

    pub fn save_global_workflow(&self, workflow: &Workflow) -> Result<()> {
        save_workflow(&self.global_dir, workflow)
    }
}

#[derive(Debug, Clone)]
pub struct TriggerMatch {
    pub workflow_id: String,
    pub workflow_name: String,
    pub trigger_pattern: String,
    pub first_step_id: Option<String>,
}

/// First enabled effective workflow whose `task_contains` trigger
/// case-insensitively matches `task` (spec.md §4.6: "first match wins").
pub fn match_trigger(workflows: &[Workflow], task: &str) -> Option<TriggerMatch> {
    let lower_task = task.to_lowercase();
    workflows
        .iter()
        .find(|wf| {
            wf.trigger.mode == TriggerMode::TaskContains && lower_task.contains(&wf.trigger.pattern.to_lowercase())
        })
        .map(|wf| TriggerMatch {
            workflow_id: wf.workflow_id.clone(),
            workflow_name: wf.name.clone(),
            trigger_pattern: wf.trigger.pattern.clone(),
            first_step_id: wf.steps.first().map(|s| s.id.clone()),
        })
}

/// Apply a matched trigger to the overlay's `workflow_run` (spec.md §4.6).
pub fn apply_trigger(run: &mut WorkflowRun, matched: &TriggerMatch) {
    run.active = true;
    run.workflow_id = Some(matched.workflow_id.clone());
    run.workflow_name = Some(matched.workflow_name.clone());
    run.completed_step_ids.clear();
    run.next_step_id = matched.first_step_id.clone();
}

/// The literal marker injected into the first Hands input on a workflow
/// trigger (spec.md §8 scenario 5).
pub fn trigger_marker(matched: &TriggerMatch) -> String {
    format!("MI Workflow Triggered: {} ({})", matched.workflow_name, matched.workflow_id)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WorkflowProgressResponse {
    #[serde(default)]
    advance_completed_step_ids: Vec<String>,
    #[serde(default)]
    set_next_step_id: Option<String>,
    #[serde(default)]
    close_reason: Option<String>,
}

pub struct WorkflowProgressApplied {
    pub completed_step_ids: Vec<String>,
    pub next_step_id: Option<String>,
    pub closed: bool,
    pub close_reason: Option<String>,
}

/// Ask Mind `workflow_progress` with the current cursor + latest evidence,
/// apply the returned cursor update in-memory (caller persists the
/// overlay). Closes the run (`active=false`) when `close_reason` is set
/// (spec.md §4.6). Any non-`Ok` state is routed through
/// `record_mind_failure` (spec.md §4.2).
pub async fn advance_workflow(
    mediator: &MindMediator,
    batch_id: &str,
    run: &mut WorkflowRun,
    context_prompt: &str,
    evidence_log: &EvidenceLog,
    thread_id: &str,
) -> Result<(WorkflowProgressApplied, MindCallState)> {
    let outcome = mediator.call("workflow_progress", context_prompt, "workflow_progress", batch_id).await;
    Ok(match (outcome.state, outcome.value) {
        (MindCallState::Ok, Some(value)) => match serde_json::from_value::<WorkflowProgressResponse>(value) {
            Ok(resp) => {
                for id in &resp.advance_completed_step_ids {
                    if !run.completed_step_ids.contains(id) {
                        run.completed_step_ids.push(id.clone());
                    }
                }
                if resp.set_next_step_id.is_some() {
                    run.next_step_id = resp.set_next_step_id.clone();
                }
                let closed = resp.close_reason.is_some();
                if closed {
                    run.active = false;
                    run.next_step_id = None;
                }
                (
                    WorkflowProgressApplied {
                        completed_step_ids: run.completed_step_ids.clone(),
                        next_step_id: run.next_step_id.clone(),
                        closed,
                        close_reason: resp.close_reason,
                    },
                    MindCallState::Ok,
                )
            }
            Err(_) => {
                record_mind_failure(
                    evidence_log, batch_id, thread_id, "workflow_progress", "workflow_progress",
                    MindCallState::Error, &outcome.transcript_path, Some("response did not match schema".to_string()),
                )?;
                (
                    WorkflowProgressApplied {
                        completed_step_ids: run.completed_step_ids.clone(),
                        next_step_id: run.next_step_id.clone(),
                        closed: false,
                        close_reason: None,
                    },
                    MindCallState::Error,
                )
            }
        },
        (state, _) => {
            record_mind_failure(evidence_log, batch_id, thread_id, "workflow_progress", "workflow_progress", state, &outcome.transcript_path, outcome.error)?;
            (
                WorkflowProgressApplied {
                    completed_step_ids: run.completed_step_ids.clone(),
                    next_step_id: run.next_step_id.clone(),
                    closed: false,
                    close_reason: None,
                },
                state,
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf(id: &str, name: &str, pattern: &str) -> Workflow {
        Workflow {
            workflow_id: id.to_string(),
            name: name.to_string(),
            enabled: true,
            trigger: WorkflowTrigger { mode: TriggerMode::TaskContains, pattern: pattern.to_string() },
            steps: vec![WorkflowStep { id: "s1".to_string(), description: "first step".to_string() }],
        }
    }

    #[test]
    fn project_workflow_wins_entirely_over_global_with_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("project_workflows");
        let global_dir = dir.path().join("global_workflows");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::create_dir_all(&global_dir).unwrap();

        let registry = WorkflowRegistry::new(&project_dir, &global_dir);
        registry.save_global_workflow(&wf("wf_shared", "Global Name", "deploy")).unwrap();
        registry.save_project_workflow(&wf("wf_shared", "Project Name", "release")).unwrap();

        let effective = registry.effective().unwrap();
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].name, "Project Name");
        assert_eq!(effective[0].trigger.pattern, "release");
    }

    #[test]
    fn match_trigger_is_case_insensitive_substring() {
        let workflows = vec![wf("wf_1", "Deploy Flow", "deploy")];
        let matched = match_trigger(&workflows, "please Deploy the app now").unwrap();
        assert_eq!(matched.workflow_id, "wf_1");
        assert_eq!(matched.first_step_id.as_deref(), Some("s1"));
    }

    #[test]
    fn match_trigger_returns_none_when_no_pattern_matches() {
        let workflows = vec![wf("wf_1", "Deploy Flow", "deploy")];
        assert!(match_trigger(&workflows, "refactor the parser").is_none());
    }

    #[test]
    fn trigger_marker_contains_workflow_name_and_id() {
        let matched = TriggerMatch {
            workflow_id: "wf_1".to_string(),
            workflow_name: "Deploy Flow".to_string(),
            trigger_pattern: "deploy".to_string(),
            first_step_id: Some("s1".to_string()),
        };
        let marker = trigger_marker(&matched);
        assert!(marker.contains("MI Workflow Triggered"));
        assert!(marker.contains("wf_1"));
    }

    #[test]
    fn apply_trigger_sets_active_run_state() {
        let mut run = WorkflowRun::default();
        let matched = TriggerMatch {
            workflow_id: "wf_1".to_string(),
            workflow_name: "Deploy Flow".to_string(),
            trigger_pattern: "deploy".to_string(),
            first_step_id: Some("s1".to_string()),
        };
        apply_trigger(&mut run, &matched);
        assert!(run.active);
        assert_eq!(run.next_step_id.as_deref(), Some("s1"));
    }
}
