//! `ProjectOverlay`: the only mutable persistent state on the hot path
//! (spec.md §3). Loaded once per run, mutated in memory, written back
//! atomically after each batch.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandsState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_ts: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRun {
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub completed_step_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestlessStrategy {
    #[serde(default)]
    pub chosen_once: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectOverlay {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub root_path: String,
    #[serde(default)]
    pub identity_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default)]
    pub hands_state: HandsState,
    #[serde(default)]
    pub workflow_run: WorkflowRun,
    #[serde(default)]
    pub testless_verification_strategy: TestlessStrategy,
    /// `(batch_id, checkpoint_kind)` joined key of the last checkpoint that
    /// fired, so the pipeline never double-mines the same position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_key: Option<String>,
    #[serde(default)]
    pub global_workflow_overrides: Vec<String>,
    #[serde(default)]
    pub host_bindings: Vec<String>,
    #[serde(default)]
    pub stack_hints: Vec<String>,
}

impl ProjectOverlay {
    pub fn load_or_init(path: &Path, project_id: &str, root_path: &str, identity_key: &str) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if !contents.trim().is_empty() {
                return serde_json::from_str(&contents).context("failed to parse overlay.json");
            }
        }
        Ok(Self {
            project_id: project_id.to_string(),
            root_path: root_path.to_string(),
            identity_key: identity_key.to_string(),
            ..Default::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::store::atomic_write_json(path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_init_seeds_identity_fields_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.json");
        let overlay = ProjectOverlay::load_or_init(&path, "p1", "/repo", "key1").unwrap();
        assert_eq!(overlay.project_id, "p1");
        assert!(!overlay.workflow_run.active);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.json");
        let mut overlay = ProjectOverlay::load_or_init(&path, "p1", "/repo", "key1").unwrap();
        overlay.hands_state.thread_id = Some("t123".to_string());
        overlay.save(&path).unwrap();

        let reloaded = ProjectOverlay::load_or_init(&path, "p1", "/repo", "key1").unwrap();
        assert_eq!(reloaded.hands_state.thread_id.as_deref(), Some("t123"));
    }
}
