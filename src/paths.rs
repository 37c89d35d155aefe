//! `$MI_HOME` layout and project-identity resolution (spec.md §3, §6).
//!
//! Grounded on the agent harness's `dirs::home_dir()`-based path resolution
//! (`AgentConfig::resolve_tasks_path`) generalized from a single task file
//! to the full directory tree spec.md §6 lays out.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Resolves `$MI_HOME`, defaulting to `~/.mind-incarnation`.
pub fn mi_home() -> Result<PathBuf> {
    if let Ok(custom) = std::env::var("MI_HOME") {
        if !custom.is_empty() {
            return Ok(PathBuf::from(custom));
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".mind-incarnation"))
        .context("could not determine home directory to resolve MI_HOME")
}

pub struct GlobalPaths {
    pub root: PathBuf,
}

impl GlobalPaths {
    pub fn new() -> Result<Self> {
        let root = mi_home()?;
        Ok(Self { root })
    }

    pub fn config_json(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn project_index_json(&self) -> PathBuf {
        self.root.join("projects").join("index.json")
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join("projects").join(project_id)
    }

    pub fn global_thoughtdb_dir(&self) -> PathBuf {
        self.root.join("thoughtdb")
    }

    pub fn global_workflows_dir(&self) -> PathBuf {
        self.root.join("mindspec").join("workflows")
    }

    pub fn memory_sqlite(&self) -> PathBuf {
        self.root.join("indexes").join("memory.sqlite")
    }

    pub fn mindspec_learned_jsonl(&self) -> PathBuf {
        self.root.join("mindspec").join("learned.jsonl")
    }

    pub fn mind_transcripts_dir(&self) -> PathBuf {
        self.root.join("mindspec").join("transcripts").join("mind")
    }

    pub fn ensure_all(&self) -> Result<()> {
        for dir in [
            self.root.join("mindspec").join("transcripts").join("mind"),
            self.root.join("projects"),
            self.global_thoughtdb_dir(),
            self.global_workflows_dir(),
            self.root.join("indexes"),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub struct ProjectPaths {
    pub root: PathBuf,
}

impl ProjectPaths {
    pub fn new(global: &GlobalPaths, project_id: &str) -> Self {
        Self {
            root: global.project_dir(project_id),
        }
    }

    pub fn overlay_json(&self) -> PathBuf {
        self.root.join("overlay.json")
    }

    pub fn evidence_jsonl(&self) -> PathBuf {
        self.root.join("evidence.jsonl")
    }

    pub fn segment_state_json(&self) -> PathBuf {
        self.root.join("segment_state.json")
    }

    pub fn thoughtdb_dir(&self) -> PathBuf {
        self.root.join("thoughtdb")
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.root.join("workflows")
    }

    pub fn candidates_dir(&self) -> PathBuf {
        self.root.join("candidates")
    }

    pub fn hands_transcripts_dir(&self) -> PathBuf {
        self.root.join("transcripts").join("hands")
    }

    pub fn mind_transcripts_dir(&self) -> PathBuf {
        self.root.join("transcripts").join("mind")
    }

    pub fn ensure_all(&self) -> Result<()> {
        for dir in [
            self.thoughtdb_dir(),
            self.workflows_dir(),
            self.candidates_dir(),
            self.hands_transcripts_dir(),
            self.mind_transcripts_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// `identity_key -> project_id` index, surviving directory renames.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProjectIndex {
    #[serde(default)]
    pub entries: HashMap<String, String>,
}

impl ProjectIndex {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&contents).context("failed to parse project index")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::store::atomic_write_json(path, self)
    }

    /// Resolve (or mint and persist) the `project_id` for `identity_key`.
    pub fn resolve_or_create(&mut self, path: &Path, identity_key: &str) -> Result<String> {
        if let Some(existing) = self.entries.get(identity_key) {
            return Ok(existing.clone());
        }
        let project_id = project_id_digest(identity_key);
        self.entries
            .insert(identity_key.to_string(), project_id.clone());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        self.save(path)?;
        Ok(project_id)
    }
}

/// Short digest of the project identity key (git origin + root commit +
/// relative path; falls back to absolute path).
pub fn project_id_digest(identity_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity_key.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// Build the identity key for a project root: `<git origin>|<root commit>|<relative path>`,
/// falling back to the absolute path when git metadata is unavailable.
pub fn identity_key_for_root(root: &Path, git_origin: Option<&str>, root_commit: Option<&str>, relative_path: &str) -> String {
    match (git_origin, root_commit) {
        (Some(origin), Some(commit)) => format!("{origin}|{commit}|{relative_path}"),
        _ => root
            .canonicalize()
            .unwrap_or_else(|_| root.to_path_buf())
            .to_string_lossy()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_digest_is_deterministic_and_short() {
        let a = project_id_digest("git@example.com:repo.git|abc123|src");
        let b = project_id_digest("git@example.com:repo.git|abc123|src");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn project_index_resolve_or_create_persists_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("index.json");
        let mut index = ProjectIndex::load(&index_path).unwrap();
        let id1 = index
            .resolve_or_create(&index_path, "key-a")
            .unwrap();

        let mut reloaded = ProjectIndex::load(&index_path).unwrap();
        let id2 = reloaded.resolve_or_create(&index_path, "key-a").unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn identity_key_falls_back_to_absolute_path_without_git() {
        let dir = tempfile::tempdir().unwrap();
        let key = identity_key_for_root(dir.path(), None, None, "");
        assert!(key.contains(dir.path().to_string_lossy().as_ref()));
    }
}
