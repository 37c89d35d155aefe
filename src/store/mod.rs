//! Append-only stores and mutable project state (spec.md §3, §4.3).
//!
//! Grounded on the agent harness's `ActivityLogger` (JSONL append via
//! `OpenOptions::append` + `writeln!`, one `serde(tag = "...")` enum per
//! record kind) generalized from a single daily log to the EvidenceLog's
//! per-`kind` payload shapes, and on `original_source/mi/thoughtdb.py` for
//! the Thought DB's exact dedup/visibility/idempotence semantics.

pub mod evidence_log;
pub mod overlay;
pub mod segment_state;
pub mod thought_db;

pub use evidence_log::{EvidenceKind, EvidenceLog, EvidenceRecord};
pub use overlay::{HandsState, ProjectOverlay, TestlessStrategy, WorkflowRun};
pub use segment_state::{SegmentRecord, SegmentState};
pub use thought_db::{
    Claim, ClaimStatus, ClaimType, Edge, EdgeType, MineOutcome, MinedClaim, MinedEdge, MinedOutput,
    Node, NodeType, Scope, ThoughtDb, ThoughtDbStore, ThoughtDbView, Visibility,
};

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

/// Atomic write: serialize to a temp file in the same directory, then
/// rename over the destination. The only mutation strategy ProjectOverlay
/// and SegmentState use (spec.md §3 invariants, §5 ordering guarantees).
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .context("destination path has no parent directory")?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let tmp_path = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "store".to_string()),
        std::process::id()
    ));
    let contents = serde_json::to_string_pretty(value).context("failed to serialize json")?;
    std::fs::write(&tmp_path, contents)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}
