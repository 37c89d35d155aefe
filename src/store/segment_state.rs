//! `SegmentState`: a sliding buffer of compact evidence summaries bound to
//! a `thread_id`, input to checkpoint mining (spec.md §3, §4.7).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_SEGMENT_MAX_RECORDS: usize = 40;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub event_id: String,
    pub kind: String,
    pub summary: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub records: Vec<SegmentRecord>,
}

impl SegmentState {
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&contents).context("failed to parse segment_state.json")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::store::atomic_write_json(path, self)
    }

    /// Clears the buffer when the bound `thread_id` changes (session reset).
    pub fn reset_for_thread(&mut self, thread_id: &str) {
        if self.thread_id.as_deref() != Some(thread_id) {
            self.records.clear();
            self.thread_id = Some(thread_id.to_string());
        }
    }

    pub fn push(&mut self, record: SegmentRecord, max_records: usize) {
        self.records.push(record);
        let max_records = max_records.max(1);
        if self.records.len() > max_records {
            let overflow = self.records.len() - max_records;
            self.records.drain(0..overflow);
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(n: usize) -> SegmentRecord {
        SegmentRecord {
            event_id: format!("ev_{n}"),
            kind: "hands_output".to_string(),
            summary: format!("summary {n}"),
        }
    }

    #[test]
    fn push_bounds_buffer_to_max_records_dropping_oldest() {
        let mut state = SegmentState::default();
        for i in 0..5 {
            state.push(rec(i), 3);
        }
        assert_eq!(state.records.len(), 3);
        assert_eq!(state.records[0].event_id, "ev_2");
        assert_eq!(state.records[2].event_id, "ev_4");
    }

    #[test]
    fn reset_for_thread_clears_on_thread_change() {
        let mut state = SegmentState::default();
        state.reset_for_thread("t1");
        state.push(rec(0), 40);
        assert_eq!(state.records.len(), 1);

        state.reset_for_thread("t2");
        assert!(state.records.is_empty());
        assert_eq!(state.thread_id.as_deref(), Some("t2"));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_state.json");
        let mut state = SegmentState::default();
        state.reset_for_thread("t1");
        state.push(rec(0), 40);
        state.save(&path).unwrap();

        let reloaded = SegmentState::load_or_default(&path).unwrap();
        assert_eq!(reloaded.records.len(), 1);
        assert_eq!(reloaded.thread_id.as_deref(), Some("t1"));
    }
}
