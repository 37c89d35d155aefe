//! Cross-project memory index: the `recall`/`ingest_snapshot` interface MI's
//! pre-action/decide flow calls into, feeding `cross_project_recall`
//! EvidenceLog events (spec.md §3, §6; SPEC_FULL.md §4.10). Genuine SQLite
//! FTS5 tuning is the documented non-goal (spec.md §1) — the trait boundary
//! is where a real deployment would swap one in; the two backends here are
//! complete, working defaults.
//!
//! Grounded on `src/memory/mod.rs`'s `MemorySystem` (`insert_conversation`,
//! `query`) shape, generalized from a single project's conversation history
//! to cross-project text snippets.

use anyhow::{Context, Result};
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct RecallItem {
    pub project_id: String,
    pub text: String,
    pub score: f64,
}

/// Memory-index updates are best-effort and never block MI progress (spec.md
/// §5) — callers should tolerate an `Err` from `ingest_snapshot` by logging
/// and continuing, never propagating it across a phase boundary.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn recall(&self, query: &str, top_k: usize) -> Result<Vec<RecallItem>>;
    async fn ingest_snapshot(&self, project_id: &str, text: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct IndexedSnippet {
    project_id: String,
    text: String,
}

/// A complete, working default for `MI_MEMORY_BACKEND=in_memory`: substring
/// / token-overlap scoring over an in-process `Vec`.
pub struct InMemoryBackend {
    snippets: tokio::sync::Mutex<Vec<IndexedSnippet>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self { snippets: tokio::sync::Mutex::new(Vec::new()) }
    }

    fn score(query_tokens: &[String], text: &str) -> f64 {
        if query_tokens.is_empty() {
            return 0.0;
        }
        let lower = text.to_lowercase();
        let hits = query_tokens.iter().filter(|t| lower.contains(t.as_str())).count();
        hits as f64 / query_tokens.len() as f64
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn recall(&self, query: &str, top_k: usize) -> Result<Vec<RecallItem>> {
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        let snippets = self.snippets.lock().await;
        let mut scored: Vec<RecallItem> = snippets
            .iter()
            .map(|s| RecallItem {
                project_id: s.project_id.clone(),
                text: s.text.clone(),
                score: Self::score(&tokens, &s.text),
            })
            .filter(|item| item.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn ingest_snapshot(&self, project_id: &str, text: &str) -> Result<()> {
        let mut snippets = self.snippets.lock().await;
        snippets.push(IndexedSnippet {
            project_id: project_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}

/// `rusqlite`-backed text index at `indexes/memory.sqlite`, a plain table
/// with a `LIKE`-based query (spec.md §6). The harness already depends on
/// `rusqlite` for `MemorySystem`; MI reuses that dependency for the
/// `sqlite_fts` backend name without building out genuine FTS5 virtual
/// tables (documented non-goal, spec.md §1).
pub struct SqliteBackend {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
}

impl SqliteBackend {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = rusqlite::Connection::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS snippets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL,
                text TEXT NOT NULL
            )",
            [],
        )
        .context("failed to create snippets table")?;
        Ok(Self { conn: tokio::sync::Mutex::new(conn) })
    }
}

#[async_trait]
impl MemoryBackend for SqliteBackend {
    async fn recall(&self, query: &str, top_k: usize) -> Result<Vec<RecallItem>> {
        let pattern = format!("%{}%", query.replace('%', ""));
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT project_id, text FROM snippets WHERE text LIKE ?1 LIMIT ?2")
            .context("failed to prepare recall query")?;
        let rows = stmt
            .query_map(rusqlite::params![pattern, top_k as i64], |row| {
                Ok(RecallItem {
                    project_id: row.get(0)?,
                    text: row.get(1)?,
                    score: 1.0,
                })
            })
            .context("failed to run recall query")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read recall row")?);
        }
        Ok(out)
    }

    async fn ingest_snapshot(&self, project_id: &str, text: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO snippets (project_id, text) VALUES (?1, ?2)",
            rusqlite::params![project_id, text],
        )
        .context("failed to insert snippet")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_backend_ranks_by_token_overlap() {
        let backend = InMemoryBackend::new();
        backend.ingest_snapshot("p1", "uses postgres for storage").await.unwrap();
        backend.ingest_snapshot("p1", "frontend built with react").await.unwrap();

        let results = backend.recall("postgres storage", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].text.contains("postgres"));
    }

    #[tokio::test]
    async fn in_memory_backend_returns_empty_for_no_matches() {
        let backend = InMemoryBackend::new();
        backend.ingest_snapshot("p1", "uses postgres").await.unwrap();
        let results = backend.recall("kubernetes", 5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn sqlite_backend_round_trips_snippets() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("memory.sqlite")).unwrap();
        backend.ingest_snapshot("p1", "migrated to tokio 1.35").await.unwrap();
        let results = backend.recall("tokio", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].project_id, "p1");
    }
}
