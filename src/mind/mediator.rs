//! `MindMediator`: wraps a `MindProvider`, validates its output against an
//! embedded schema, retries with a repair turn on validation failure, and
//! trips a per-instance circuit breaker after consecutive failures (spec.md
//! §4.2, §8 "Circuit breaker").

use crate::mind::provider::MindProvider;
use crate::mind::schema::{extract_json_object, validate};
use crate::store::{EvidenceKind, EvidenceLog, EvidenceRecord};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

const BREAKER_THRESHOLD: u32 = 2;
const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MindCallState {
    Ok,
    Error,
    Skipped,
}

impl MindCallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MindCallState::Ok => "ok",
            MindCallState::Error => "error",
            MindCallState::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Serialize)]
struct TranscriptHeader<'a> {
    ts: String,
    schema: &'a str,
    tag: &'a str,
    batch_id: &'a str,
    provider: &'a str,
}

#[derive(Debug, Serialize)]
struct TranscriptAttempt<'a> {
    ts: String,
    attempt: u32,
    request_system: &'a str,
    request_user: &'a str,
    response_text: &'a str,
    validation_errors: Vec<String>,
    duration_ms: u128,
}

pub struct MindCallOutcome {
    pub value: Option<Value>,
    pub transcript_path: String,
    pub state: MindCallState,
    pub error: Option<String>,
}

/// One breaker per logical Mind usage in a run (spec.md §9). Consecutive
/// failures across *all* schemas trip it; a subsequent `Ok` resets it.
pub struct MindMediator {
    provider: Box<dyn MindProvider>,
    transcripts_dir: PathBuf,
    consecutive_failures: AtomicU32,
    max_retries: u32,
}

impl MindMediator {
    pub fn new(provider: Box<dyn MindProvider>, transcripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            transcripts_dir: transcripts_dir.into(),
            consecutive_failures: AtomicU32::new(0),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures.load(Ordering::SeqCst) >= BREAKER_THRESHOLD
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
    }

    /// `call(schema_filename, prompt, tag, batch_id) -> MindCallOutcome`
    /// (spec.md §4.2). When the breaker is open, returns `Skipped` without
    /// invoking the provider at all.
    pub async fn call(&self, schema_name: &str, prompt: &str, tag: &str, batch_id: &str) -> MindCallOutcome {
        if self.is_open() {
            return MindCallOutcome {
                value: None,
                transcript_path: String::new(),
                state: MindCallState::Skipped,
                error: Some("circuit breaker open".to_string()),
            };
        }

        let schema_text = match crate::mind::schema_text(schema_name) {
            Some(s) => s,
            None => {
                self.record_failure();
                return MindCallOutcome {
                    value: None,
                    transcript_path: String::new(),
                    state: MindCallState::Error,
                    error: Some(format!("unknown schema '{schema_name}'")),
                };
            }
        };
        let schema: Value = match serde_json::from_str(schema_text) {
            Ok(v) => v,
            Err(e) => {
                self.record_failure();
                return MindCallOutcome {
                    value: None,
                    transcript_path: String::new(),
                    state: MindCallState::Error,
                    error: Some(format!("failed to parse embedded schema: {e}")),
                };
            }
        };

        let transcript_path = self.transcript_path(tag);
        if let Err(e) = self.write_header(&transcript_path, schema_name, tag, batch_id) {
            return MindCallOutcome {
                value: None,
                transcript_path: transcript_path.to_string_lossy().to_string(),
                state: MindCallState::Error,
                error: Some(format!("failed to write mind transcript header: {e}")),
            };
        }

        let system = format!(
            "You must output exactly one JSON object matching this schema. \
             No markdown, no commentary, no code fences.\n\nSchema:\n{schema_text}"
        );
        let mut user_prompt = prompt.to_string();

        for attempt in 0..=self.max_retries {
            let started = Instant::now();
            let raw = self.provider.call_raw(&system, &user_prompt).await;
            let duration_ms = started.elapsed().as_millis();

            let raw_text = match raw {
                Ok(t) => t,
                Err(e) => {
                    self.append_attempt(&transcript_path, attempt, &system, &user_prompt, "", vec![e.to_string()], duration_ms)
                        .ok();
                    self.record_failure();
                    return MindCallOutcome {
                        value: None,
                        transcript_path: transcript_path.to_string_lossy().to_string(),
                        state: MindCallState::Error,
                        error: Some(e.to_string()),
                    };
                }
            };

            let parsed = extract_json_object(&raw_text);
            let errors: Vec<String> = match &parsed {
                Some(value) => validate(&schema, value).into_iter().map(|e| e.to_string()).collect(),
                None => vec!["response did not contain a JSON object".to_string()],
            };

            self.append_attempt(&transcript_path, attempt, &system, &user_prompt, &raw_text, errors.clone(), duration_ms)
                .ok();

            if errors.is_empty() {
                self.record_success();
                return MindCallOutcome {
                    value: parsed,
                    transcript_path: transcript_path.to_string_lossy().to_string(),
                    state: MindCallState::Ok,
                    error: None,
                };
            }

            if attempt < self.max_retries {
                user_prompt = format!(
                    "{prompt}\n\nYour previous output was invalid:\n{raw_text}\n\nValidation errors:\n{}\n\n\
                     Respond again with ONLY a corrected JSON object matching the schema.",
                    errors.join("\n")
                );
                continue;
            }

            self.record_failure();
            return MindCallOutcome {
                value: None,
                transcript_path: transcript_path.to_string_lossy().to_string(),
                state: MindCallState::Error,
                error: Some(format!("schema validation failed after {} attempts: {}", attempt + 1, errors.join("; "))),
            };
        }

        unreachable!("retry loop always returns");
    }

    fn transcript_path(&self, tag: &str) -> PathBuf {
        let ts = crate::ids::now_rfc3339().replace(':', "-");
        self.transcripts_dir.join(format!("{ts}_{tag}.jsonl"))
    }

    fn write_header(&self, path: &Path, schema: &str, tag: &str, batch_id: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let header = TranscriptHeader {
            ts: crate::ids::now_rfc3339(),
            schema,
            tag,
            batch_id,
            provider: self.provider.name(),
        };
        let line = serde_json::to_string(&header)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    fn append_attempt(
        &self,
        path: &Path,
        attempt: u32,
        system: &str,
        user: &str,
        response: &str,
        validation_errors: Vec<String>,
        duration_ms: u128,
    ) -> Result<()> {
        let record = TranscriptAttempt {
            ts: crate::ids::now_rfc3339(),
            attempt,
            request_system: system,
            request_user: user,
            response_text: response,
            validation_errors,
            duration_ms,
        };
        let line = serde_json::to_string(&record)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

/// Append exactly one `mind_skipped`/`mind_error` EvidenceLog record for a
/// call whose `MindCallState` was not `Ok` (spec.md §4.2: "log a
/// `mind_skipped` EvidenceLog event"; §7: "logged once per call"). Every
/// caller of `MindMediator::call` other than `extract_evidence`/`decide_next`
/// routes its non-Ok outcomes through this so the audit trail never drops a
/// failed or breaker-skipped call silently.
pub fn record_mind_failure(
    evidence_log: &EvidenceLog,
    batch_id: &str,
    thread_id: &str,
    schema: &str,
    tag: &str,
    state: MindCallState,
    transcript_path: &str,
    error: Option<String>,
) -> Result<()> {
    match state {
        MindCallState::Skipped => {
            evidence_log.append(EvidenceRecord::new(
                batch_id,
                thread_id,
                EvidenceKind::MindSkipped { schema: schema.to_string(), tag: tag.to_string() },
            ))?;
        }
        _ => {
            evidence_log.append(EvidenceRecord::new(
                batch_id,
                thread_id,
                EvidenceKind::MindError {
                    schema: schema.to_string(),
                    tag: tag.to_string(),
                    transcript_path: transcript_path.to_string(),
                    error: error.unwrap_or_default(),
                },
            ))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedProvider {
        responses: Mutex<Vec<Result<String>>>,
    }

    #[async_trait]
    impl MindProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn call_raw(&self, _system: &str, _user_prompt: &str) -> Result<String> {
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn scripted(responses: Vec<Result<String>>) -> ScriptedProvider {
        ScriptedProvider { responses: Mutex::new(responses) }
    }

    #[tokio::test]
    async fn call_returns_ok_on_valid_response() {
        let dir = tempfile::tempdir().unwrap();
        let provider = scripted(vec![Ok(r#"{"should_run_checks": false, "needs_testless_strategy": false}"#.to_string())]);
        let mediator = MindMediator::new(Box::new(provider), dir.path());
        let outcome = mediator.call("plan_min_checks", "plan it", "b1", "b1").await;
        assert_eq!(outcome.state, MindCallState::Ok);
        assert!(outcome.value.is_some());
    }

    #[tokio::test]
    async fn call_retries_on_schema_violation_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let provider = scripted(vec![
            Ok(r#"{"should_run_checks": "yes"}"#.to_string()),
            Ok(r#"{"should_run_checks": false, "needs_testless_strategy": false}"#.to_string()),
        ]);
        let mediator = MindMediator::new(Box::new(provider), dir.path());
        let outcome = mediator.call("plan_min_checks", "plan it", "b1", "b1").await;
        assert_eq!(outcome.state, MindCallState::Ok);
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_two_consecutive_failures() {
        let dir = tempfile::tempdir().unwrap();
        let provider = scripted(vec![
            Err(anyhow::anyhow!("boom 1")),
            Err(anyhow::anyhow!("boom 2")),
        ]);
        let mediator = MindMediator::new(Box::new(provider), dir.path());

        let first = mediator.call("plan_min_checks", "x", "b1", "b1").await;
        assert_eq!(first.state, MindCallState::Error);
        assert!(!mediator.is_open());

        let second = mediator.call("plan_min_checks", "x", "b2", "b2").await;
        assert_eq!(second.state, MindCallState::Error);
        assert!(mediator.is_open());

        // Third call must be skipped without touching the provider (which has
        // no responses left — a panic here would mean the breaker didn't hold).
        let third = mediator.call("plan_min_checks", "x", "b3", "b3").await;
        assert_eq!(third.state, MindCallState::Skipped);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failure_counter() {
        let dir = tempfile::tempdir().unwrap();
        let provider = scripted(vec![
            Err(anyhow::anyhow!("boom")),
            Ok(r#"{"should_run_checks": false, "needs_testless_strategy": false}"#.to_string()),
            Err(anyhow::anyhow!("boom again")),
        ]);
        let mediator = MindMediator::new(Box::new(provider), dir.path());

        mediator.call("plan_min_checks", "x", "b1", "b1").await;
        let ok = mediator.call("plan_min_checks", "x", "b2", "b2").await;
        assert_eq!(ok.state, MindCallState::Ok);
        assert!(!mediator.is_open());

        let err = mediator.call("plan_min_checks", "x", "b3", "b3").await;
        assert_eq!(err.state, MindCallState::Error);
        assert!(!mediator.is_open()); // only one consecutive failure so far
    }
}
