//! `HandsProvider`: spawn, stream, and interrupt an external execution
//! agent subprocess (spec.md §4.1). Grounded on `BashTool::execute`'s
//! concurrent stdout/stderr drain, generalized with the interrupt
//! escalator and a richer structured-event result.

use crate::hands::interrupt::{command_matches, Escalator, InterruptConfig};
use crate::hands::transcript::{Stream as TStream, TranscriptWriter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

#[derive(Debug, Clone, Default)]
pub struct HandsEvent {
    pub event_type: String,
    pub raw: Value,
}

#[derive(Debug, Clone, Default)]
pub struct HandsRunResult {
    pub thread_id: String,
    pub exit_code: i32,
    pub events: Vec<HandsEvent>,
    pub raw_transcript_path: PathBuf,
    pub last_agent_message: String,
}

/// `exec`/`resume` arguments common to both provider variants.
pub struct HandsInvocation<'a> {
    pub prompt: &'a str,
    pub project_root: &'a Path,
    pub transcript_path: &'a Path,
    pub interrupt_cfg: InterruptConfig,
}

#[async_trait]
pub trait HandsProvider: Send + Sync {
    async fn exec(&self, invocation: HandsInvocation<'_>) -> Result<HandsRunResult>;

    /// Default falls back to `exec`; callers that get an `Err` should write
    /// a `hands_resume_failed` EvidenceLog record themselves.
    async fn resume(&self, _thread_id: &str, invocation: HandsInvocation<'_>) -> Result<HandsRunResult> {
        self.exec(invocation).await
    }

    fn name(&self) -> &str;
}

/// `codex --cd <root> exec [--json] -` — and `codex --cd <root> exec resume <thread_id> -`.
pub struct CodexProvider {
    pub binary: String,
}

impl Default for CodexProvider {
    fn default() -> Self {
        Self { binary: "codex".to_string() }
    }
}

#[async_trait]
impl HandsProvider for CodexProvider {
    fn name(&self) -> &str {
        "codex"
    }

    async fn exec(&self, invocation: HandsInvocation<'_>) -> Result<HandsRunResult> {
        let args = vec![
            "--cd".to_string(),
            invocation.project_root.to_string_lossy().to_string(),
            "exec".to_string(),
            "--json".to_string(),
            "-".to_string(),
        ];
        run_codex_like(&self.binary, args, invocation).await
    }

    async fn resume(&self, thread_id: &str, invocation: HandsInvocation<'_>) -> Result<HandsRunResult> {
        let args = vec![
            "--cd".to_string(),
            invocation.project_root.to_string_lossy().to_string(),
            "exec".to_string(),
            "--json".to_string(),
            "resume".to_string(),
            thread_id.to_string(),
            "-".to_string(),
        ];
        run_codex_like(&self.binary, args, invocation).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    Stdin,
    Arg,
}

/// Generic argv-substitution adapter for non-codex Hands backends.
pub struct CliProvider {
    pub name: String,
    pub argv_template: Vec<String>,
    pub resume_argv_template: Option<Vec<String>>,
    pub prompt_mode: PromptMode,
    pub thread_id_regex: Option<Regex>,
}

impl CliProvider {
    fn build_argv(template: &[String], project_root: &Path, thread_id: Option<&str>, prompt: &str, prompt_mode: PromptMode) -> Vec<String> {
        template
            .iter()
            .map(|arg| {
                let mut out = arg.replace("{project_root}", &project_root.to_string_lossy());
                if let Some(tid) = thread_id {
                    out = out.replace("{thread_id}", tid);
                }
                if prompt_mode == PromptMode::Arg {
                    out = out.replace("{prompt}", prompt);
                }
                out
            })
            .collect()
    }
}

#[async_trait]
impl HandsProvider for CliProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exec(&self, invocation: HandsInvocation<'_>) -> Result<HandsRunResult> {
        let argv = Self::build_argv(&self.argv_template, invocation.project_root, None, invocation.prompt, self.prompt_mode);
        run_generic_cli(&argv, &invocation, self.prompt_mode, self.thread_id_regex.as_ref()).await
    }

    async fn resume(&self, thread_id: &str, invocation: HandsInvocation<'_>) -> Result<HandsRunResult> {
        let template = self.resume_argv_template.as_ref().unwrap_or(&self.argv_template);
        let argv = Self::build_argv(template, invocation.project_root, Some(thread_id), invocation.prompt, self.prompt_mode);
        run_generic_cli(&argv, &invocation, self.prompt_mode, self.thread_id_regex.as_ref()).await
    }
}

async fn run_codex_like(binary: &str, args: Vec<String>, invocation: HandsInvocation<'_>) -> Result<HandsRunResult> {
    let transcript = TranscriptWriter::create(invocation.transcript_path)?;
    let mut cmd = Command::new(binary);
    cmd.args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn hands provider {binary}"))?;

    write_prompt_to_stdin(&mut child, invocation.prompt).await?;

    let (exit_code, events, thread_id, last_agent_message) =
        drain_with_interrupt(&mut child, &transcript, invocation.interrupt_cfg, true).await?;

    Ok(HandsRunResult {
        thread_id,
        exit_code,
        events,
        raw_transcript_path: transcript.path().to_path_buf(),
        last_agent_message,
    })
}

async fn run_generic_cli(
    argv: &[String],
    invocation: &HandsInvocation<'_>,
    prompt_mode: PromptMode,
    thread_id_regex: Option<&Regex>,
) -> Result<HandsRunResult> {
    if argv.is_empty() {
        anyhow::bail!("cli provider argv_template is empty");
    }
    let transcript = TranscriptWriter::create(invocation.transcript_path)?;
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().with_context(|| format!("failed to spawn hands provider {}", argv[0]))?;

    if prompt_mode == PromptMode::Stdin {
        write_prompt_to_stdin(&mut child, invocation.prompt).await?;
    } else if let Some(mut stdin) = child.stdin.take() {
        stdin.shutdown().await.ok();
    }

    let (exit_code, _events, _thread_id, mut last_agent_message) =
        drain_with_interrupt(&mut child, &transcript, invocation.interrupt_cfg.clone(), false).await?;

    let thread_id = thread_id_regex
        .and_then(|re| re.captures(&last_agent_message))
        .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    if last_agent_message.is_empty() {
        last_agent_message = String::new();
    }

    Ok(HandsRunResult {
        thread_id,
        exit_code,
        events: Vec::new(),
        raw_transcript_path: transcript.path().to_path_buf(),
        last_agent_message,
    })
}

async fn write_prompt_to_stdin(child: &mut Child, prompt: &str) -> Result<()> {
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(prompt.as_bytes()).await.context("failed to write prompt to hands stdin")?;
        stdin.shutdown().await.context("failed to close hands stdin")?;
    }
    Ok(())
}

/// Concurrently drains stdout/stderr, appending transcript lines, detecting
/// structured JSON events on stdout (codex variant only), and ticking the
/// interrupt escalator. Returns `(exit_code, events, thread_id, last_agent_message)`.
async fn drain_with_interrupt(
    child: &mut Child,
    transcript: &TranscriptWriter,
    interrupt_cfg: InterruptConfig,
    parse_json_events: bool,
) -> Result<(i32, Vec<HandsEvent>, String, String)> {
    let stdout = child.stdout.take().context("hands stdout was not piped")?;
    let stderr = child.stderr.take().context("hands stderr was not piped")?;
    let pid = child.id();

    let mut escalator = Escalator::new(interrupt_cfg.clone());
    let mut events = Vec::new();
    let mut thread_id = "unknown".to_string();
    let mut last_agent_message = String::new();

    let stderr_transcript = transcript_clone_handle(transcript);
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            stderr_transcript.write_line(TStream::Stderr, &line).ok();
        }
    });

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(200));

    loop {
        tokio::select! {
            line = stdout_lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        transcript.write_line(TStream::Stdout, &line)?;
                        if parse_json_events {
                            if let Ok(value) = serde_json::from_str::<Value>(&line) {
                                if let Some(event_type) = value.get("type").and_then(|t| t.as_str()) {
                                    if event_type == "thread.started" {
                                        if let Some(tid) = value.get("thread_id").and_then(|t| t.as_str()) {
                                            thread_id = tid.to_string();
                                        }
                                    }
                                    if event_type == "item.completed" {
                                        if let Some(item) = value.get("item") {
                                            let item_type = item.get("type").and_then(|t| t.as_str()).unwrap_or("");
                                            if matches!(item_type, "agent_message" | "command_execution" | "file_patch" | "tool_call") {
                                                if item_type == "agent_message" {
                                                    if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                                                        last_agent_message = text.to_string();
                                                    }
                                                }
                                            }
                                        }
                                    }
                                    if event_type == "item.started" {
                                        if let Some(item) = value.get("item") {
                                            if item.get("type").and_then(|t| t.as_str()) == Some("command_execution") {
                                                if let Some(cmd) = item.get("command").and_then(|c| c.as_str()) {
                                                    if command_matches(interrupt_cfg.mode, cmd) {
                                                        escalator.request(Instant::now());
                                                    }
                                                }
                                            }
                                        }
                                    }
                                    events.push(HandsEvent { event_type: event_type.to_string(), raw: value });
                                }
                            }
                        } else if !line.trim().is_empty() {
                            last_agent_message = line.clone();
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            _ = ticker.tick() => {
                if escalator.is_requested() {
                    if let Some(signal) = escalator.tick(Instant::now()) {
                        if let Some(pid) = pid {
                            escalator.send(pid as i32, &signal).ok();
                        }
                        transcript.meta(&format!("mi.interrupt.sent={signal}"))?;
                    }
                }
            }
        }
    }

    stderr_task.await.ok();
    let status = child.wait().await.context("failed to wait on hands child")?;
    let exit_code = status.code().unwrap_or(-1);
    transcript.meta(&format!("mi.codex.exit_code={exit_code}"))?;

    Ok((exit_code, events, thread_id, last_agent_message))
}

fn transcript_clone_handle(transcript: &TranscriptWriter) -> TranscriptWriter {
    TranscriptWriter::create(transcript.path()).expect("transcript path already exists")
}

impl Clone for InterruptConfig {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode,
            signal_sequence: self.signal_sequence.clone(),
            escalation_ms: self.escalation_ms.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hands::interrupt::InterruptMode;

    #[tokio::test]
    async fn cli_provider_echo_returns_last_line_as_agent_message() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CliProvider {
            name: "echo-cli".to_string(),
            argv_template: vec!["bash".into(), "-c".into(), "printf 'line1\\nline2\\n'".into()],
            resume_argv_template: None,
            prompt_mode: PromptMode::Stdin,
            thread_id_regex: None,
        };
        let invocation = HandsInvocation {
            prompt: "do the thing",
            project_root: dir.path(),
            transcript_path: &dir.path().join("t.jsonl"),
            interrupt_cfg: InterruptConfig { mode: InterruptMode::Off, ..Default::default() },
        };
        let result = provider.exec(invocation).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.last_agent_message, "line2");
        assert_eq!(result.thread_id, "unknown");
    }

    #[tokio::test]
    async fn cli_provider_extracts_thread_id_via_regex() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CliProvider {
            name: "echo-cli".to_string(),
            argv_template: vec!["bash".into(), "-c".into(), "echo 'session: abc123'".into()],
            resume_argv_template: None,
            prompt_mode: PromptMode::Stdin,
            thread_id_regex: Some(Regex::new(r"session: (\w+)").unwrap()),
        };
        let invocation = HandsInvocation {
            prompt: "hi",
            project_root: dir.path(),
            transcript_path: &dir.path().join("t.jsonl"),
            interrupt_cfg: InterruptConfig { mode: InterruptMode::Off, ..Default::default() },
        };
        let result = provider.exec(invocation).await.unwrap();
        assert_eq!(result.thread_id, "abc123");
    }

    #[tokio::test]
    async fn nonzero_exit_is_recorded_not_errored() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CliProvider {
            name: "fail-cli".to_string(),
            argv_template: vec!["bash".into(), "-c".into(), "exit 7".into()],
            resume_argv_template: None,
            prompt_mode: PromptMode::Stdin,
            thread_id_regex: None,
        };
        let invocation = HandsInvocation {
            prompt: "",
            project_root: dir.path(),
            transcript_path: &dir.path().join("t.jsonl"),
            interrupt_cfg: InterruptConfig { mode: InterruptMode::Off, ..Default::default() },
        };
        let result = provider.exec(invocation).await.unwrap();
        assert_eq!(result.exit_code, 7);
    }
}
