//! `MindProvider`: the three structured-output backends normalized behind
//! one `call_raw` method (spec.md §4.2). Grounded on `ClaudeClient` (HTTP
//! POST with `reqwest`, a fixed timeout, `Context`-wrapped errors) and the
//! `providers/{mod,factory,openai}.rs` `LlmProvider` trait/registry shape.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

#[async_trait]
pub trait MindProvider: Send + Sync {
    async fn call_raw(&self, system: &str, user_prompt: &str) -> Result<String>;

    fn name(&self) -> &str;
}

/// Wraps a Hands-style subprocess that emits strict JSON under an
/// output-schema flag. Per spec.md §9 this is an explicit Open Question the
/// original delegates to a provider-specific contract; MI implements it as
/// a `codex exec --json` invocation whose final `agent_message` item is the
/// JSON payload.
pub struct CodexSchemaProvider {
    pub binary: String,
    pub project_root: std::path::PathBuf,
}

#[async_trait]
impl MindProvider for CodexSchemaProvider {
    fn name(&self) -> &str {
        "codex_schema"
    }

    async fn call_raw(&self, system: &str, user_prompt: &str) -> Result<String> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::process::Command;

        let combined = format!("{system}\n\n{user_prompt}");
        let mut child = Command::new(&self.binary)
            .arg("--cd")
            .arg(&self.project_root)
            .arg("exec")
            .arg("--json")
            .arg("-")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn mind provider {}", self.binary))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(combined.as_bytes()).await.context("failed to write mind prompt")?;
            stdin.shutdown().await.ok();
        }

        let stdout = child.stdout.take().context("mind stdout was not piped")?;
        let mut lines = BufReader::new(stdout).lines();
        let mut last_agent_message = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(value) = serde_json::from_str::<Value>(&line) {
                if value.get("type").and_then(|t| t.as_str()) == Some("item.completed") {
                    if let Some(item) = value.get("item") {
                        if item.get("type").and_then(|t| t.as_str()) == Some("agent_message") {
                            if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                                last_agent_message = text.to_string();
                            }
                        }
                    }
                }
            }
        }
        child.wait().await.context("failed to wait on mind child")?;
        Ok(last_agent_message)
    }
}

pub struct OpenAiCompatProvider {
    pub client: Client,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: String, model: String, api_key: String, timeout_s: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .context("failed to build OpenAI-compatible HTTP client")?;
        Ok(Self { client, base_url, model, api_key })
    }
}

#[async_trait]
impl MindProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    async fn call_raw(&self, system: &str, user_prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user_prompt},
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to send request to OpenAI-compatible endpoint")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI-compatible request failed\n\nStatus: {status}\nBody: {error_body}");
        }

        let parsed: Value = response.json().await.context("failed to parse OpenAI-compatible response")?;
        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .context("OpenAI-compatible response missing choices[0].message.content")
    }
}

pub struct AnthropicProvider {
    pub client: Client,
    pub model: String,
    pub api_key: String,
}

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

impl AnthropicProvider {
    pub fn new(model: String, api_key: String, timeout_s: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .context("failed to build Anthropic HTTP client")?;
        Ok(Self { client, model, api_key })
    }
}

#[async_trait]
impl MindProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn call_raw(&self, system: &str, user_prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "max_tokens": 4096,
            "system": system,
            "messages": [{"role": "user", "content": user_prompt}],
        });

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("failed to send request to Anthropic Messages API")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic request failed\n\nStatus: {status}\nBody: {error_body}");
        }

        let parsed: Value = response.json().await.context("failed to parse Anthropic response")?;
        parsed["content"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .context("Anthropic response missing content[0].text")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[tokio::test]
    async fn openai_compat_provider_extracts_message_content() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"content":"{\"ok\":true}"}}]}"#)
            .create_async()
            .await;

        let provider = OpenAiCompatProvider::new(server.url(), "gpt-test".to_string(), "sk-test".to_string(), 5).unwrap();
        let text = provider.call_raw("system", "user").await.unwrap();
        assert_eq!(text, "{\"ok\":true}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn openai_compat_provider_surfaces_http_error() {
        let mut server = Server::new_async().await;
        let _mock = server.mock("POST", "/chat/completions").with_status(500).create_async().await;

        let provider = OpenAiCompatProvider::new(server.url(), "gpt-test".to_string(), "sk-test".to_string(), 5).unwrap();
        let result = provider.call_raw("system", "user").await;
        assert!(result.is_err());
    }
}
