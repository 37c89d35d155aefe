//! Runtime configuration: `$MI_HOME/config.json`, environment overrides,
//! and hard-coded defaults — mirroring the agent harness's
//! `config::loader::load_config()` layering (settings file → env var →
//! bail with an actionable error), sourced from JSON (SPEC_FULL.md §2).

use crate::hands::InterruptConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MindProviderKind {
    CodexSchema,
    OpenaiCompatible,
    Anthropic,
}

impl Default for MindProviderKind {
    fn default() -> Self {
        MindProviderKind::Anthropic
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MindConfig {
    #[serde(default)]
    pub provider: MindProviderKind,
    #[serde(default = "default_mind_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
}

fn default_mind_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_timeout_s() -> u64 {
    60
}

impl Default for MindConfig {
    fn default() -> Self {
        Self {
            provider: MindProviderKind::default(),
            model: default_mind_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            timeout_s: default_timeout_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandsConfig {
    #[serde(default = "default_hands_provider")]
    pub provider: String,
    #[serde(default)]
    pub interrupt: InterruptConfig,
    #[serde(default = "default_true")]
    pub continue_hands: bool,
    #[serde(default)]
    pub reset_hands: bool,
    /// Only consulted when `provider` is not `"codex"` — the generic CLI
    /// variant of spec.md §4.1 ("CLI variant. When provider ≠ `codex`...").
    #[serde(default)]
    pub cli: Option<CliProviderConfig>,
}

/// Argv-templating config for the generic CLI Hands provider (spec.md
/// §4.1's "CLI variant" paragraph, verbatim: `{project_root}`/`{thread_id}`/
/// optionally `{prompt}` placeholders, `prompt_mode ∈ {stdin, arg}`, and an
/// optional thread-id-extraction regex).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliProviderConfig {
    pub name: String,
    pub argv_template: Vec<String>,
    #[serde(default)]
    pub resume_argv_template: Option<Vec<String>>,
    #[serde(default = "default_prompt_mode")]
    pub prompt_mode: String,
    #[serde(default)]
    pub thread_id_regex: Option<String>,
}

fn default_prompt_mode() -> String {
    "stdin".to_string()
}

fn default_hands_provider() -> String {
    "codex".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for HandsConfig {
    fn default() -> Self {
        Self {
            provider: default_hands_provider(),
            interrupt: InterruptConfig::default(),
            continue_hands: true,
            reset_hands: false,
            cli: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackendKind {
    SqliteFts,
    InMemory,
}

impl Default for MemoryBackendKind {
    fn default() -> Self {
        MemoryBackendKind::InMemory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    #[serde(default = "default_true")]
    pub wf_auto_mine: bool,
    #[serde(default = "default_true")]
    pub pref_auto_mine: bool,
    #[serde(default = "default_true")]
    pub tdb_auto_mine: bool,
    #[serde(default = "default_true")]
    pub tdb_auto_nodes: bool,
    #[serde(default = "default_min_occurrences")]
    pub min_occurrences: u32,
    #[serde(default)]
    pub allow_single_if_high_benefit: bool,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_max_claims")]
    pub max_claims: usize,
}

fn default_min_occurrences() -> u32 {
    2
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_max_claims() -> usize {
    6
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            wf_auto_mine: true,
            pref_auto_mine: true,
            tdb_auto_mine: true,
            tdb_auto_nodes: true,
            min_occurrences: default_min_occurrences(),
            allow_single_if_high_benefit: false,
            min_confidence: default_min_confidence(),
            max_claims: default_max_claims(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationResponseConfig {
    #[serde(default)]
    pub auto_learn: bool,
    #[serde(default = "default_true")]
    pub ask_user_on_high_severity: bool,
}

impl Default for ViolationResponseConfig {
    fn default() -> Self {
        Self {
            auto_learn: false,
            ask_user_on_high_severity: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEndConfig {
    #[serde(default = "default_min_new_suggestions")]
    pub min_new_suggestions_per_run: usize,
    #[serde(default = "default_min_active_learned_claims")]
    pub min_active_learned_claims: usize,
    #[serde(default = "default_max_claims")]
    pub max_claims: usize,
    #[serde(default = "default_max_retracts")]
    pub max_retracts: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub why_trace_enabled: bool,
    #[serde(default = "default_top_k")]
    pub why_trace_top_k: usize,
    #[serde(default = "default_min_confidence")]
    pub why_trace_confidence_threshold: f64,
    #[serde(default = "default_true")]
    pub why_trace_write_edges: bool,
}

fn default_min_new_suggestions() -> usize {
    3
}

fn default_min_active_learned_claims() -> usize {
    1
}

fn default_max_retracts() -> usize {
    4
}

fn default_top_k() -> usize {
    8
}

impl Default for RunEndConfig {
    fn default() -> Self {
        Self {
            min_new_suggestions_per_run: default_min_new_suggestions(),
            min_active_learned_claims: default_min_active_learned_claims(),
            max_claims: default_max_claims(),
            max_retracts: default_max_retracts(),
            min_confidence: default_min_confidence(),
            why_trace_enabled: false,
            why_trace_top_k: default_top_k(),
            why_trace_confidence_threshold: default_min_confidence(),
            why_trace_write_edges: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_batches")]
    pub max_batches: u64,
    #[serde(default = "default_segment_max_records")]
    pub segment_max_records: usize,
    #[serde(default)]
    pub ask_when_uncertain: bool,
    #[serde(default = "default_refactor_intent")]
    pub refactor_intent: String,
    #[serde(default)]
    pub mind: MindConfig,
    #[serde(default)]
    pub hands: HandsConfig,
    #[serde(default)]
    pub memory_backend: MemoryBackendKind,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub violation_response: ViolationResponseConfig,
    #[serde(default)]
    pub run_end: RunEndConfig,
}

fn default_max_batches() -> u64 {
    40
}

fn default_segment_max_records() -> usize {
    crate::store::segment_state::DEFAULT_SEGMENT_MAX_RECORDS
}

fn default_refactor_intent() -> String {
    "preserve_behavior".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_batches: default_max_batches(),
            segment_max_records: default_segment_max_records(),
            ask_when_uncertain: false,
            refactor_intent: default_refactor_intent(),
            mind: MindConfig::default(),
            hands: HandsConfig::default(),
            memory_backend: MemoryBackendKind::default(),
            mining: MiningConfig::default(),
            violation_response: ViolationResponseConfig::default(),
            run_end: RunEndConfig::default(),
        }
    }
}

/// Load `$MI_HOME/config.json`, falling back to hard-coded defaults when
/// absent, then apply environment overrides (`MI_MEMORY_BACKEND`). Mirrors
/// the harness's settings-file-then-env layering but never bails: a missing
/// config file is not an error, only a missing Mind API key is (surfaced
/// lazily, at the point the Mind provider is constructed).
pub fn load_config() -> Result<Config> {
    let global = crate::paths::GlobalPaths::new()?;
    let path = global.config_json();
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        if contents.trim().is_empty() {
            Config::default()
        } else {
            serde_json::from_str(&contents).context("failed to parse config.json")?
        }
    } else {
        Config::default()
    };

    if let Ok(backend) = std::env::var("MI_MEMORY_BACKEND") {
        config.memory_backend = match backend.as_str() {
            "sqlite_fts" => MemoryBackendKind::SqliteFts,
            "in_memory" => MemoryBackendKind::InMemory,
            other => anyhow::bail!("unknown MI_MEMORY_BACKEND value '{other}'"),
        };
    }

    Ok(config)
}

/// Resolve the Mind API key from `api_key_env`, bailing with an actionable
/// error if unset — mirroring the harness's `load_config` bail message.
pub fn resolve_mind_api_key(config: &MindConfig) -> Result<String> {
    std::env::var(&config.api_key_env).with_context(|| {
        format!(
            "Mind API key not found\n\n\
             Checked environment variable: ${}\n\n\
             Quick setup:\n\
             export {}=\"...\"",
            config.api_key_env, config.api_key_env
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_batch_and_segment_limits() {
        let config = Config::default();
        assert_eq!(config.max_batches, 40);
        assert_eq!(config.segment_max_records, 40);
        assert!(!config.ask_when_uncertain);
    }

    #[test]
    fn resolve_mind_api_key_bails_with_actionable_message_when_unset() {
        let config = MindConfig {
            api_key_env: "MI_TEST_NONEXISTENT_KEY_VAR".to_string(),
            ..MindConfig::default()
        };
        std::env::remove_var(&config.api_key_env);
        let err = resolve_mind_api_key(&config).unwrap_err();
        assert!(err.to_string().contains("MI_TEST_NONEXISTENT_KEY_VAR"));
    }
}
