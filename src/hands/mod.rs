//! Hands Supervisor: spawns the external execution agent, streams its
//! output, and enforces interrupt escalation (spec.md §4.1).
//!
//! Grounded on `src/tools/implementations/bash.rs`'s concurrent
//! stdout/stderr drain (spawn piped, one stream read on the caller task, the
//! other drained on a spawned task) and on the daemon lifecycle's use of
//! `nix` for unix signal delivery, generalized into a timer-driven
//! escalation state machine.

pub mod interrupt;
pub mod provider;
pub mod transcript;

pub use interrupt::{InterruptConfig, InterruptMode};
pub use provider::{CliProvider, CodexProvider, HandsEvent, HandsInvocation, HandsProvider, HandsRunResult, PromptMode};

use crate::config::HandsConfig;
use anyhow::{Context, Result};

/// Construct a `HandsProvider` from config, per spec.md §9 ("Variants are
/// `codex | cli`... construct via a registry keyed by provider name").
/// Any `provider` other than `"codex"` is the generic CLI variant of
/// spec.md §4.1 and requires `hands.cli` to be set in `config.json`.
pub fn provider_for_name(config: &HandsConfig) -> Result<Box<dyn HandsProvider>> {
    match config.provider.as_str() {
        "codex" => Ok(Box::new(CodexProvider::default())),
        other => {
            let cli = config.cli.as_ref().with_context(|| {
                format!("hands provider '{other}' requires `hands.cli` (argv_template, prompt_mode, ...) in config.json")
            })?;
            let prompt_mode = match cli.prompt_mode.as_str() {
                "arg" => PromptMode::Arg,
                _ => PromptMode::Stdin,
            };
            let thread_id_regex = cli
                .thread_id_regex
                .as_deref()
                .map(regex::Regex::new)
                .transpose()
                .with_context(|| "hands.cli.thread_id_regex is not a valid regex")?;
            Ok(Box::new(CliProvider {
                name: cli.name.clone(),
                argv_template: cli.argv_template.clone(),
                resume_argv_template: cli.resume_argv_template.clone(),
                prompt_mode,
                thread_id_regex,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliProviderConfig;

    #[test]
    fn codex_provider_needs_no_cli_config() {
        let config = HandsConfig { provider: "codex".to_string(), cli: None, ..HandsConfig::default() };
        let provider = provider_for_name(&config).unwrap();
        assert_eq!(provider.name(), "codex");
    }

    #[test]
    fn unknown_provider_without_cli_config_errors() {
        let config = HandsConfig { provider: "gemini-cli".to_string(), cli: None, ..HandsConfig::default() };
        assert!(provider_for_name(&config).is_err());
    }

    #[test]
    fn cli_provider_builds_from_config() {
        let config = HandsConfig {
            provider: "gemini-cli".to_string(),
            cli: Some(CliProviderConfig {
                name: "gemini-cli".to_string(),
                argv_template: vec!["gemini".to_string(), "--cd".to_string(), "{project_root}".to_string()],
                resume_argv_template: None,
                prompt_mode: "stdin".to_string(),
                thread_id_regex: Some(r"session: (\w+)".to_string()),
            }),
            ..HandsConfig::default()
        };
        let provider = provider_for_name(&config).unwrap();
        assert_eq!(provider.name(), "gemini-cli");
    }
}
