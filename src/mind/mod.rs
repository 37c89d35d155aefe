//! Mind Mediator: invoke the structured-output model between Hands batches,
//! validate the result against an embedded JSON Schema, and apply a
//! consecutive-failure circuit breaker (spec.md §4.2).

pub mod mediator;
pub mod provider;
pub mod schema;

pub use mediator::{record_mind_failure, MindCallState, MindMediator};
pub use provider::{AnthropicProvider, CodexSchemaProvider, MindProvider, OpenAiCompatProvider};

/// Every schema filename named in spec.md §6 ("Required schemas referenced
/// by the core"), embedded at compile time so MI has no external install
/// step of its own (SPEC_FULL.md §6).
macro_rules! embedded_schemas {
    ($($name:literal => $path:literal),+ $(,)?) => {
        pub fn schema_text(name: &str) -> Option<&'static str> {
            match name {
                $($name => Some(include_str!($path)),)+
                _ => None,
            }
        }
    };
}

embedded_schemas! {
    "extract_evidence" => "schemas/extract_evidence.json",
    "risk_judge" => "schemas/risk_judge.json",
    "plan_min_checks" => "schemas/plan_min_checks.json",
    "auto_answer_to_hands" => "schemas/auto_answer_to_hands.json",
    "decide_next" => "schemas/decide_next.json",
    "loop_break" => "schemas/loop_break.json",
    "workflow_progress" => "schemas/workflow_progress.json",
    "suggest_workflow" => "schemas/suggest_workflow.json",
    "mine_preferences" => "schemas/mine_preferences.json",
    "mine_claims" => "schemas/mine_claims.json",
    "checkpoint_decide" => "schemas/checkpoint_decide.json",
    "learn_update" => "schemas/learn_update.json",
    "why_trace" => "schemas/why_trace.json",
}

/// Construct a `MindProvider` by name, mirroring `providers::factory`'s
/// name-keyed registry (spec.md §9).
pub fn provider_for_name(
    name: &str,
    model: String,
    api_key: String,
    base_url: Option<String>,
    timeout_s: u64,
) -> anyhow::Result<Box<dyn MindProvider>> {
    match name {
        "openai_compatible" => Ok(Box::new(provider::OpenAiCompatProvider::new(
            base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model,
            api_key,
            timeout_s,
        )?)),
        "anthropic" => Ok(Box::new(provider::AnthropicProvider::new(model, api_key, timeout_s)?)),
        "codex_schema" => Ok(Box::new(provider::CodexSchemaProvider {
            binary: "codex".to_string(),
            project_root: std::env::current_dir().unwrap_or_else(|_| ".".into()),
        })),
        other => anyhow::bail!("unknown mind provider '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_required_schemas_are_embedded() {
        for name in [
            "extract_evidence",
            "risk_judge",
            "plan_min_checks",
            "auto_answer_to_hands",
            "decide_next",
            "loop_break",
            "workflow_progress",
            "suggest_workflow",
            "mine_preferences",
            "mine_claims",
            "checkpoint_decide",
            "learn_update",
            "why_trace",
        ] {
            let text = schema_text(name).unwrap_or_else(|| panic!("missing schema {name}"));
            let parsed: serde_json::Value = serde_json::from_str(text).unwrap_or_else(|e| panic!("{name}: {e}"));
            assert!(parsed.is_object());
        }
    }

    #[test]
    fn unknown_schema_name_returns_none() {
        assert!(schema_text("not_a_real_schema").is_none());
    }
}
