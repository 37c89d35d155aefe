//! Loop-guard + loop-break (spec.md §4.5): a sliding window of the last six
//! `loop_signature`s, `aaa`/`abab` tail-pattern detection, and the
//! `loop_break` decision once a loop is caught.
//!
//! Grounded on `src/agent/reflection.rs`'s repetition check (a short window
//! of recent turn digests compared for an exact-repeat tail), generalized
//! here to the two named patterns and the four-way `loop_break` action set.

use crate::mind::{MindCallState, MindMediator};
use crate::signature::loop_signature;
use serde::Deserialize;
use std::collections::VecDeque;

const WINDOW_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPattern {
    /// Last three signatures identical.
    Aaa,
    /// Last four alternate: `-1 == -3`, `-2 == -4`.
    Abab,
}

impl LoopPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopPattern::Aaa => "aaa",
            LoopPattern::Abab => "abab",
        }
    }
}

/// Sliding window of recent loop signatures. One instance per run, reset
/// after every detection (spec.md §4.5: "clear the signature window and
/// continue").
#[derive(Debug, Clone, Default)]
pub struct LoopGuard {
    window: VecDeque<String>,
}

impl LoopGuard {
    pub fn new() -> Self {
        Self { window: VecDeque::with_capacity(WINDOW_SIZE) }
    }

    /// Compute and push `sig(last_hands_message, next_input)`, returning the
    /// detected pattern on the new tail, if any.
    pub fn push(&mut self, last_hands_message: &str, next_input: &str) -> Option<LoopPattern> {
        let sig = loop_signature(last_hands_message, next_input);
        self.window.push_back(sig);
        while self.window.len() > WINDOW_SIZE {
            self.window.pop_front();
        }
        self.detect()
    }

    fn detect(&self) -> Option<LoopPattern> {
        let n = self.window.len();
        if n >= 3 {
            let last = &self.window[n - 1];
            if &self.window[n - 2] == last && &self.window[n - 3] == last {
                return Some(LoopPattern::Aaa);
            }
        }
        if n >= 4 && self.window[n - 1] == self.window[n - 3] && self.window[n - 2] == self.window[n - 4] {
            return Some(LoopPattern::Abab);
        }
        None
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopBreakOutcome {
    Stop,
    RunChecksThenContinue { hands_check_input: Option<String> },
    SendNewInstruction { text: String },
    AskUser { question: String },
    /// `ask_when_uncertain=false`: blocked immediately, without asking Mind.
    Blocked,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LoopBreakResponse {
    action: String,
    #[serde(default)]
    new_instruction: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Handle a detected loop (spec.md §4.5). When `ask_when_uncertain=false`,
/// blocks immediately without consulting Mind. Otherwise calls the
/// `loop_break` schema and maps its `action` to an outcome; a Mind failure
/// also blocks, since there is no safe default action to guess at.
pub async fn handle_loop_detected(
    mediator: &MindMediator,
    batch_id: &str,
    ask_when_uncertain: bool,
    context_prompt: &str,
) -> (LoopBreakOutcome, MindCallState) {
    if !ask_when_uncertain {
        return (LoopBreakOutcome::Blocked, MindCallState::Ok);
    }

    let outcome = mediator.call("loop_break", context_prompt, "loop_break", batch_id).await;
    match (outcome.state, outcome.value) {
        (MindCallState::Ok, Some(value)) => match serde_json::from_value::<LoopBreakResponse>(value) {
            Ok(resp) => {
                let mapped = match resp.action.as_str() {
                    "stop" => LoopBreakOutcome::Stop,
                    "run_checks_then_continue" => LoopBreakOutcome::RunChecksThenContinue { hands_check_input: resp.new_instruction },
                    "send_new_instruction" => LoopBreakOutcome::SendNewInstruction {
                        text: resp.new_instruction.unwrap_or_default(),
                    },
                    "ask_user" => LoopBreakOutcome::AskUser {
                        question: resp.reason.unwrap_or_else(|| "Mind detected a repeating loop. How should I proceed?".to_string()),
                    },
                    _ => LoopBreakOutcome::Blocked,
                };
                (mapped, MindCallState::Ok)
            }
            Err(_) => (LoopBreakOutcome::Blocked, MindCallState::Error),
        },
        (state, _) => (LoopBreakOutcome::Blocked, state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_aaa_on_three_identical_messages() {
        let mut guard = LoopGuard::new();
        assert!(guard.push("Still working.", "do next").is_none());
        assert!(guard.push("Still working.", "do next").is_none());
        assert_eq!(guard.push("Still working.", "do next"), Some(LoopPattern::Aaa));
    }

    #[test]
    fn detects_abab_on_alternating_messages() {
        let mut guard = LoopGuard::new();
        guard.push("A", "x");
        guard.push("B", "y");
        guard.push("A", "x");
        assert_eq!(guard.push("B", "y"), Some(LoopPattern::Abab));
    }

    #[test]
    fn distinct_messages_never_trigger() {
        let mut guard = LoopGuard::new();
        for i in 0..10 {
            assert!(guard.push(&format!("message {i}"), &format!("next {i}")).is_none());
        }
    }

    #[test]
    fn clear_resets_the_window() {
        let mut guard = LoopGuard::new();
        guard.push("A", "x");
        guard.push("A", "x");
        guard.push("A", "x");
        guard.clear();
        assert!(guard.push("A", "x").is_none());
        assert!(guard.push("A", "x").is_none());
    }

    #[test]
    fn window_is_bounded_to_six_entries() {
        let mut guard = LoopGuard::new();
        for i in 0..20 {
            guard.push(&format!("msg {i}"), "x");
        }
        assert_eq!(guard.window.len(), WINDOW_SIZE);
    }

    #[tokio::test]
    async fn handle_loop_detected_blocks_immediately_when_ask_disabled() {
        let provider = crate::mind::provider::AnthropicProvider::new("claude".into(), "unused".into(), 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mediator = MindMediator::new(Box::new(provider), dir.path());
        let (outcome, state) = handle_loop_detected(&mediator, "b1", false, "loop detected").await;
        assert_eq!(outcome, LoopBreakOutcome::Blocked);
        assert_eq!(state, MindCallState::Ok);
    }
}
