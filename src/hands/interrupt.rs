//! Interrupt escalation: a timer-driven state machine that watches Hands'
//! command-execution events and sends an escalating unix signal sequence to
//! the child process (spec.md §4.1, §9 "Interrupt escalation loop").

use anyhow::Result;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptMode {
    Off,
    OnHighRisk,
    OnAnyExternal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptConfig {
    pub mode: InterruptMode,
    #[serde(default = "default_signal_sequence")]
    pub signal_sequence: Vec<String>,
    #[serde(default = "default_escalation_ms")]
    pub escalation_ms: Vec<u64>,
}

fn default_signal_sequence() -> Vec<String> {
    vec!["SIGINT".to_string(), "SIGTERM".to_string(), "SIGKILL".to_string()]
}

fn default_escalation_ms() -> Vec<u64> {
    vec![0, 3000, 8000]
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            mode: InterruptMode::Off,
            signal_sequence: default_signal_sequence(),
            escalation_ms: default_escalation_ms(),
        }
    }
}

const ANY_EXTERNAL_PATTERNS: &[&str] = &[
    "pip install",
    "npm install",
    "pnpm install",
    "yarn add",
    "curl ",
    "wget ",
    "git push",
    "rm -rf",
    "sudo ",
];

const HIGH_RISK_PATTERNS: &[&str] = &["git push", "rm -rf", "sudo ", "curl | sh", "wget | sh"];

/// True if `command` matches the detection heuristics for `mode`.
pub fn command_matches(mode: InterruptMode, command: &str) -> bool {
    let collapsed: String = command.split_whitespace().collect::<Vec<_>>().join(" ");
    let lower = collapsed.to_lowercase();
    match mode {
        InterruptMode::Off => false,
        InterruptMode::OnAnyExternal => ANY_EXTERNAL_PATTERNS.iter().any(|p| lower.contains(p)),
        InterruptMode::OnHighRisk => HIGH_RISK_PATTERNS.iter().any(|p| lower.contains(p)),
    }
}

fn signal_from_name(name: &str) -> Option<Signal> {
    match name {
        "SIGINT" => Some(Signal::SIGINT),
        "SIGTERM" => Some(Signal::SIGTERM),
        "SIGKILL" => Some(Signal::SIGKILL),
        "SIGHUP" => Some(Signal::SIGHUP),
        _ => None,
    }
}

/// Per-batch escalation state: tracks whether an interrupt has been
/// requested and which signal indices have already fired.
pub struct Escalator {
    config: InterruptConfig,
    requested_at: Option<Instant>,
    sent_up_to: usize,
}

impl Escalator {
    pub fn new(config: InterruptConfig) -> Self {
        Self {
            config,
            requested_at: None,
            sent_up_to: 0,
        }
    }

    pub fn request(&mut self, now: Instant) {
        if self.requested_at.is_none() {
            self.requested_at = Some(now);
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested_at.is_some()
    }

    /// Called on each escalation tick. Returns the signal name (if any) that
    /// should now be sent, and advances the internal cursor. Idempotent per
    /// index: each entry in `signal_sequence` fires at most once.
    pub fn tick(&mut self, now: Instant) -> Option<String> {
        let requested_at = self.requested_at?;
        if self.sent_up_to >= self.config.signal_sequence.len() {
            return None;
        }
        let threshold_ms = self.config.escalation_ms.get(self.sent_up_to).copied().unwrap_or(0);
        let elapsed = now.duration_since(requested_at).as_millis() as u64;
        if elapsed >= threshold_ms {
            let signal = self.config.signal_sequence[self.sent_up_to].clone();
            self.sent_up_to += 1;
            Some(signal)
        } else {
            None
        }
    }

    pub fn send(&self, pid: i32, signal_name: &str) -> Result<()> {
        if let Some(signal) = signal_from_name(signal_name) {
            kill(Pid::from_raw(pid), signal).ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_matches_on_any_external_patterns() {
        assert!(command_matches(InterruptMode::OnAnyExternal, "npm install left-pad"));
        assert!(command_matches(InterruptMode::OnAnyExternal, "  git   push origin main"));
        assert!(!command_matches(InterruptMode::OnAnyExternal, "ls -la"));
    }

    #[test]
    fn command_matches_on_high_risk_is_stricter() {
        assert!(command_matches(InterruptMode::OnHighRisk, "sudo rm -rf /"));
        assert!(!command_matches(InterruptMode::OnHighRisk, "npm install"));
    }

    #[test]
    fn command_matches_off_never_matches() {
        assert!(!command_matches(InterruptMode::Off, "rm -rf /"));
    }

    #[test]
    fn escalator_fires_each_signal_once_in_order() {
        let config = InterruptConfig {
            mode: InterruptMode::OnHighRisk,
            signal_sequence: vec!["SIGINT".into(), "SIGTERM".into()],
            escalation_ms: vec![0, 100],
        };
        let mut esc = Escalator::new(config);
        let t0 = Instant::now();
        esc.request(t0);

        assert_eq!(esc.tick(t0), Some("SIGINT".to_string()));
        assert_eq!(esc.tick(t0), None); // not yet past 100ms for SIGTERM

        let t1 = t0 + std::time::Duration::from_millis(150);
        assert_eq!(esc.tick(t1), Some("SIGTERM".to_string()));
        assert_eq!(esc.tick(t1), None); // exhausted
    }

    #[test]
    fn escalator_without_request_never_fires() {
        let mut esc = Escalator::new(InterruptConfig::default());
        assert_eq!(esc.tick(Instant::now()), None);
    }
}
