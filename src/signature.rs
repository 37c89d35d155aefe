//! Stable digests used for deduplication: claim signatures (Thought DB) and
//! loop signatures (loop-guard). Both normalize whitespace and casing
//! identically, per spec.md §9 ("Signature stability").

use sha2::{Digest, Sha256};

/// Whitespace-collapse + lowercase, matching
/// `original_source/mi/thoughtdb.py:_norm_text`.
pub fn normalize_text(text: &str) -> String {
    text.trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `sha256(claim_type | scope | project_id | normalized_text)`.
pub fn claim_signature(claim_type: &str, scope: &str, project_id: &str, text: &str) -> String {
    let base = format!(
        "{}|{}|{}|{}",
        claim_type.trim(),
        scope.trim(),
        project_id.trim(),
        normalize_text(text)
    );
    let mut hasher = Sha256::new();
    hasher.update(base.as_bytes());
    hex_digest(hasher)
}

/// `sha256(normalize(last_hands_message) + "---" + normalize(next_input))`,
/// normalize = lowercase + whitespace-collapse + truncate to 2000 chars.
pub fn loop_signature(last_hands_message: &str, next_input: &str) -> String {
    let a = truncate_chars(&normalize_text(last_hands_message), 2000);
    let b = truncate_chars(&normalize_text(next_input), 2000);
    let base = format!("{a}---{b}");
    let mut hasher = Sha256::new();
    hasher.update(base.as_bytes());
    hex_digest(hasher)
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_lowercases() {
        assert_eq!(normalize_text("  Hello   World\n"), "hello world");
    }

    #[test]
    fn claim_signature_is_stable_across_whitespace_variants() {
        let a = claim_signature("fact", "project", "p1", "Do  the thing");
        let b = claim_signature("fact", "project", "p1", "do the thing");
        assert_eq!(a, b);
    }

    #[test]
    fn claim_signature_differs_by_scope() {
        let a = claim_signature("fact", "project", "p1", "same text");
        let b = claim_signature("fact", "global", "p1", "same text");
        assert_ne!(a, b);
    }

    #[test]
    fn loop_signature_is_order_sensitive() {
        let a = loop_signature("msg one", "input two");
        let b = loop_signature("input two", "msg one");
        assert_ne!(a, b);
    }

    #[test]
    fn loop_signature_truncates_long_input() {
        let long = "x".repeat(5000);
        let a = loop_signature(&long, "next");
        let b = loop_signature(&"x".repeat(2000), "next");
        assert_eq!(a, b);
    }
}
