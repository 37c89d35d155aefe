//! Identifier generation: `<prefix>_<ns_ts>_<8-hex>` for every entity kind,
//! matching `original_source/mi/thoughtdb.py`'s `new_claim_id`/`new_edge_id`/
//! `new_node_id` shape, generalized to every prefix spec.md §3 names.

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use std::time::{SystemTime, UNIX_EPOCH};

fn ns_ts() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos()
}

fn random_hex8() -> String {
    let mut rng = SmallRng::from_rng(rand::thread_rng()).expect("seed small rng");
    let mut bytes = [0u8; 4];
    rng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}_{}", ns_ts(), random_hex8())
}

pub fn new_event_id() -> String {
    new_id("ev")
}

pub fn new_claim_id() -> String {
    new_id("cl")
}

pub fn new_edge_id() -> String {
    new_id("ed")
}

pub fn new_node_id() -> String {
    new_id("nd")
}

pub fn new_workflow_id() -> String {
    new_id("wf")
}

pub fn new_learn_suggestion_id() -> String {
    new_id("ls")
}

pub fn new_segment_id() -> String {
    new_id("seg")
}

pub fn batch_id(n: u64) -> String {
    format!("b{n}")
}

/// Dotted intra-batch phase suffix, e.g. `b3.from_decide`.
pub fn batch_phase_id(batch: &str, phase: &str) -> String {
    format!("{batch}.{phase}")
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_expected_prefix_and_shape() {
        let id = new_claim_id();
        assert!(id.starts_with("cl_"));
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn batch_phase_id_is_dotted() {
        assert_eq!(batch_phase_id("b3", "from_decide"), "b3.from_decide");
    }

    #[test]
    fn successive_ids_are_distinct() {
        let a = new_event_id();
        let b = new_event_id();
        assert_ne!(a, b);
    }
}
