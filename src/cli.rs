//! CLI argument parsing and subcommand dispatch (spec.md §6, "CLI surface
//! (boundary summary, not core)"). `mi run` drives the orchestrator; the
//! rest are thin read/mutate operations on the stores described in §6.
//!
//! Grounded on `src/cli/commands.rs`'s dispatch-by-subcommand shape,
//! generalized from a chat REPL's command set to MI's store-inspection
//! surface.

use crate::orchestrator::{self, RunRequest};
use crate::paths::{identity_key_for_root, GlobalPaths, ProjectIndex, ProjectPaths};
use crate::store::{ClaimType, EvidenceKind, EvidenceRecord, ThoughtDbStore, Visibility};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mi", about = "Mind Incarnation: a supervisory autopilot for an execution agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the autopilot loop against a task until done, blocked, or max_batches.
    Run {
        /// The task description handed to Hands on the first batch.
        task: String,
        /// Project root to operate in (defaults to the current directory).
        #[arg(long)]
        project_root: Option<PathBuf>,
        /// Override config's max_batches for this run only.
        #[arg(long)]
        max_batches: Option<u64>,
        /// Pre-supplied answer to the one-time testless-verification-strategy question.
        #[arg(long)]
        testless_strategy_answer: Option<String>,
    },
    /// Print the resolved project id, hands thread id, and active workflow.
    Status {
        #[arg(long)]
        project_root: Option<PathBuf>,
    },
    /// Show a single record by event/claim/edge/node id.
    Show {
        /// Any `ev_*` / `cl_*` / `ed_*` / `nd_*` id.
        reference: String,
        #[arg(long)]
        project_root: Option<PathBuf>,
    },
    /// Inspect Thought DB claims.
    Claim {
        #[command(subcommand)]
        command: ClaimCommand,
    },
    /// Inspect Thought DB edges.
    Edge {
        #[command(subcommand)]
        command: EdgeCommand,
    },
    /// Inspect Thought DB nodes.
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },
    /// Inspect and apply learn-suggested preference hints.
    Learned {
        #[command(subcommand)]
        command: LearnedCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ClaimCommand {
    /// List active claims, optionally filtered by tag.
    List {
        #[arg(long)]
        project_root: Option<PathBuf>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        global: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum EdgeCommand {
    /// List edges touching a claim id.
    List {
        #[arg(long)]
        project_root: Option<PathBuf>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        global: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum NodeCommand {
    /// List materialized decision/action/summary nodes.
    List {
        #[arg(long)]
        project_root: Option<PathBuf>,
        #[arg(long)]
        global: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum LearnedCommand {
    /// List learn_suggested EvidenceLog records not yet applied.
    List {
        #[arg(long)]
        project_root: Option<PathBuf>,
    },
    /// Apply a pending learn_suggested record by its event_id: writes the
    /// preference Claim it describes and records `learn_applied`.
    ApplySuggested {
        event_id: String,
        #[arg(long)]
        project_root: Option<PathBuf>,
    },
}

fn project_root_or_cwd(project_root: Option<PathBuf>) -> Result<PathBuf> {
    match project_root {
        Some(p) => Ok(p),
        None => std::env::current_dir().context("failed to read current directory"),
    }
}

/// Resolve `(project_id, ProjectPaths)` the same way `orchestrator::run`
/// does (spec.md §3, project identity key), for every read-only subcommand.
fn resolve_project(project_root: &std::path::Path) -> Result<(String, ProjectPaths)> {
    let global = GlobalPaths::new()?;
    global.ensure_all()?;
    let (git_origin, git_commit) = orchestrator::git_identity(project_root);
    let identity_key = identity_key_for_root(project_root, git_origin.as_deref(), git_commit.as_deref(), "");
    let mut project_index = ProjectIndex::load(&global.project_index_json())?;
    let project_id = project_index.resolve_or_create(&global.project_index_json(), &identity_key)?;
    let project_paths = ProjectPaths::new(&global, &project_id);
    project_paths.ensure_all()?;
    Ok((project_id, project_paths))
}

pub async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run { task, project_root, max_batches, testless_strategy_answer } => {
            let root = project_root_or_cwd(project_root)?;
            let outcome = orchestrator::run(RunRequest {
                task: &task,
                project_root: &root,
                max_batches,
                testless_strategy_answer: testless_strategy_answer.as_deref(),
            })
            .await?;
            println!(
                "status={} next_action={} batches_run={} thread_id={}",
                outcome.status, outcome.next_action, outcome.batches_run, outcome.thread_id
            );
            if let Some(q) = &outcome.ask_user_question {
                println!("ask_user_question: {q}");
            }
            Ok(outcome.exit_code())
        }
        Command::Status { project_root } => {
            let root = project_root_or_cwd(project_root)?;
            let (project_id, paths) = resolve_project(&root)?;
            let overlay = crate::store::ProjectOverlay::load_or_init(&paths.overlay_json(), &project_id, &root.to_string_lossy(), "")?;
            println!("project_id: {project_id}");
            println!("root_path:  {}", overlay.root_path);
            println!("thread_id:  {}", overlay.hands_state.thread_id.as_deref().unwrap_or("(none)"));
            println!("workflow:   active={} id={}", overlay.workflow_run.active, overlay.workflow_run.workflow_id.as_deref().unwrap_or("(none)"));
            println!(
                "testless:   chosen_once={} strategy={}",
                overlay.testless_verification_strategy.chosen_once,
                overlay.testless_verification_strategy.strategy.as_deref().unwrap_or("(none)")
            );
            Ok(0)
        }
        Command::Show { reference, project_root } => {
            let root = project_root_or_cwd(project_root)?;
            let (project_id, paths) = resolve_project(&root)?;
            show_reference(&reference, &project_id, &paths)
        }
        Command::Claim { command: ClaimCommand::List { project_root, tag, global } } => {
            let root = project_root_or_cwd(project_root)?;
            let (project_id, paths) = resolve_project(&root)?;
            let global_paths = GlobalPaths::new()?;
            let store = ThoughtDbStore::new(project_id, paths.thoughtdb_dir(), global_paths.global_thoughtdb_dir());
            let db = if global { &store.global } else { &store.project };
            let view = db.load_view()?;
            let mut claims: Vec<_> = view.claims_by_id.values().collect();
            if let Some(tag) = &tag {
                claims.retain(|c| c.tags.iter().any(|t| t == tag));
            }
            claims.retain(|c| matches!(view.claim_status(&c.claim_id), crate::store::ClaimStatus::Active));
            claims.sort_by(|a, b| a.asserted_ts.cmp(&b.asserted_ts));
            for c in claims {
                println!("{} [{:?}/{:?}] {:.2} {}", c.claim_id, c.claim_type, c.visibility, c.confidence, c.text);
            }
            Ok(0)
        }
        Command::Edge { command: EdgeCommand::List { project_root, from, global } } => {
            let root = project_root_or_cwd(project_root)?;
            let (project_id, paths) = resolve_project(&root)?;
            let global_paths = GlobalPaths::new()?;
            let store = ThoughtDbStore::new(project_id, paths.thoughtdb_dir(), global_paths.global_thoughtdb_dir());
            let db = if global { &store.global } else { &store.project };
            let view = db.load_view()?;
            for e in view.edges.iter().filter(|e| from.as_deref().map(|f| e.from_id == f).unwrap_or(true)) {
                println!("{} {:?} {} -> {}", e.edge_id, e.edge_type, e.from_id, e.to_id);
            }
            Ok(0)
        }
        Command::Node { command: NodeCommand::List { project_root, global } } => {
            let root = project_root_or_cwd(project_root)?;
            let (project_id, paths) = resolve_project(&root)?;
            let global_paths = GlobalPaths::new()?;
            let store = ThoughtDbStore::new(project_id, paths.thoughtdb_dir(), global_paths.global_thoughtdb_dir());
            let db = if global { &store.global } else { &store.project };
            let view = db.load_view()?;
            for n in view.nodes_by_id.values() {
                println!("{} [{:?}] {}", n.node_id, n.node_type, n.title);
            }
            Ok(0)
        }
        Command::Learned { command } => learned_dispatch(command),
    }
}

fn show_reference(reference: &str, project_id: &str, paths: &ProjectPaths) -> Result<i32> {
    let global_paths = GlobalPaths::new()?;
    if let Some(prefix) = reference.split('_').next() {
        match prefix {
            "ev" => {
                let log = crate::store::EvidenceLog::new(paths.evidence_jsonl());
                for record in log.iter()? {
                    if record.event_id.as_deref() == Some(reference) {
                        println!("{}", serde_json::to_string_pretty(&record)?);
                        return Ok(0);
                    }
                }
                bail!("no evidence record with event_id {reference}");
            }
            "cl" | "ed" | "nd" => {
                let store = ThoughtDbStore::new(project_id.to_string(), paths.thoughtdb_dir(), global_paths.global_thoughtdb_dir());
                for db in [&store.project, &store.global] {
                    let view = db.load_view()?;
                    if prefix == "cl" {
                        if let Some(c) = view.claims_by_id.get(reference) {
                            println!("{}", serde_json::to_string_pretty(c)?);
                            return Ok(0);
                        }
                    } else if prefix == "nd" {
                        if let Some(n) = view.nodes_by_id.get(reference) {
                            println!("{}", serde_json::to_string_pretty(n)?);
                            return Ok(0);
                        }
                    } else if let Some(e) = view.edges.iter().find(|e| e.edge_id == reference) {
                        println!("{}", serde_json::to_string_pretty(e)?);
                        return Ok(0);
                    }
                }
                bail!("no {prefix}_* record with id {reference}");
            }
            other => bail!("unrecognized reference prefix '{other}_'; expected ev/cl/ed/nd"),
        }
    } else {
        bail!("reference must have a '<prefix>_' shape");
    }
}

fn learned_dispatch(command: LearnedCommand) -> Result<i32> {
    match command {
        LearnedCommand::List { project_root } => {
            let root = project_root_or_cwd(project_root)?;
            let (_project_id, paths) = resolve_project(&root)?;
            let log = crate::store::EvidenceLog::new(paths.evidence_jsonl());
            for record in log.iter()? {
                if let EvidenceKind::LearnSuggested { source, auto_learn, learn_suggested, applied_claim_ids } = &record.kind {
                    if applied_claim_ids.is_empty() {
                        println!(
                            "{} source={source} auto_learn={auto_learn} {}",
                            record.event_id.as_deref().unwrap_or("?"),
                            learn_suggested
                        );
                    }
                }
            }
            Ok(0)
        }
        LearnedCommand::ApplySuggested { event_id, project_root } => {
            let root = project_root_or_cwd(project_root)?;
            let (project_id, paths) = resolve_project(&root)?;
            let log = crate::store::EvidenceLog::new(paths.evidence_jsonl());
            let records = log.iter()?;
            let target = records
                .iter()
                .find(|r| r.event_id.as_deref() == Some(event_id.as_str()))
                .context("no such learn_suggested event_id")?;
            let (scope_text, text) = match &target.kind {
                EvidenceKind::LearnSuggested { learn_suggested, applied_claim_ids, .. } => {
                    if !applied_claim_ids.is_empty() {
                        bail!("event_id {event_id} was already applied ({applied_claim_ids:?})");
                    }
                    let scope = learn_suggested.get("scope").and_then(|v| v.as_str()).unwrap_or("project").to_string();
                    let text = learn_suggested.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    (scope, text)
                }
                _ => bail!("event_id {event_id} is not a learn_suggested record"),
            };
            if text.trim().is_empty() {
                bail!("learn_suggested record {event_id} has no text to apply");
            }

            let global_paths = GlobalPaths::new()?;
            let store = ThoughtDbStore::new(project_id, paths.thoughtdb_dir(), global_paths.global_thoughtdb_dir());
            let db = if scope_text == "global" { &store.global } else { &store.project };
            let visibility = if scope_text == "global" { Visibility::Global } else { Visibility::Project };
            let claim_id = db.append_claim_create(
                ClaimType::Preference,
                &text,
                visibility,
                None,
                None,
                vec!["mi:manual_apply".to_string()],
                vec![event_id.clone()],
                1.0,
                "applied via `mi learned apply-suggested`".to_string(),
            )?;

            log.append(EvidenceRecord::new(
                target.batch_id.clone(),
                target.thread_id.clone(),
                EvidenceKind::LearnApplied { learn_suggestion_id: event_id.clone(), claim_id: claim_id.clone() },
            ))?;
            println!("applied: {claim_id}");
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn run_parses_task_and_overrides() {
        let cli = Cli::try_parse_from(["mi", "run", "fix the build", "--max-batches", "5"]).unwrap();
        match cli.command {
            Command::Run { task, max_batches, .. } => {
                assert_eq!(task, "fix the build");
                assert_eq!(max_batches, Some(5));
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn claim_list_defaults_to_project_scope() {
        let cli = Cli::try_parse_from(["mi", "claim", "list"]).unwrap();
        match cli.command {
            Command::Claim { command: ClaimCommand::List { global, tag, .. } } => {
                assert!(!global);
                assert!(tag.is_none());
            }
            other => panic!("expected Claim::List, got {other:?}"),
        }
    }

    #[test]
    fn learned_apply_suggested_requires_event_id() {
        assert!(Cli::try_parse_from(["mi", "learned", "apply-suggested"]).is_err());
    }
}
