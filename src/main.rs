// Mind Incarnation — supervisory autopilot for an execution agent.
// Entry point: parse argv, dispatch to the orchestrator or a store subcommand.

use anyhow::Result;
use clap::Parser;
use mind_incarnation::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let exit_code = mind_incarnation::cli::dispatch(cli).await?;
    std::process::exit(exit_code);
}
