//! Flywheel CLI
//!
//! Thin wrapper: parse flags, merge the config file, wire the production
//! backends, run the session, report the shutdown reason.

use anyhow::{Context, Result};
use clap::Parser;
use flywheel::backend::ProcessBackend;
use flywheel::command::ShellRunner;
use flywheel::config::{PullPolicy, WheelConfig};
use flywheel::git::CliGit;
use flywheel::orchestrator::Orchestrator;
use flywheel::proposals::ProposalCategory;
use flywheel::tickets::JsonTicketRepo;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "flywheel", about = "Autonomous code-improvement orchestrator")]
struct Cli {
    /// Repository to work on
    #[arg(default_value = ".")]
    repo: PathBuf,

    /// Outer cycle budget
    #[arg(long)]
    step_budget: Option<u64>,

    /// Agent minutes per ticket
    #[arg(long)]
    ticket_step_budget: Option<u32>,

    /// Open-PR cap
    #[arg(long)]
    max_prs: Option<u32>,

    /// Parallel worker cap
    #[arg(long)]
    parallel: Option<usize>,

    /// Open PRs for completed tickets
    #[arg(long)]
    create_prs: Option<bool>,

    /// Bypass worktrees and PRs; edit the repository in place
    #[arg(long)]
    direct: bool,

    /// Re-run QA in a clean checkout before the PR
    #[arg(long)]
    cross_verify: bool,

    /// halt | warn on base-branch divergence
    #[arg(long)]
    pull_policy: Option<String>,

    /// Restrict proposal categories (comma-separated)
    #[arg(long)]
    categories: Option<String>,

    /// Confidence floor for proposals
    #[arg(long)]
    min_confidence: Option<u8>,

    /// Agent command (reads the prompt on stdin)
    #[arg(long)]
    agent: Option<String>,
}

fn parse_categories(raw: &str) -> Vec<ProposalCategory> {
    raw.split(',')
        .filter_map(|c| serde_json::from_value(serde_json::json!(c.trim())).ok())
        .collect()
}

fn apply_cli(mut config: WheelConfig, cli: &Cli) -> WheelConfig {
    if let Some(v) = cli.step_budget {
        config.budget.step_budget = v;
    }
    if let Some(v) = cli.ticket_step_budget {
        config.budget.ticket_step_budget = v;
    }
    if let Some(v) = cli.max_prs {
        config.budget.max_prs = v;
    }
    if let Some(v) = cli.parallel {
        config.budget.parallel = v;
    }
    if let Some(v) = cli.create_prs {
        config.create_prs = v;
    }
    if cli.direct {
        config.direct = true;
    }
    if cli.cross_verify {
        config.cross_verify = true;
    }
    if let Some(policy) = &cli.pull_policy {
        config.pull_policy = match policy.as_str() {
            "halt" => PullPolicy::Halt,
            _ => PullPolicy::Warn,
        };
    }
    if let Some(raw) = &cli.categories {
        config.categories = parse_categories(raw);
    }
    if let Some(v) = cli.min_confidence {
        config.min_confidence = v;
    }
    if let Some(agent) = &cli.agent {
        let mut parts = agent.split_whitespace();
        if let Some(program) = parts.next() {
            config.agent_command = program.to_string();
            config.agent_args = parts.map(String::from).collect();
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flywheel=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let repo_root = cli
        .repo
        .canonicalize()
        .with_context(|| format!("repository not found: {}", cli.repo.display()))?;

    let config = apply_cli(WheelConfig::load(&repo_root), &cli);

    let backend = Arc::new(ProcessBackend::new(
        config.agent_command.clone(),
        config.agent_args.clone(),
    ));
    let git = Arc::new(CliGit::new());
    let ticket_repo = Arc::new(
        JsonTicketRepo::open(config.state_dir(&repo_root).join("tickets.json"))
            .context("ticket repo")?,
    );
    let runner = Arc::new(ShellRunner);

    let user_signal = Arc::new(AtomicBool::new(false));
    {
        let flag = user_signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, finishing the current cycle");
                flag.store(true, Ordering::Relaxed);
            }
        });
    }

    let mut orchestrator = Orchestrator::new(
        repo_root,
        config,
        backend,
        git,
        ticket_repo,
        runner,
        user_signal,
    )?;

    let reason = orchestrator.run().await?;
    info!(%reason, "Session finished");
    println!("flywheel: session ended ({reason})");
    Ok(())
}
