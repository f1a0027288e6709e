//! CI Healing Agent
//!
//! Detects failing tests in a cloned repository, classifies each failure,
//! repairs it with deterministic tools or an LLM ensemble, validates the
//! result, and pushes a commit — bounded by a retry limit and a wall-clock
//! cap. `serve` exposes this as an HTTP surface; `run` executes a single
//! request synchronously and prints the resulting report.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use healer::config::Config;
use healer::ci_poll::GithubCiPoller;
use healer::healing_loop::{HealingLoop, RunRequest};
use healer::providers::{HttpProvider, LlmProvider, ProviderRegistry};
use healer::runner::ShellRunner;
use healer::server::{self, ServerState};
use healer::vcs::GitVcs;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "healer")]
#[command(about = "Autonomous CI healing agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP surface (`/api/run`, `/api/result/{task_id}`, `/api/health`).
    Serve {
        /// Address to bind, e.g. 0.0.0.0:8080.
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
    },
    /// Run one healing pass synchronously and print the resulting report as JSON.
    Run {
        /// Repository to heal, e.g. https://github.com/acme/widgets.git
        #[arg(long)]
        repo_url: String,

        /// Team name used to derive the healing branch.
        #[arg(long)]
        team_name: String,

        /// Team leader used to derive the healing branch.
        #[arg(long)]
        team_leader: String,

        /// Bearer token for cloning/pushing a private upstream repository.
        #[arg(long, env = "AGENT_UPSTREAM_TOKEN")]
        upstream_token: Option<String>,

        /// Run through classification and patch synthesis but skip commit/push.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;

    match cli.command {
        Commands::Serve { addr } => {
            let state = Arc::new(ServerState::new(config));
            server::run_server(state, &addr).await
        }
        Commands::Run {
            repo_url,
            team_name,
            team_leader,
            upstream_token,
            dry_run,
        } => {
            if dry_run {
                warn!("--dry-run set: commit/push are skipped, branch will not be pushed upstream");
            }

            let providers: Vec<Box<dyn LlmProvider>> = config
                .providers
                .iter()
                .cloned()
                .map(|p| Box::new(HttpProvider::new(p)) as Box<dyn LlmProvider>)
                .collect();

            let mut core = HealingLoop {
                vcs: if dry_run {
                    GitVcs::new(config.workspace.clone()).dry_run()
                } else {
                    GitVcs::new(config.workspace.clone())
                },
                runner: ShellRunner,
                providers: ProviderRegistry::new(providers),
                history: healer::history::HistoryLog::new(config.history_log_path.clone()),
                ci_poller: config
                    .github_token
                    .as_ref()
                    .map(|_| Box::new(GithubCiPoller) as Box<dyn healer::ci_poll::CiPoller>),
                retry_limit: config.retry_limit,
                wall_clock_limit: config.wall_clock_limit,
                ensemble_deadline: config.api_timeout,
                workspace_root: config.workspace.clone().into(),
                github_ci_timeout: config.github_ci_timeout,
            };

            let report = core
                .run(RunRequest {
                    repo_url,
                    team_name,
                    team_leader,
                    upstream_token,
                })
                .await;

            info!(ci_status = ?report.ci_status, fixes = report.total_fixes_applied, "run complete");
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
