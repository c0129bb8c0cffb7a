mod check_cmd;
mod config;
mod issues_cmd;
mod logs_cmd;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use config::CliOverrides;

#[derive(Parser)]
#[command(name = "autodev", about = "Markdown-plan orchestrator for fleets of CLI coding agents")]
struct Cli {
    /// Agent CLI binary (overrides AUTODEV_AGENT_BIN and the config file)
    #[arg(long, global = true)]
    agent: Option<String>,

    /// Data directory for sessions and logs (overrides AUTODEV_USER_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Parse a plan file and report tasks, waves, and graph problems
    Check {
        /// Path to the plan file (AUTO-DEV.md)
        plan: PathBuf,
    },
    /// Run a plan to completion
    Run {
        /// Path to the plan file (AUTO-DEV.md)
        plan: PathBuf,
        /// Maximum number of concurrent workers (1..=4)
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Disable automatic retry of failed tasks
        #[arg(long)]
        no_auto_retry: bool,
        /// Suppress per-worker log lines
        #[arg(long)]
        quiet: bool,
    },
    /// Show the persisted session for a plan
    Status {
        /// Path to the plan file
        plan: PathBuf,
    },
    /// List tracked issues for a plan
    Issues {
        /// Path to the plan file
        plan: PathBuf,
        /// Write a Markdown report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the most recent archived log for a task
    Logs {
        /// Task id
        task_id: String,
        /// Only print the last N lines
        #[arg(long)]
        tail: Option<usize>,
    },
}

fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }
    let file = config::ConfigFile::default();
    config::save_config(&file)?;
    println!("Config written to {}", path.display());
    println!("  agent binary: {}", file.scheduler.agent_binary);
    println!("  max parallel: {}", file.scheduler.max_parallel);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let overrides = CliOverrides {
        agent_binary: cli.agent.clone(),
        user_data_dir: cli.data_dir.clone(),
        ..Default::default()
    };

    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::Check { plan } => {
            let ok = check_cmd::run_check(&plan)?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Run {
            plan,
            max_parallel,
            no_auto_retry,
            quiet,
        } => {
            let overrides = CliOverrides {
                max_parallel,
                no_auto_retry,
                ..overrides
            };
            let config = config::resolve(&overrides)?;
            let all_success = run_cmd::run_plan(&plan, config, quiet).await?;
            if !all_success {
                std::process::exit(1);
            }
        }
        Commands::Status { plan } => {
            let config = config::resolve(&overrides)?;
            status_cmd::run_status(&plan, &config)?;
        }
        Commands::Issues { plan, report } => {
            let config = config::resolve(&overrides)?;
            issues_cmd::run_issues(&plan, &config, report.as_deref())?;
        }
        Commands::Logs { task_id, tail } => {
            let config = config::resolve(&overrides)?;
            logs_cmd::run_logs(&task_id, &config, tail).await?;
        }
    }

    Ok(())
}
