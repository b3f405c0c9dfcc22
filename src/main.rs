use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stageflow::StageflowError;
use stageflow::common::{Phase, VoteDecision};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "stageflow")]
#[command(version, about = "Phase workflow orchestrator with approval gates")]
pub struct Cli {
    /// Debug-level logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Largest number of tasks dispatched together (3-8). Overrides stageflow.toml.
    #[arg(long, global = true)]
    pub max_batch_size: Option<usize>,

    /// Blocking task failures a phase may absorb. Overrides stageflow.toml.
    #[arg(long, global = true)]
    pub failure_tolerance: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the .stageflow directory and a default stageflow.toml
    Init,
    /// Start a workflow for a feature description
    Start {
        description: String,
        /// Workflow id (defaults to a slug of the description)
        #[arg(long)]
        id: Option<String>,
    },
    /// Declare the current phase's tasks from a JSON file ("-" for stdin)
    Declare { id: String, file: PathBuf },
    /// Run pending tasks and advance through phases until something blocks
    Continue {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Show a workflow's phase, gate, tasks and blockers
    Status {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// List active workflows
    List {
        #[arg(long)]
        json: bool,
    },
    /// Approve a manual gate
    Approve {
        id: String,
        gate: String,
        /// Recorded approver (defaults to $USER)
        #[arg(long)]
        by: Option<String>,
    },
    /// Reject a manual gate; the workflow fails until the phase is retried
    Reject {
        id: String,
        gate: String,
        reason: String,
        #[arg(long)]
        by: Option<String>,
    },
    /// Cast a vote on a vote gate
    Vote {
        id: String,
        gate: String,
        decision: VoteDecision,
        #[arg(long)]
        voter: Option<String>,
        #[arg(long, default_value = "1.0")]
        weight: f64,
    },
    /// Report progress on a task
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Waive a task so it no longer blocks its phase or dependents
    Waive {
        id: String,
        task: String,
        reason: String,
    },
    /// Retry a failed task, or reopen the current phase after a rejection
    Retry {
        id: String,
        #[arg(long)]
        task: Option<String>,
    },
    /// Move a workflow back to an earlier phase
    Rollback {
        id: String,
        phase: Phase,
        reason: String,
    },
    /// Record a named numeric signal (e.g. ambiguity) for skip rules
    Signal {
        id: String,
        name: String,
        value: f64,
    },
    /// Move a workflow's state document to the archive
    Archive { id: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum TaskCommands {
    /// Claim a pending task
    Start {
        id: String,
        task: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Complete an in-progress task with evidence
    Complete {
        id: String,
        task: String,
        /// What was done
        #[arg(long)]
        evidence: String,
        /// Command that was run (repeatable)
        #[arg(long = "command")]
        commands: Vec<String>,
        /// File or reference produced (repeatable)
        #[arg(long = "artifact")]
        artifacts: Vec<String>,
        #[arg(long)]
        commit: Option<String>,
    },
    /// Fail an in-progress task
    Fail {
        id: String,
        task: String,
        error: String,
    },
    /// Cancel a pending or in-progress task
    Cancel {
        id: String,
        task: String,
        reason: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and report errors
    Validate,
    /// Initialize a default stageflow.toml file
    Init,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "stageflow=debug" } else { "stageflow=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Exit code of the first stageflow error in the chain, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|e| e.downcast_ref::<StageflowError>())
        .map(|e| e.exit_code() as u8)
        .unwrap_or(1)
}

async fn run(cli: Cli) -> Result<()> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Start { description, id } => {
            cmd::cmd_start(&project_dir, &cli, description, id.as_deref())?
        }
        Commands::Declare { id, file } => cmd::cmd_declare(&project_dir, &cli, id, file).await?,
        Commands::Continue { id, json } => {
            cmd::cmd_continue(&project_dir, &cli, id, *json).await?
        }
        Commands::Status { id, json } => cmd::cmd_status(&project_dir, &cli, id, *json)?,
        Commands::List { json } => cmd::cmd_list(&project_dir, &cli, *json)?,
        Commands::Approve { id, gate, by } => {
            cmd::cmd_approve(&project_dir, &cli, id, gate, by.as_deref()).await?
        }
        Commands::Reject {
            id,
            gate,
            reason,
            by,
        } => cmd::cmd_reject(&project_dir, &cli, id, gate, reason, by.as_deref()).await?,
        Commands::Vote {
            id,
            gate,
            decision,
            voter,
            weight,
        } => {
            cmd::cmd_vote(
                &project_dir,
                &cli,
                id,
                gate,
                *decision,
                voter.as_deref(),
                *weight,
            )
            .await?
        }
        Commands::Task { command } => cmd::cmd_task(&project_dir, &cli, command.clone()).await?,
        Commands::Waive { id, task, reason } => {
            cmd::cmd_waive(&project_dir, &cli, id, task, reason).await?
        }
        Commands::Retry { id, task } => {
            cmd::cmd_retry(&project_dir, &cli, id, task.as_deref()).await?
        }
        Commands::Rollback { id, phase, reason } => {
            cmd::cmd_rollback(&project_dir, &cli, id, *phase, reason).await?
        }
        Commands::Signal { id, name, value } => {
            cmd::cmd_signal(&project_dir, &cli, id, name, *value).await?
        }
        Commands::Archive { id } => cmd::cmd_archive(&project_dir, &cli, id)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, &cli, command.clone())?,
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {:#}", console::style("Error:").red().bold(), err);
            ExitCode::from(exit_code(&err))
        }
    }
}
