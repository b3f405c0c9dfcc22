//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                             |
//! |-----------------|--------------------------------------------------------------|
//! | `workflow`      | `Init`, `Start`, `Declare`, `Continue`, `Status`, `List`,    |
//! |                 | `Rollback`, `Signal`, `Archive`                              |
//! | `gate`          | `Approve`, `Reject`, `Vote`                                  |
//! | `task`          | `Task`, `Waive`, `Retry`                                     |
//! | `config`        | `Config`                                                     |

pub mod config;
pub mod gate;
pub mod task;
pub mod workflow;

pub use config::cmd_config;
pub use gate::{cmd_approve, cmd_reject, cmd_vote};
pub use task::{cmd_retry, cmd_task, cmd_waive};
pub use workflow::{
    cmd_archive, cmd_continue, cmd_declare, cmd_init, cmd_list, cmd_rollback, cmd_signal,
    cmd_start, cmd_status,
};

use anyhow::Result;
use stageflow::Orchestrator;
use stageflow::config::Config;
use stageflow::stageflow_config::Overrides;
use std::path::Path;

use super::Cli;

/// Project configuration with CLI overrides applied.
pub(crate) fn load_config(project_dir: &Path, cli: &Cli) -> Result<Config> {
    Ok(Config::new(project_dir, cli.verbose)?.with_overrides(Overrides {
        max_batch_size: cli.max_batch_size,
        failure_tolerance: cli.failure_tolerance,
    }))
}

/// Orchestrator for an initialized project.
pub(crate) fn open_orchestrator(project_dir: &Path, cli: &Cli) -> Result<Orchestrator> {
    let config = load_config(project_dir, cli)?;
    if !config.is_initialized() {
        anyhow::bail!(
            "No stageflow project at {}. Run 'stageflow init' first.",
            config.project_dir.display()
        );
    }
    Orchestrator::from_config(&config)
}

/// Name recorded for approvals and task ownership when none is given.
pub(crate) fn actor(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var("USER").ok())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "operator".to_string())
}
