//! Configuration view and validation commands for `stageflow config`.

use anyhow::Result;
use console::style;
use stageflow::stageflow_config::StageflowToml;
use std::path::Path;

use super::super::{Cli, ConfigCommands};
use super::load_config;

pub fn cmd_config(project_dir: &Path, cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config = load_config(project_dir, cli)?;
    let config_path = &config.config_file;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Stageflow Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No stageflow.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let settings = config.settings()?;
            println!("Effective values (with env/CLI overrides):");
            println!("  max_batch_size = {}", settings.max_batch_size);
            println!("  failure_tolerance = {}", settings.failure_tolerance);
            println!("  max_save_attempts = {}", settings.max_save_attempts);
            println!("  max_task_retries = {}", settings.max_task_retries);
            println!(
                "  cancellation_grace_secs = {}",
                settings.cancellation_grace.as_secs()
            );
            println!("  task_timeout_secs = {}", settings.task_timeout.as_secs());
            println!(
                "  clarify_ambiguity_threshold = {}",
                settings.thresholds.clarify_ambiguity
            );
            println!();

            println!("Skip rules:");
            for rule in &settings.skip_rules {
                println!("  {} when {}", rule.phase, rule.condition);
            }
            println!();

            println!("Gates:");
            for def in &settings.gates {
                let mut line = format!("  {:<10} {:<20} {}", def.phase.as_str(), def.name, def.kind);
                if let Some(predicate) = &def.predicate {
                    line.push_str(&format!(" ({})", predicate));
                }
                if let Some(cond) = &def.auto_approve_when {
                    line.push_str(&format!(" auto-approve when {}", cond));
                }
                if def.kind == stageflow::common::GateKind::Vote {
                    line.push_str(&format!(
                        " {} k={} quorum={}",
                        def.strategy, def.k, def.quorum
                    ));
                }
                println!("{}", line);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No stageflow.toml found. Using defaults (valid).");
                return Ok(());
            }

            let errors = config.validate();
            if errors.is_empty() {
                println!("{}", style("Configuration is valid.").green());
                return Ok(());
            }

            println!("Configuration errors:");
            for error in &errors {
                println!("  - {}", error);
            }
            return Err(stageflow::StageflowError::InvalidConfig(format!(
                "{} problem(s) in {}",
                errors.len(),
                config_path.display()
            ))
            .into());
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("stageflow.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.stageflow_dir)?;
            StageflowToml::default().save(config_path)?;

            println!("Created stageflow.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [defaults] max_batch_size, failure_tolerance, retries, timeouts");
            println!("  - [skip] clarify_ambiguity_threshold, rules");
            println!("  - [gates.<phase>] kind, predicate, auto_approve_when, voting");
            println!();
        }
    }

    Ok(())
}
