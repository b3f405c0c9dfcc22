use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::stageflow_config::{CONFIG_FILE_NAME, Overrides, Settings, StageflowToml};

/// Name of the per-project state directory.
pub const STAGEFLOW_DIR: &str = ".stageflow";

/// Runtime configuration for stageflow.
///
/// Resolves the on-disk layout under `.stageflow/` and carries the parsed
/// `stageflow.toml` together with any CLI overrides.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub stageflow_dir: PathBuf,
    pub state_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub log_dir: PathBuf,
    pub config_file: PathBuf,
    pub verbose: bool,
    pub toml: StageflowToml,
    pub overrides: Overrides,
}

impl Config {
    pub fn new(project_dir: &Path, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let stageflow_dir = project_dir.join(STAGEFLOW_DIR);
        let toml = StageflowToml::load_or_default(&stageflow_dir)?;

        Ok(Self {
            state_dir: stageflow_dir.join("state"),
            archive_dir: stageflow_dir.join("archive"),
            log_dir: stageflow_dir.join("logs"),
            config_file: stageflow_dir.join(CONFIG_FILE_NAME),
            stageflow_dir,
            project_dir,
            verbose,
            toml,
            overrides: Overrides::default(),
        })
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.state_dir.is_dir()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        std::fs::create_dir_all(&self.archive_dir)
            .context("Failed to create archive directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Settings with file, environment and CLI layers applied.
    pub fn settings(&self) -> Result<Settings> {
        Ok(self.toml.resolve(&self.overrides)?)
    }

    /// Validate configuration and return errors.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path(), false).unwrap();
        assert!(config.state_dir.ends_with(".stageflow/state"));
        assert!(config.archive_dir.ends_with(".stageflow/archive"));
        assert!(config.config_file.ends_with(".stageflow/stageflow.toml"));
        assert!(!config.is_initialized());

        config.ensure_directories().unwrap();
        assert!(config.is_initialized());
        assert!(config.log_dir.is_dir());
    }

    #[test]
    fn test_reads_config_file() {
        let dir = tempdir().unwrap();
        let sf = dir.path().join(STAGEFLOW_DIR);
        std::fs::create_dir_all(&sf).unwrap();
        std::fs::write(
            sf.join(CONFIG_FILE_NAME),
            "[defaults]\nfailure_tolerance = 2\n",
        )
        .unwrap();

        let config = Config::new(dir.path(), true).unwrap();
        assert_eq!(config.toml.defaults.failure_tolerance, 2);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_missing_project_dir_fails() {
        let dir = tempdir().unwrap();
        assert!(Config::new(&dir.path().join("nope"), false).is_err());
    }
}
