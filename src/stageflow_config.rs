//! Configuration read from `.stageflow/stageflow.toml`.
//!
//! Values are layered file → environment → CLI flags. Everything missing
//! from the file falls back to the defaults below.
//!
//! # Configuration File Format
//!
//! ```toml
//! [defaults]
//! max_batch_size = 8
//! failure_tolerance = 0
//! max_save_attempts = 5
//! max_task_retries = 3
//! cancellation_grace_secs = 10
//! task_timeout_secs = 600
//!
//! [skip]
//! clarify_ambiguity_threshold = 3.0
//! skip_optimize_when_trivial = false
//!
//! [skip.rules]
//! clarify = "low_ambiguity"
//!
//! [gates.plan]
//! kind = "vote"
//! name = "plan-vote"
//! strategy = "first_to_ahead_by_k"
//! k = 2
//! quorum = 3
//!
//! [gates.ship]
//! enabled = false
//! ```
//!
//! Environment overrides: `STAGEFLOW_MAX_BATCH_SIZE`, `STAGEFLOW_FAILURE_TOLERANCE`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stageflow_common::{GateKind, Phase};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::errors::StageflowError;
use crate::gates::{
    GateController, GateDefinition, PredicateRegistry, Thresholds, VoteStrategy, default_gates,
};

pub const CONFIG_FILE_NAME: &str = "stageflow.toml";

pub const MIN_BATCH_SIZE: usize = 3;
pub const MAX_BATCH_SIZE: usize = 8;

/// Engine-wide defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Largest number of tasks dispatched together (3..=8). This bounds the
    /// setting, not each batch: a split layer may yield smaller batches,
    /// e.g. 5 tasks at a limit of 4 run as 3 + 2.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Blocking task failures a phase may absorb before its gate rejects
    #[serde(default)]
    pub failure_tolerance: usize,
    /// Attempts at an optimistic save before giving up with contention
    #[serde(default = "default_max_save_attempts")]
    pub max_save_attempts: u32,
    /// Operator retries allowed per task
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,
    /// How long a running task may ignore cancellation before it is aborted
    #[serde(default = "default_cancellation_grace_secs")]
    pub cancellation_grace_secs: u64,
    /// Wall-clock limit for one executor run
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

fn default_max_batch_size() -> usize {
    8
}

fn default_max_save_attempts() -> u32 {
    5
}

fn default_max_task_retries() -> u32 {
    3
}

fn default_cancellation_grace_secs() -> u64 {
    10
}

fn default_task_timeout_secs() -> u64 {
    600
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            failure_tolerance: 0,
            max_save_attempts: default_max_save_attempts(),
            max_task_retries: default_max_task_retries(),
            cancellation_grace_secs: default_cancellation_grace_secs(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

/// Phase skip rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipConfig {
    #[serde(default = "default_clarify_ambiguity_threshold")]
    pub clarify_ambiguity_threshold: f64,
    /// Skip optimize when the feature classification raised no flags
    #[serde(default)]
    pub skip_optimize_when_trivial: bool,
    /// Phase name → condition name. Replaces the built-in clarify rule when
    /// it names clarify.
    #[serde(default)]
    pub rules: BTreeMap<String, String>,
}

fn default_clarify_ambiguity_threshold() -> f64 {
    3.0
}

impl Default for SkipConfig {
    fn default() -> Self {
        Self {
            clarify_ambiguity_threshold: default_clarify_ambiguity_threshold(),
            skip_optimize_when_trivial: false,
            rules: BTreeMap::new(),
        }
    }
}

/// Override for the gate guarding one phase. Unset fields keep the built-in
/// gate's values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSection {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<GateKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve_when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<VoteStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            name: None,
            kind: None,
            predicate: None,
            auto_approve_when: None,
            strategy: None,
            k: None,
            quorum: None,
        }
    }
}

/// A phase that is passed over when `condition` holds on entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkipRule {
    pub phase: Phase,
    pub condition: String,
}

/// Root of `stageflow.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageflowToml {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub skip: SkipConfig,
    /// Keyed by phase name
    #[serde(default)]
    pub gates: BTreeMap<String, GateSection>,
}

impl StageflowToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stageflow.toml")
    }

    /// Load `.stageflow/stageflow.toml`, or defaults if the file is absent.
    pub fn load_or_default(stageflow_dir: &Path) -> Result<Self> {
        let config_path = stageflow_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize stageflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Built-in gates with `[gates.<phase>]` overrides applied.
    pub fn gate_definitions(&self) -> Result<Vec<GateDefinition>, StageflowError> {
        let mut by_phase: BTreeMap<Phase, GateDefinition> =
            default_gates().into_iter().map(|d| (d.phase, d)).collect();

        for (phase_name, section) in &self.gates {
            let phase: Phase = phase_name.parse()?;
            if !section.enabled {
                by_phase.remove(&phase);
                continue;
            }

            let mut def = by_phase.remove(&phase).unwrap_or_else(|| {
                GateDefinition::automated(
                    &format!("{}-gate", phase),
                    phase,
                    "within_failure_tolerance",
                )
            });
            if let Some(name) = &section.name {
                def.name = name.clone();
            }
            if let Some(kind) = section.kind {
                if kind != def.kind && kind != GateKind::Automated {
                    def.predicate = None;
                }
                if kind == GateKind::Automated && def.predicate.is_none() {
                    def.predicate = Some("within_failure_tolerance".to_string());
                }
                def.kind = kind;
            }
            if let Some(predicate) = &section.predicate {
                def.predicate = Some(predicate.clone());
            }
            if let Some(cond) = &section.auto_approve_when {
                def.auto_approve_when = Some(cond.clone());
            }
            if let Some(strategy) = section.strategy {
                def.strategy = strategy;
            }
            if let Some(k) = section.k {
                def.k = k;
            }
            if let Some(quorum) = section.quorum {
                def.quorum = quorum;
            }
            by_phase.insert(phase, def);
        }

        Ok(by_phase.into_values().collect())
    }

    /// Effective skip rules: the built-in clarify rule, the optional trivial
    /// optimize rule, then `[skip.rules]` entries (which win per phase).
    pub fn skip_rules(&self) -> Result<Vec<SkipRule>, StageflowError> {
        let mut rules: BTreeMap<Phase, String> = BTreeMap::new();
        rules.insert(Phase::Clarify, "low_ambiguity".to_string());
        if self.skip.skip_optimize_when_trivial {
            rules.insert(Phase::Optimize, "trivial_feature".to_string());
        }
        for (phase_name, condition) in &self.skip.rules {
            let phase: Phase = phase_name.parse()?;
            rules.insert(phase, condition.clone());
        }
        Ok(rules
            .into_iter()
            .map(|(phase, condition)| SkipRule { phase, condition })
            .collect())
    }

    /// Validate configuration and return every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let d = &self.defaults;

        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&d.max_batch_size) {
            errors.push(format!(
                "max_batch_size {} is outside {}..={}",
                d.max_batch_size, MIN_BATCH_SIZE, MAX_BATCH_SIZE
            ));
        }
        if d.max_save_attempts == 0 {
            errors.push("max_save_attempts must be at least 1".to_string());
        }
        if d.task_timeout_secs == 0 {
            errors.push("task_timeout_secs must be at least 1".to_string());
        }
        let threshold = self.skip.clarify_ambiguity_threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            errors.push(format!(
                "clarify_ambiguity_threshold {} must be a non-negative number",
                threshold
            ));
        }

        let registry = PredicateRegistry::with_builtins();
        match self.skip_rules() {
            Ok(rules) => {
                for rule in rules {
                    if rule.phase.is_first() {
                        errors.push(format!("phase {} cannot be skipped", rule.phase));
                    }
                    if !registry.has_condition(&rule.condition) {
                        errors.push(format!(
                            "skip rule for {} names unknown condition '{}'",
                            rule.phase, rule.condition
                        ));
                    }
                }
            }
            Err(e) => errors.push(format!("[skip.rules]: {}", e)),
        }

        match self.gate_definitions() {
            Ok(defs) => {
                if let Err(e) =
                    GateController::new(defs, registry, self.thresholds())
                {
                    errors.push(format!("[gates]: {}", e));
                }
            }
            Err(e) => errors.push(format!("[gates]: {}", e)),
        }

        errors
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            clarify_ambiguity: self.skip.clarify_ambiguity_threshold,
        }
    }

    /// Resolve the runtime settings, layering environment variables and then
    /// CLI overrides over the file values.
    pub fn resolve(&self, overrides: &Overrides) -> Result<Settings, StageflowError> {
        let errors = self.validate();
        if !errors.is_empty() {
            return Err(StageflowError::InvalidConfig(errors.join("; ")));
        }

        let max_batch_size = overrides
            .max_batch_size
            .or(env_usize("STAGEFLOW_MAX_BATCH_SIZE")?)
            .unwrap_or(self.defaults.max_batch_size);
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&max_batch_size) {
            return Err(StageflowError::InvalidConfig(format!(
                "max_batch_size {} is outside {}..={}",
                max_batch_size, MIN_BATCH_SIZE, MAX_BATCH_SIZE
            )));
        }
        let failure_tolerance = overrides
            .failure_tolerance
            .or(env_usize("STAGEFLOW_FAILURE_TOLERANCE")?)
            .unwrap_or(self.defaults.failure_tolerance);

        Ok(Settings {
            max_batch_size,
            failure_tolerance,
            max_save_attempts: self.defaults.max_save_attempts,
            max_task_retries: self.defaults.max_task_retries,
            cancellation_grace: Duration::from_secs(self.defaults.cancellation_grace_secs),
            task_timeout: Duration::from_secs(self.defaults.task_timeout_secs),
            thresholds: self.thresholds(),
            skip_rules: self.skip_rules()?,
            gates: self.gate_definitions()?,
        })
    }
}

fn env_usize(var: &str) -> Result<Option<usize>, StageflowError> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse::<usize>().map(Some).map_err(|_| {
            StageflowError::InvalidConfig(format!("{} must be a whole number, got '{}'", var, raw))
        }),
        Err(_) => Ok(None),
    }
}

/// Values supplied on the command line; they beat both file and environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub max_batch_size: Option<usize>,
    pub failure_tolerance: Option<usize>,
}

/// Fully resolved runtime knobs handed to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub max_batch_size: usize,
    pub failure_tolerance: usize,
    pub max_save_attempts: u32,
    pub max_task_retries: u32,
    pub cancellation_grace: Duration,
    pub task_timeout: Duration,
    pub thresholds: Thresholds,
    pub skip_rules: Vec<SkipRule>,
    pub gates: Vec<GateDefinition>,
}

impl Default for Settings {
    fn default() -> Self {
        let toml = StageflowToml::default();
        let d = &toml.defaults;
        Self {
            max_batch_size: d.max_batch_size,
            failure_tolerance: d.failure_tolerance,
            max_save_attempts: d.max_save_attempts,
            max_task_retries: d.max_task_retries,
            cancellation_grace: Duration::from_secs(d.cancellation_grace_secs),
            task_timeout: Duration::from_secs(d.task_timeout_secs),
            thresholds: toml.thresholds(),
            skip_rules: vec![SkipRule {
                phase: Phase::Clarify,
                condition: "low_ambiguity".to_string(),
            }],
            gates: default_gates(),
        }
    }
}

impl Settings {
    pub fn gate_controller(&self) -> Result<GateController, StageflowError> {
        GateController::new(
            self.gates.clone(),
            PredicateRegistry::with_builtins(),
            self.thresholds,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() -> (Option<String>, Option<String>) {
        let saved = (
            std::env::var("STAGEFLOW_MAX_BATCH_SIZE").ok(),
            std::env::var("STAGEFLOW_FAILURE_TOLERANCE").ok(),
        );
        unsafe {
            std::env::remove_var("STAGEFLOW_MAX_BATCH_SIZE");
            std::env::remove_var("STAGEFLOW_FAILURE_TOLERANCE");
        }
        saved
    }

    fn restore_env(saved: (Option<String>, Option<String>)) {
        unsafe {
            match saved.0 {
                Some(v) => std::env::set_var("STAGEFLOW_MAX_BATCH_SIZE", v),
                None => std::env::remove_var("STAGEFLOW_MAX_BATCH_SIZE"),
            }
            match saved.1 {
                Some(v) => std::env::set_var("STAGEFLOW_FAILURE_TOLERANCE", v),
                None => std::env::remove_var("STAGEFLOW_FAILURE_TOLERANCE"),
            }
        }
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let toml = StageflowToml::parse("").unwrap();
        assert_eq!(toml, StageflowToml::default());
        assert_eq!(toml.defaults.max_batch_size, 8);
        assert_eq!(toml.defaults.max_save_attempts, 5);
        assert_eq!(toml.skip.clarify_ambiguity_threshold, 3.0);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_partial_defaults_section() {
        let toml = StageflowToml::parse(
            r#"
[defaults]
max_batch_size = 4
failure_tolerance = 1
"#,
        )
        .unwrap();
        assert_eq!(toml.defaults.max_batch_size, 4);
        assert_eq!(toml.defaults.failure_tolerance, 1);
        assert_eq!(toml.defaults.max_task_retries, 3);
    }

    #[test]
    fn test_validate_batch_size_range() {
        let toml = StageflowToml::parse("[defaults]\nmax_batch_size = 12\n").unwrap();
        let errors = toml.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("max_batch_size 12"));
    }

    #[test]
    fn test_gate_overrides() {
        let toml = StageflowToml::parse(
            r#"
[gates.plan]
kind = "vote"
name = "plan-vote"
strategy = "unanimous"
quorum = 2

[gates.ship]
enabled = false

[gates.tasks]
predicate = "always"
"#,
        )
        .unwrap();
        let defs = toml.gate_definitions().unwrap();

        let plan = defs.iter().find(|d| d.phase == Phase::Plan).unwrap();
        assert_eq!(plan.name, "plan-vote");
        assert_eq!(plan.kind, GateKind::Vote);
        assert_eq!(plan.strategy, VoteStrategy::Unanimous);
        assert_eq!(plan.quorum, 2);
        assert_eq!(plan.k, 2);

        assert!(defs.iter().all(|d| d.phase != Phase::Ship));

        let tasks = defs.iter().find(|d| d.phase == Phase::Tasks).unwrap();
        assert_eq!(tasks.name, "tasks-gate");
        assert_eq!(tasks.predicate.as_deref(), Some("always"));
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_validate_unknown_names() {
        let toml = StageflowToml::parse(
            r#"
[skip.rules]
plan = "moon_phase"

[gates.deploy]
kind = "manual"
"#,
        )
        .unwrap();
        let errors = toml.validate();
        assert!(errors.iter().any(|e| e.contains("moon_phase")));
        assert!(errors.iter().any(|e| e.contains("deploy")));
    }

    #[test]
    fn test_skip_rules() {
        let toml = StageflowToml::parse(
            r#"
[skip]
skip_optimize_when_trivial = true
"#,
        )
        .unwrap();
        let rules = toml.skip_rules().unwrap();
        assert_eq!(
            rules,
            vec![
                SkipRule {
                    phase: Phase::Clarify,
                    condition: "low_ambiguity".into()
                },
                SkipRule {
                    phase: Phase::Optimize,
                    condition: "trivial_feature".into()
                },
            ]
        );
    }

    #[test]
    fn test_spec_phase_cannot_be_skipped() {
        let toml = StageflowToml::parse("[skip.rules]\nspec = \"never\"\n").unwrap();
        assert!(toml.validate().iter().any(|e| e.contains("cannot be skipped")));
    }

    #[test]
    fn test_resolve_layering() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = clear_env();

        let toml = StageflowToml::parse("[defaults]\nmax_batch_size = 5\n").unwrap();
        assert_eq!(toml.resolve(&Overrides::default()).unwrap().max_batch_size, 5);

        unsafe { std::env::set_var("STAGEFLOW_MAX_BATCH_SIZE", "6") };
        assert_eq!(toml.resolve(&Overrides::default()).unwrap().max_batch_size, 6);

        let cli = Overrides {
            max_batch_size: Some(3),
            failure_tolerance: Some(2),
        };
        let settings = toml.resolve(&cli).unwrap();
        assert_eq!(settings.max_batch_size, 3);
        assert_eq!(settings.failure_tolerance, 2);

        unsafe { std::env::set_var("STAGEFLOW_MAX_BATCH_SIZE", "20") };
        assert!(toml.resolve(&Overrides::default()).is_err());

        restore_env(saved);
    }

    #[test]
    fn test_settings_default_matches_empty_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = clear_env();

        let resolved = StageflowToml::default()
            .resolve(&Overrides::default())
            .unwrap();
        assert_eq!(resolved, Settings::default());

        restore_env(saved);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut toml = StageflowToml::default();
        toml.defaults.failure_tolerance = 2;
        toml.gates.insert(
            "plan".into(),
            GateSection {
                kind: Some(GateKind::Manual),
                ..Default::default()
            },
        );
        let path = dir.path().join(CONFIG_FILE_NAME);
        toml.save(&path).unwrap();

        let loaded = StageflowToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, toml);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = StageflowToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml, StageflowToml::default());
    }
}
