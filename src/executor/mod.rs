//! Typed task executors.
//!
//! The layer executor hands each dispatchable task to the executor registered
//! for its [`TaskKind`]. Executors never touch workflow state: they report an
//! [`ExecutionOutcome`] and the caller records it through the task tracker.

mod command;
mod content;

pub use command::CommandExecutor;
pub use content::ContentExecutor;

use async_trait::async_trait;
use stageflow_common::{Evidence, Phase, Task, TaskKind};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;

/// Upper bound on captured output stored in evidence.
pub const MAX_CAPTURED_OUTPUT: usize = 4000;

/// Everything an executor needs besides the task itself.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow: String,
    pub phase: Phase,
    /// Working directory for commands and base for content outputs
    pub project_dir: PathBuf,
    pub timeout: Duration,
    /// Fires when the run is being cancelled; executors should stop promptly
    pub cancel: CancellationToken,
}

/// Result of running one task.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded(Evidence),
    Failed(String),
    /// The executor observed cancellation and stopped cooperatively
    Cancelled,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check the task carries what this executor needs, before dispatch.
    fn validate(&self, task: &Task) -> Result<()>;

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> ExecutionOutcome;
}

/// Maps task kinds to executors. Manual tasks have no executor.
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskKind, Arc<dyn TaskExecutor>>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        let command: Arc<dyn TaskExecutor> = Arc::new(CommandExecutor);
        let mut registry = Self::empty();
        registry.register(TaskKind::Build, Arc::clone(&command));
        registry.register(TaskKind::Test, command);
        registry.register(TaskKind::Content, Arc::new(ContentExecutor));
        registry
    }
}

impl ExecutorRegistry {
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register `executor` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: TaskKind, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(kind, executor);
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&kind).cloned()
    }
}

/// Keep the last `max` bytes of `text`, cut on a char boundary.
pub(crate) fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_covers_dispatchable_kinds() {
        let registry = ExecutorRegistry::default();
        assert_eq!(registry.get(TaskKind::Build).unwrap().name(), "command");
        assert_eq!(registry.get(TaskKind::Test).unwrap().name(), "command");
        assert_eq!(registry.get(TaskKind::Content).unwrap().name(), "content");
        assert!(registry.get(TaskKind::Manual).is_none());
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        // 'é' is two bytes; cutting inside it moves forward
        assert_eq!(tail("aé", 1), "");
        assert_eq!(tail("aéb", 2), "b");
    }
}
