//! stageflow: resumable phase workflows with approval gates and DAG-batched
//! task execution.
//!
//! A workflow moves through the fixed phases `spec → clarify → plan → tasks →
//! implement → optimize → ship → finalize`. Each phase may carry a task list
//! (run in dependency layers) and a gate that must approve before the next
//! phase starts. All state lives in one JSON document per workflow, saved with
//! an optimistic version check.

pub mod config;
pub mod dag;
pub mod errors;
pub mod executor;
pub mod gates;
pub mod orchestrator;
pub mod stageflow_config;
pub mod store;
pub mod tracker;
pub mod util;

pub use errors::{ErrorKind, Result, StageflowError};
pub use orchestrator::{Advance, Orchestrator, RunReport};
pub use stageflow_common as common;
