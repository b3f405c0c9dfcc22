//! Task dependency graphs and their concurrent execution.
//!
//! 1. [`DependencyAnalyzer`] validates a phase's declared tasks into a [`TaskGraph`]
//! 2. [`BatchScheduler`] layers the graph into batches of independent tasks
//! 3. [`LayerExecutor`] runs the batches in order, each one concurrently
//!
//! ```
//! use stageflow::dag::{BatchScheduler, DependencyAnalyzer};
//!
//! let graph = DependencyAnalyzer::new(vec![
//!     ("T1".into(), vec![]),
//!     ("T2".into(), vec![]),
//!     ("T3".into(), vec!["T1".into(), "T2".into()]),
//! ])
//! .build_graph()
//! .unwrap();
//!
//! let batches = BatchScheduler::default().schedule(&graph);
//! assert_eq!(batches[0].tasks, vec!["T1", "T2"]);
//! assert_eq!(batches[1].tasks, vec!["T3"]);
//! ```

pub mod builder;
pub mod executor;
pub mod scheduler;

pub use builder::{DependencyAnalyzer, TaskGraph, TaskIndex};
pub use executor::{LayerEvent, LayerExecutor, LayerSummary, RUN_CANCELLED};
pub use scheduler::{Batch, BatchScheduler};
