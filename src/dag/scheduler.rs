//! Batch scheduling: layer a task graph into concurrency-safe batches.
//!
//! Layering is Kahn's algorithm taken a round at a time: every round
//! collects all tasks whose dependencies are in earlier layers, sorted by
//! id. A round larger than `max_batch_size` is split into the fewest
//! near-equal batches that fit. Output depends only on the graph.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::dag::builder::{TaskGraph, TaskIndex};
use crate::stageflow_config::{MAX_BATCH_SIZE, MIN_BATCH_SIZE};

/// Tasks that may run together. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    /// Dependency layer this batch was cut from
    pub layer: usize,
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchScheduler {
    max_batch_size: usize,
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self {
            max_batch_size: MAX_BATCH_SIZE,
        }
    }
}

impl BatchScheduler {
    /// `max_batch_size` is clamped into the supported range. Batches cut
    /// from a split layer can still hold fewer than `MIN_BATCH_SIZE` tasks.
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Dependency layers, each sorted by task id.
    pub fn layers(&self, graph: &TaskGraph) -> Vec<Vec<String>> {
        let mut in_degree: Vec<usize> = (0..graph.len())
            .map(|i| graph.dependencies(i).len())
            .collect();

        // BTreeMap keeps each round ordered by id
        let mut ready: BTreeMap<&str, TaskIndex> = (0..graph.len())
            .filter(|&i| in_degree[i] == 0)
            .filter_map(|i| graph.id(i).map(|id| (id, i)))
            .collect();

        let mut layers = Vec::new();
        while !ready.is_empty() {
            let round = std::mem::take(&mut ready);
            for &node in round.values() {
                for &dependent in graph.dependents(node) {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0
                        && let Some(id) = graph.id(dependent)
                    {
                        ready.insert(id, dependent);
                    }
                }
            }
            layers.push(round.keys().map(|id| id.to_string()).collect());
        }
        layers
    }

    /// Layers split into batches no larger than `max_batch_size`.
    pub fn schedule(&self, graph: &TaskGraph) -> Vec<Batch> {
        self.layers(graph)
            .into_iter()
            .enumerate()
            .flat_map(|(layer, ids)| {
                split_evenly(ids, self.max_batch_size)
                    .into_iter()
                    .map(move |tasks| Batch { layer, tasks })
            })
            .collect()
    }
}

/// Split into `ceil(n / max)` chunks whose sizes differ by at most one,
/// larger chunks first.
fn split_evenly(ids: Vec<String>, max: usize) -> Vec<Vec<String>> {
    let n = ids.len();
    if n <= max {
        return vec![ids];
    }
    let chunks = n.div_ceil(max);
    let base = n / chunks;
    let extra = n % chunks;

    let mut iter = ids.into_iter();
    (0..chunks)
        .map(|i| {
            let size = base + usize::from(i < extra);
            iter.by_ref().take(size).collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::builder::DependencyAnalyzer;

    fn graph(nodes: &[(&str, &[&str])]) -> TaskGraph {
        DependencyAnalyzer::new(
            nodes
                .iter()
                .map(|(id, deps)| (id.to_string(), deps.iter().map(|d| d.to_string()).collect()))
                .collect(),
        )
        .build_graph()
        .unwrap()
    }

    fn ids(batch: &Batch) -> Vec<&str> {
        batch.tasks.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_diamond_free_layering() {
        let g = graph(&[("T3", &["T1", "T2"]), ("T1", &[]), ("T2", &[])]);
        let batches = BatchScheduler::default().schedule(&g);
        assert_eq!(batches.len(), 2);
        assert_eq!(ids(&batches[0]), vec!["T1", "T2"]);
        assert_eq!(ids(&batches[1]), vec!["T3"]);
        assert_eq!(batches[1].layer, 1);
    }

    #[test]
    fn test_every_task_after_its_dependencies() {
        let g = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
            ("e", &[]),
            ("f", &["e", "d"]),
        ]);
        let batches = BatchScheduler::default().schedule(&g);

        let mut position = std::collections::HashMap::new();
        for (i, batch) in batches.iter().enumerate() {
            for id in &batch.tasks {
                assert!(position.insert(id.clone(), i).is_none(), "{} scheduled twice", id);
            }
        }
        assert_eq!(position.len(), 6);
        for (id, deps) in [("b", vec!["a"]), ("d", vec!["b", "c"]), ("f", vec!["e", "d"])] {
            for dep in deps {
                assert!(position[dep] < position[id], "{} must precede {}", dep, id);
            }
        }
    }

    #[test]
    fn test_deterministic_regardless_of_declaration_order() {
        let forward = graph(&[("x", &[]), ("y", &[]), ("z", &["x"])]);
        let reversed = graph(&[("z", &["x"]), ("y", &[]), ("x", &[])]);
        let scheduler = BatchScheduler::default();
        assert_eq!(scheduler.schedule(&forward), scheduler.schedule(&reversed));
    }

    #[test]
    fn test_wide_layer_splits_evenly() {
        let names: Vec<String> = (0..10).map(|i| format!("t{:02}", i)).collect();
        let nodes: Vec<(&str, &[&str])> = names.iter().map(|n| (n.as_str(), &[][..])).collect();
        let g = graph(&nodes);

        let batches = BatchScheduler::new(8).schedule(&g);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].tasks.len(), 5);
        assert_eq!(batches[1].tasks.len(), 5);
        assert!(batches.iter().all(|b| b.layer == 0));
        assert_eq!(batches[0].tasks[0], "t00");
        assert_eq!(batches[1].tasks[0], "t05");
    }

    #[test]
    fn test_split_sizes() {
        let make = |n: usize| (0..n).map(|i| i.to_string()).collect::<Vec<_>>();
        let sizes = |v: Vec<Vec<String>>| v.iter().map(Vec::len).collect::<Vec<_>>();

        assert_eq!(sizes(split_evenly(make(8), 8)), vec![8]);
        assert_eq!(sizes(split_evenly(make(9), 8)), vec![5, 4]);
        assert_eq!(sizes(split_evenly(make(17), 8)), vec![6, 6, 5]);
        assert_eq!(sizes(split_evenly(make(7), 3)), vec![3, 2, 2]);
        assert_eq!(sizes(split_evenly(make(5), 4)), vec![3, 2]);
        assert_eq!(sizes(split_evenly(make(2), 8)), vec![2]);
    }

    #[test]
    fn test_max_batch_size_clamped() {
        assert_eq!(BatchScheduler::new(1).max_batch_size(), 3);
        assert_eq!(BatchScheduler::new(50).max_batch_size(), 8);
    }

    #[test]
    fn test_empty_graph_has_no_batches() {
        let g = graph(&[]);
        assert!(BatchScheduler::default().schedule(&g).is_empty());
    }
}
