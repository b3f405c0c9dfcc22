//! Dependency analysis: build and validate the task graph of one phase.
//!
//! Edges follow `depends_on`: a task must complete before anything that
//! depends on it. The graph is rejected if any dependency is dangling, any id
//! repeats, or the edges form a cycle.

use stageflow_common::{Task, TaskDeclaration};
use std::collections::{BTreeMap, HashSet};

use crate::errors::{Result, StageflowError};

/// Index into the task list.
pub type TaskIndex = usize;

/// A validated, acyclic graph of tasks.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// Task ids indexed by their position
    ids: Vec<String>,
    /// Sorted id → index
    index_map: BTreeMap<String, TaskIndex>,
    /// index → tasks that depend on it
    forward_edges: Vec<Vec<TaskIndex>>,
    /// index → tasks it depends on
    reverse_edges: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, index: TaskIndex) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    pub fn index_of(&self, id: &str) -> Option<TaskIndex> {
        self.index_map.get(id).copied()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Tasks that depend on `index`.
    pub fn dependents(&self, index: TaskIndex) -> &[TaskIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Tasks that `index` depends on.
    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Tasks with no dependencies.
    pub fn roots(&self) -> Vec<TaskIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn dependencies_satisfied(&self, index: TaskIndex, done: &HashSet<TaskIndex>) -> bool {
        self.dependencies(index).iter().all(|dep| done.contains(dep))
    }
}

/// Builds [`TaskGraph`]s from `(id, depends_on)` pairs.
pub struct DependencyAnalyzer {
    nodes: Vec<(String, Vec<String>)>,
}

impl DependencyAnalyzer {
    pub fn new(nodes: Vec<(String, Vec<String>)>) -> Self {
        Self { nodes }
    }

    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        Self::new(
            tasks
                .into_iter()
                .map(|t| (t.id.clone(), t.depends_on.iter().cloned().collect()))
                .collect(),
        )
    }

    pub fn from_declarations(decls: &[TaskDeclaration]) -> Self {
        Self::new(
            decls
                .iter()
                .map(|d| (d.id.clone(), d.depends_on.clone()))
                .collect(),
        )
    }

    /// Validate ids and dependencies, then check for cycles.
    pub fn build_graph(self) -> Result<TaskGraph> {
        let mut index_map = BTreeMap::new();
        for (i, (id, _)) in self.nodes.iter().enumerate() {
            if index_map.insert(id.clone(), i).is_some() {
                return Err(StageflowError::DuplicateTask { id: id.clone() });
            }
        }

        let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.nodes.len()];
        let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.nodes.len()];

        for (to_idx, (id, deps)) in self.nodes.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in deps {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    StageflowError::DanglingDependency {
                        task: id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                if !seen.insert(from_idx) {
                    continue;
                }
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = TaskGraph {
            ids: self.nodes.into_iter().map(|(id, _)| id).collect(),
            index_map,
            forward_edges,
            reverse_edges,
        };

        if let Some(path) = find_cycle(&graph) {
            return Err(StageflowError::CycleDetected { path });
        }

        Ok(graph)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search along `depends_on` edges, visiting ids in sorted
/// order. Returns the first cycle found as a closed path (`[A, B, A]`).
fn find_cycle(graph: &TaskGraph) -> Option<Vec<String>> {
    let mut marks = vec![Mark::Unvisited; graph.len()];
    let mut stack: Vec<TaskIndex> = Vec::new();

    for &start in graph.index_map.values() {
        if marks[start] == Mark::Unvisited
            && let Some(cycle) = visit(graph, start, &mut marks, &mut stack)
        {
            return Some(cycle);
        }
    }
    None
}

fn visit(
    graph: &TaskGraph,
    node: TaskIndex,
    marks: &mut [Mark],
    stack: &mut Vec<TaskIndex>,
) -> Option<Vec<String>> {
    marks[node] = Mark::OnStack;
    stack.push(node);

    let mut deps: Vec<TaskIndex> = graph.dependencies(node).to_vec();
    deps.sort_by(|a, b| graph.ids[*a].cmp(&graph.ids[*b]));

    for dep in deps {
        match marks[dep] {
            Mark::OnStack => {
                let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                let mut path: Vec<String> =
                    stack[start..].iter().map(|&n| graph.ids[n].clone()).collect();
                path.push(graph.ids[dep].clone());
                return Some(path);
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(graph, dep, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }

    stack.pop();
    marks[node] = Mark::Done;
    None
}
