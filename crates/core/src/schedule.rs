use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::stable_graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::Serialize;

use crate::error::EngineError;
use crate::graph::WorkflowGraph;

/// Ordered generations of node ids. Members of one generation share no edge and may run
/// concurrently; generations run strictly in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub generations: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.generations.iter().flatten().map(String::as_str)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.node_ids().any(|id| id == node_id)
    }
}

/// Kahn level sort over the full graph.
///
/// Generation k holds every node whose predecessors all sit in generations 0..k-1. Members are
/// listed in graph insertion order.
pub fn generations(graph: &WorkflowGraph) -> Result<Vec<Vec<String>>, EngineError> {
    let inner = graph.inner();
    let mut in_degree: HashMap<NodeIndex, usize> = inner
        .node_indices()
        .map(|idx| (idx, inner.edges_directed(idx, Direction::Incoming).count()))
        .collect();

    let mut current: Vec<NodeIndex> = inner
        .node_indices()
        .filter(|idx| in_degree[idx] == 0)
        .collect();
    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut placed = 0usize;

    while !current.is_empty() {
        current.sort();
        placed += current.len();

        let mut next = Vec::new();
        for &idx in &current {
            for edge in inner.edges_directed(idx, Direction::Outgoing) {
                let target = edge.target();
                if let Some(remaining) = in_degree.get_mut(&target) {
                    *remaining -= 1;
                    if *remaining == 0 {
                        next.push(target);
                    }
                }
            }
        }

        levels.push(
            current
                .iter()
                .map(|&idx| graph.node_at(idx).id.clone())
                .collect(),
        );
        current = next;
    }

    if placed != inner.node_count() {
        return Err(EngineError::CyclicGraph);
    }
    Ok(levels)
}

/// Every node in `targets` plus all of their transitive ancestors.
pub fn ancestor_closure(
    graph: &WorkflowGraph,
    targets: &[String],
) -> Result<HashSet<String>, EngineError> {
    let inner = graph.inner();
    let mut visited: HashSet<NodeIndex> = HashSet::new();
    let mut queue: VecDeque<NodeIndex> = VecDeque::new();

    for target in targets {
        let idx = graph
            .index_of(target)
            .ok_or_else(|| EngineError::UnknownTargetNode {
                node_id: target.clone(),
            })?;
        if visited.insert(idx) {
            queue.push_back(idx);
        }
    }

    while let Some(idx) = queue.pop_front() {
        for edge in inner.edges_directed(idx, Direction::Incoming) {
            let source = edge.source();
            if visited.insert(source) {
                queue.push_back(source);
            }
        }
    }

    Ok(visited
        .into_iter()
        .map(|idx| graph.node_at(idx).id.clone())
        .collect())
}

/// Plan a run. With targets, the full-graph generations are filtered down to the targets'
/// ancestor closure; membership is never recomputed and empty generations are dropped.
pub fn plan(graph: &WorkflowGraph, targets: Option<&[String]>) -> Result<ExecutionPlan, EngineError> {
    let full = generations(graph)?;

    let generations = match targets {
        Some(targets) if !targets.is_empty() => {
            let keep = ancestor_closure(graph, targets)?;
            full.into_iter()
                .map(|generation| {
                    generation
                        .into_iter()
                        .filter(|id| keep.contains(id))
                        .collect::<Vec<_>>()
                })
                .filter(|generation| !generation.is_empty())
                .collect()
        }
        _ => full,
    };

    Ok(ExecutionPlan { generations })
}
