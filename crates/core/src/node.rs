use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::error::EngineError;
use crate::graph::{NodeData, NodeInstance, WorkflowGraph, DEFAULT_TARGET_HANDLE};
use crate::model_runner::ModelInputs;

/// Values produced so far in one execution, keyed by node id.
///
/// Owned by the coordinator and only written between generations; nodes see a read-only
/// snapshot holding earlier generations' values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    values: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &str) -> Option<&serde_json::Value> {
        self.values.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.values.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn insert(&mut self, node_id: String, value: serde_json::Value) {
        self.values.insert(node_id, value);
    }
}

/// One value delivered over an edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeInput {
    pub handle: String,
    pub source_id: String,
    pub value: serde_json::Value,
}

/// Everything a handler may look at while evaluating one node.
pub struct NodeInputs<'a> {
    pub node: &'a NodeInstance,
    /// Sorted by (handle, source id).
    pub edge_inputs: Vec<EdgeInput>,
    pub context: &'a ExecutionContext,
    /// Caller supplied `input_data`, keyed by input declared name.
    pub overrides: &'a serde_json::Map<String, serde_json::Value>,
}

impl<'a> NodeInputs<'a> {
    pub fn collect(
        graph: &WorkflowGraph,
        node: &'a NodeInstance,
        context: &'a ExecutionContext,
        overrides: &'a serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            node,
            edge_inputs: collect_edge_inputs(graph, &node.id, context),
            context,
            overrides,
        }
    }

    /// The value on the `input` handle, or the only connected value when there is exactly one.
    pub fn primary(&self) -> Option<&serde_json::Value> {
        self.edge_inputs
            .iter()
            .find(|input| input.handle == DEFAULT_TARGET_HANDLE)
            .or_else(|| match self.edge_inputs.as_slice() {
                [only] => Some(only),
                _ => None,
            })
            .map(|input| &input.value)
    }
}

/// Gather values arriving over incoming edges. Sources without a context value contribute nothing.
pub fn collect_edge_inputs(
    graph: &WorkflowGraph,
    node_id: &str,
    context: &ExecutionContext,
) -> Vec<EdgeInput> {
    let mut inputs: Vec<EdgeInput> = graph
        .connections_to(node_id)
        .into_iter()
        .filter_map(|edge| {
            context.get(&edge.source).map(|value| EdgeInput {
                handle: edge.target_handle.clone(),
                source_id: edge.source.clone(),
                value: value.clone(),
            })
        })
        .collect();

    inputs.sort_by(|a, b| {
        (a.handle.as_str(), a.source_id.as_str()).cmp(&(b.handle.as_str(), b.source_id.as_str()))
    });
    inputs
}

/// What a handler decided for its node.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Final value, computed inline.
    Value(serde_json::Value),
    /// A billable model call the executor must perform on the blocking pool.
    Invoke {
        model_id: String,
        params: ModelInputs,
    },
}

/// Per-kind behavior. Handlers are built from the node's `data` and never see other nodes'
/// state beyond the snapshot handed to them.
pub trait NodeHandler: Send + Sync {
    fn evaluate(&self, inputs: &NodeInputs<'_>) -> Result<Evaluation, EngineError>;
}

/// Deserialize a node's opaque `data` map into a typed per-kind config.
pub fn parse_config<T: DeserializeOwned>(node: &NodeInstance) -> Result<T, EngineError> {
    parse_data(&node.id, &node.data)
}

fn parse_data<T: DeserializeOwned>(node_id: &str, data: &NodeData) -> Result<T, EngineError> {
    serde_json::from_value(serde_json::Value::Object(data.clone()))
        .map_err(|e| EngineError::node(node_id, format!("invalid node data: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph() -> WorkflowGraph {
        WorkflowGraph::parse(&json!({
            "nodes": [
                {"id": "b", "type": "input"},
                {"id": "a", "type": "input"},
                {"id": "z", "type": "input"},
                {"id": "u", "type": "utility"}
            ],
            "edges": [
                {"source": "b", "target": "u", "targetHandle": "input"},
                {"source": "a", "target": "u", "targetHandle": "input"},
                {"source": "z", "target": "u", "targetHandle": "extra"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_edge_inputs_sorted_by_handle_then_source() {
        let graph = graph();
        let mut ctx = ExecutionContext::new();
        ctx.insert("a".into(), json!("A"));
        ctx.insert("b".into(), json!("B"));
        ctx.insert("z".into(), json!("Z"));

        let inputs = collect_edge_inputs(&graph, "u", &ctx);
        let order: Vec<(&str, &str)> = inputs
            .iter()
            .map(|i| (i.handle.as_str(), i.source_id.as_str()))
            .collect();
        assert_eq!(order, vec![("extra", "z"), ("input", "a"), ("input", "b")]);
    }

    #[test]
    fn test_sources_without_value_contribute_nothing() {
        let graph = graph();
        let mut ctx = ExecutionContext::new();
        ctx.insert("z".into(), json!(1));

        let inputs = collect_edge_inputs(&graph, "u", &ctx);
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].source_id, "z");
    }

    #[test]
    fn test_primary_prefers_input_handle_then_single_value() {
        let graph = graph();
        let overrides = serde_json::Map::new();
        let node = graph.node("u").unwrap();

        let mut ctx = ExecutionContext::new();
        ctx.insert("z".into(), json!("only"));
        let inputs = NodeInputs::collect(&graph, node, &ctx, &overrides);
        assert_eq!(inputs.primary(), Some(&json!("only")));

        ctx.insert("a".into(), json!("first"));
        ctx.insert("b".into(), json!("second"));
        let inputs = NodeInputs::collect(&graph, node, &ctx, &overrides);
        assert_eq!(inputs.primary(), Some(&json!("first")));
    }

    #[test]
    fn test_parse_config_reports_node() {
        #[derive(serde::Deserialize, Debug)]
        #[allow(dead_code)]
        struct Strict {
            count: u32,
        }

        let node = NodeInstance::new("n1", crate::types::NodeKind::Transform, json!({"count": "x"}));
        let err = parse_config::<Strict>(&node).unwrap_err();
        assert!(matches!(err, EngineError::NodeExecution { ref node_id, .. } if node_id == "n1"));
    }
}
