use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::EngineError;
use crate::types::NodeKind;

pub const DEFAULT_SOURCE_HANDLE: &str = "output";
pub const DEFAULT_TARGET_HANDLE: &str = "input";

pub type NodeData = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct NodeInstance {
    pub id: String,
    pub kind: NodeKind,
    pub data: NodeData,
}

impl NodeInstance {
    pub fn new(id: impl Into<String>, kind: NodeKind, data: serde_json::Value) -> Self {
        let data = match data {
            serde_json::Value::Object(map) => map,
            _ => NodeData::new(),
        };
        Self {
            id: id.into(),
            kind,
            data,
        }
    }

    /// Name used for caller overrides (inputs) and collected outputs: `data.name`, else the id.
    pub fn declared_name(&self) -> &str {
        self.data
            .get("name")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.id)
    }

    pub fn model_id(&self) -> Option<&str> {
        self.data
            .get("model_id")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|model_id| !model_id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(rename = "sourceHandle")]
    pub source_handle: String,
    #[serde(rename = "targetHandle")]
    pub target_handle: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: DEFAULT_SOURCE_HANDLE.to_string(),
            target_handle: DEFAULT_TARGET_HANDLE.to_string(),
        }
    }

    pub fn with_target_handle(mut self, handle: impl Into<String>) -> Self {
        self.target_handle = handle.into();
        self
    }
}

/// A parsed workflow: nodes in document order plus the directed edges between them.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: StableDiGraph<NodeInstance, Edge>,
    node_ids: HashMap<String, NodeIndex>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            node_ids: HashMap::new(),
        }
    }

    pub fn add_node(&mut self, instance: NodeInstance) -> Result<NodeIndex, EngineError> {
        if self.node_ids.contains_key(&instance.id) {
            return Err(EngineError::MalformedGraph(format!(
                "duplicate node id: {}",
                instance.id
            )));
        }

        let node_id = instance.id.clone();
        let index = self.graph.add_node(instance);
        self.node_ids.insert(node_id, index);
        Ok(index)
    }

    pub fn add_edge(&mut self, edge: Edge) -> Result<(), EngineError> {
        let from_idx = self.index_of(&edge.source).ok_or_else(|| {
            EngineError::MalformedGraph(format!("edge references unknown source node: {}", edge.source))
        })?;
        let to_idx = self.index_of(&edge.target).ok_or_else(|| {
            EngineError::MalformedGraph(format!("edge references unknown target node: {}", edge.target))
        })?;

        self.graph.add_edge(from_idx, to_idx, edge);
        Ok(())
    }

    /// Parse a workflow document (`{"nodes": [...], "edges": [...]}`).
    ///
    /// Also accepts the document wrapped as `{"workflow": {...}}` or encoded as a JSON string,
    /// which is how the relational store keeps it.
    pub fn parse(document: &serde_json::Value) -> Result<Self, EngineError> {
        match document {
            serde_json::Value::String(encoded) => Self::parse_str(encoded),
            serde_json::Value::Object(map) if !map.contains_key("nodes") => match map.get("workflow") {
                Some(inner) => Self::parse(inner),
                None => Self::from_document(document),
            },
            serde_json::Value::Object(_) => Self::from_document(document),
            _ => Err(EngineError::MalformedGraph(
                "workflow document must be a JSON object".to_string(),
            )),
        }
    }

    pub fn parse_str(encoded: &str) -> Result<Self, EngineError> {
        let document: serde_json::Value = serde_json::from_str(encoded)
            .map_err(|e| EngineError::MalformedGraph(format!("invalid JSON: {e}")))?;
        Self::parse(&document)
    }

    fn from_document(document: &serde_json::Value) -> Result<Self, EngineError> {
        let raw: RawDocument = serde_json::from_value(document.clone())
            .map_err(|e| EngineError::MalformedGraph(e.to_string()))?;

        let mut graph = Self::new();

        for (position, node) in raw.nodes.into_iter().enumerate() {
            let id = node.id.ok_or_else(|| {
                EngineError::MalformedGraph(format!("node at position {position} is missing 'id'"))
            })?;
            let type_name = node.node_type.ok_or_else(|| {
                EngineError::MalformedGraph(format!("node '{id}' is missing 'type'"))
            })?;
            let kind = NodeKind::from_tag(&type_name).ok_or_else(|| EngineError::UnknownNodeType {
                node_id: id.clone(),
                type_name: type_name.clone(),
            })?;
            let data = match node.data {
                None | Some(serde_json::Value::Null) => NodeData::new(),
                Some(serde_json::Value::Object(map)) => map,
                Some(_) => {
                    return Err(EngineError::MalformedGraph(format!(
                        "node '{id}' has non-object 'data'"
                    )))
                }
            };

            graph.add_node(NodeInstance { id, kind, data })?;
        }

        for (position, edge) in raw.edges.into_iter().enumerate() {
            let source = edge.source.ok_or_else(|| {
                EngineError::MalformedGraph(format!("edge at position {position} is missing 'source'"))
            })?;
            let target = edge.target.ok_or_else(|| {
                EngineError::MalformedGraph(format!("edge at position {position} is missing 'target'"))
            })?;

            graph.add_edge(Edge {
                source,
                target,
                source_handle: edge
                    .source_handle
                    .unwrap_or_else(|| DEFAULT_SOURCE_HANDLE.to_string()),
                target_handle: edge
                    .target_handle
                    .unwrap_or_else(|| DEFAULT_TARGET_HANDLE.to_string()),
            })?;
        }

        Ok(graph)
    }

    /// Check acyclicity, connectivity and shape, in that order.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.execution_order()?;

        for idx in self.graph.node_indices() {
            let node = self.node_at(idx);
            if node.kind.is_endpoint() {
                continue;
            }

            let connected = self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .next()
                .is_some()
                || self
                    .graph
                    .edges_directed(idx, Direction::Outgoing)
                    .next()
                    .is_some();
            if !connected {
                return Err(EngineError::OrphanedNode {
                    node_id: node.id.clone(),
                });
            }
        }

        let has_sink = self
            .nodes()
            .any(|node| node.kind == NodeKind::Output || node.kind.is_generative());
        if !has_sink {
            return Err(EngineError::EmptyWorkflow);
        }

        Ok(())
    }

    pub fn execution_order(&self) -> Result<Vec<NodeIndex>, EngineError> {
        toposort(&self.graph, None).map_err(|_| EngineError::CyclicGraph)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Nodes in document order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInstance> + '_ {
        self.graph.node_indices().map(|idx| self.node_at(idx))
    }

    /// Edges in document order.
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<_> = self.graph.edge_references().collect();
        edges.sort_by_key(|edge| edge.id());
        edges.into_iter().map(|edge| edge.weight().clone()).collect()
    }

    pub fn node(&self, id: &str) -> Option<&NodeInstance> {
        self.index_of(id).map(|idx| self.node_at(idx))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node_ids.contains_key(id)
    }

    pub(crate) fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.node_ids.get(id).copied()
    }

    pub(crate) fn node_at(&self, idx: NodeIndex) -> &NodeInstance {
        &self.graph[idx]
    }

    pub(crate) fn inner(&self) -> &StableDiGraph<NodeInstance, Edge> {
        &self.graph
    }

    pub fn connections_to(&self, id: &str) -> Vec<&Edge> {
        let Some(idx) = self.index_of(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .map(|edge| edge.weight())
            .collect()
    }

    /// Serialize back into the document shape accepted by [`WorkflowGraph::parse`].
    pub fn to_document(&self) -> serde_json::Value {
        let nodes: Vec<_> = self
            .nodes()
            .map(|node| {
                serde_json::json!({
                    "id": node.id,
                    "type": node.kind.tag(),
                    "data": node.data,
                })
            })
            .collect();

        serde_json::json!({
            "nodes": nodes,
            "edges": self.edges(),
        })
    }
}

impl Default for WorkflowGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    edges: Vec<RawEdge>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    id: Option<String>,
    #[serde(rename = "type")]
    node_type: Option<String>,
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawEdge {
    source: Option<String>,
    target: Option<String>,
    #[serde(rename = "sourceHandle")]
    source_handle: Option<String>,
    #[serde(rename = "targetHandle")]
    target_handle: Option<String>,
}

impl Serialize for WorkflowGraph {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_document().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WorkflowGraph {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let document = serde_json::Value::deserialize(deserializer)?;
        WorkflowGraph::parse(&document).map_err(D::Error::custom)
    }
}
