use thiserror::Error;

/// Errors raised by the workflow engine while parsing, validating, planning or running a graph.
///
/// Everything except [`EngineError::NodeExecution`] is raised before any node runs, so no
/// model call has been made and no credits have been touched when one of them is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("malformed workflow graph: {0}")]
    MalformedGraph(String),

    #[error("workflow contains cycles")]
    CyclicGraph,

    #[error("node {node_id} is not connected")]
    OrphanedNode { node_id: String },

    #[error("workflow must contain at least one output node or one generative node")]
    EmptyWorkflow,

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("node '{node_id}' failed: {cause}")]
    NodeExecution { node_id: String, cause: String },

    #[error("node '{node_id}' has unknown type '{type_name}'")]
    UnknownNodeType { node_id: String, type_name: String },

    #[error("target node '{node_id}' does not exist in the workflow")]
    UnknownTargetNode { node_id: String },
}

impl EngineError {
    pub fn node(node_id: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::NodeExecution {
            node_id: node_id.into(),
            cause: cause.to_string(),
        }
    }

    /// True for errors that are reported before any node executes.
    pub fn is_preflight(&self) -> bool {
        !matches!(self, Self::NodeExecution { .. })
    }
}
