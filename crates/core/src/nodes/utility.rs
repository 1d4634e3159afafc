//! Utility node: pure operations over connected inputs. Only `concat` exists today.

use serde::Deserialize;

use crate::error::EngineError;
use crate::graph::NodeInstance;
use crate::node::{parse_config, EdgeInput, Evaluation, NodeHandler, NodeInputs};

const DEFAULT_SEPARATOR: &str = " ";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct UtilityConfig {
    op_type: String,
    separator: String,
}

impl Default for UtilityConfig {
    fn default() -> Self {
        Self {
            op_type: "concat".to_string(),
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum UtilityOp {
    Concat { separator: String },
}

pub struct UtilityNode {
    node_id: String,
    op: Result<UtilityOp, String>,
}

impl UtilityNode {
    pub fn from_node(node: &NodeInstance) -> Result<Self, EngineError> {
        let config: UtilityConfig = parse_config(node)?;
        let op = match config.op_type.as_str() {
            "concat" => Ok(UtilityOp::Concat {
                separator: config.separator,
            }),
            other => Err(other.to_string()),
        };
        Ok(Self {
            node_id: node.id.clone(),
            op,
        })
    }
}

impl NodeHandler for UtilityNode {
    fn evaluate(&self, inputs: &NodeInputs<'_>) -> Result<Evaluation, EngineError> {
        match &self.op {
            Ok(UtilityOp::Concat { separator }) => {
                Ok(Evaluation::Value(concat(&inputs.edge_inputs, separator).into()))
            }
            Err(op_type) => Err(EngineError::node(
                &self.node_id,
                format!("unknown utility op_type '{op_type}'"),
            )),
        }
    }
}

/// Join inputs in slot order. Strings are used raw, other values as JSON text, nulls skipped.
fn concat(inputs: &[EdgeInput], separator: &str) -> String {
    inputs
        .iter()
        .filter_map(|input| match &input.value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .collect::<Vec<_>>()
        .join(separator)
}
