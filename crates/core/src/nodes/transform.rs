//! Transform node: reshapes its input value.

use serde::Deserialize;

use crate::error::EngineError;
use crate::graph::NodeInstance;
use crate::node::{parse_config, Evaluation, NodeHandler, NodeInputs};

#[derive(Debug, Default, Deserialize)]
struct TransformConfig {
    transform_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TransformOp {
    Passthrough,
    SelectFirst,
    Unknown(String),
}

pub struct TransformNode {
    node_id: String,
    op: TransformOp,
}

impl TransformNode {
    pub fn from_node(node: &NodeInstance) -> Result<Self, EngineError> {
        let config: TransformConfig = parse_config(node)?;
        let op = match config.transform_type.as_deref().map(str::trim) {
            None | Some("") => TransformOp::Passthrough,
            Some("select_first") => TransformOp::SelectFirst,
            Some(other) => TransformOp::Unknown(other.to_string()),
        };
        Ok(Self {
            node_id: node.id.clone(),
            op,
        })
    }
}

impl NodeHandler for TransformNode {
    fn evaluate(&self, inputs: &NodeInputs<'_>) -> Result<Evaluation, EngineError> {
        let input = inputs.primary().cloned().unwrap_or(serde_json::Value::Null);

        let value = match &self.op {
            TransformOp::Passthrough => input,
            TransformOp::SelectFirst => match input {
                serde_json::Value::Array(items) if !items.is_empty() => {
                    items.into_iter().next().unwrap_or(serde_json::Value::Null)
                }
                other => other,
            },
            TransformOp::Unknown(name) => {
                return Err(EngineError::node(
                    &self.node_id,
                    format!("unknown transform_type '{name}'"),
                ))
            }
        };
        Ok(Evaluation::Value(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{EdgeInput, ExecutionContext};
    use crate::types::NodeKind;
    use serde_json::{json, Value};

    fn run(data: Value, input: Option<Value>) -> Result<Evaluation, EngineError> {
        let node = NodeInstance::new("t", NodeKind::Transform, data);
        let ctx = ExecutionContext::new();
        let overrides = serde_json::Map::new();
        let edge_inputs = input
            .map(|value| {
                vec![EdgeInput {
                    handle: "input".to_string(),
                    source_id: "src".to_string(),
                    value,
                }]
            })
            .unwrap_or_default();
        let inputs = NodeInputs {
            node: &node,
            edge_inputs,
            context: &ctx,
            overrides: &overrides,
        };
        TransformNode::from_node(&node)?.evaluate(&inputs)
    }

    #[test]
    fn test_select_first() {
        let data = json!({"transform_type": "select_first"});
        assert_eq!(
            run(data.clone(), Some(json!(["a.png", "b.png"]))).unwrap(),
            Evaluation::Value(json!("a.png"))
        );
        assert_eq!(run(data.clone(), Some(json!("solo"))).unwrap(), Evaluation::Value(json!("solo")));
        assert_eq!(run(data.clone(), Some(json!([]))).unwrap(), Evaluation::Value(json!([])));
        assert_eq!(run(data, None).unwrap(), Evaluation::Value(Value::Null));
    }

    #[test]
    fn test_absent_type_passes_through() {
        assert_eq!(
            run(json!({}), Some(json!([1, 2]))).unwrap(),
            Evaluation::Value(json!([1, 2]))
        );
    }

    #[test]
    fn test_unknown_type_fails() {
        assert_eq!(
            run(json!({"transform_type": "crop"}), Some(json!(1))).unwrap_err(),
            EngineError::node("t", "unknown transform_type 'crop'")
        );
    }
}
