//! Output node: forwards its input so the coordinator can collect it under the declared name.

use crate::error::EngineError;
use crate::graph::NodeInstance;
use crate::node::{Evaluation, NodeHandler, NodeInputs};

pub struct OutputNode {
    declared_name: String,
}

impl OutputNode {
    pub fn from_node(node: &NodeInstance) -> Self {
        Self {
            declared_name: node.declared_name().to_string(),
        }
    }

    pub fn declared_name(&self) -> &str {
        &self.declared_name
    }
}

impl NodeHandler for OutputNode {
    fn evaluate(&self, inputs: &NodeInputs<'_>) -> Result<Evaluation, EngineError> {
        Ok(Evaluation::Value(
            inputs.primary().cloned().unwrap_or(serde_json::Value::Null),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{EdgeInput, ExecutionContext};
    use crate::types::NodeKind;
    use serde_json::json;

    #[test]
    fn test_forwards_input_handle_and_uses_declared_name() {
        let node = NodeInstance::new("out", NodeKind::Output, json!({"name": "thumbnail"}));
        let ctx = ExecutionContext::new();
        let overrides = serde_json::Map::new();
        let inputs = NodeInputs {
            node: &node,
            edge_inputs: vec![
                EdgeInput {
                    handle: "caption".to_string(),
                    source_id: "c".to_string(),
                    value: json!("ignored"),
                },
                EdgeInput {
                    handle: "input".to_string(),
                    source_id: "g".to_string(),
                    value: json!("https://x/thumb.png"),
                },
            ],
            context: &ctx,
            overrides: &overrides,
        };

        let handler = OutputNode::from_node(&node);
        assert_eq!(handler.declared_name(), "thumbnail");
        assert_eq!(
            handler.evaluate(&inputs).unwrap(),
            Evaluation::Value(json!("https://x/thumb.png"))
        );
    }

    #[test]
    fn test_unconnected_output_is_null() {
        let node = NodeInstance::new("out", NodeKind::Output, json!({}));
        let ctx = ExecutionContext::new();
        let overrides = serde_json::Map::new();
        let inputs = NodeInputs {
            node: &node,
            edge_inputs: Vec::new(),
            context: &ctx,
            overrides: &overrides,
        };
        assert_eq!(
            OutputNode::from_node(&node).evaluate(&inputs).unwrap(),
            Evaluation::Value(serde_json::Value::Null)
        );
    }
}
