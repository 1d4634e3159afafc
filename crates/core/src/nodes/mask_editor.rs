//! Mask editor node: emits the mask drawn in the editor.

use serde::Deserialize;

use crate::error::EngineError;
use crate::graph::NodeInstance;
use crate::node::{parse_config, Evaluation, NodeHandler, NodeInputs};

#[derive(Debug, Default, Deserialize)]
struct MaskEditorConfig {
    mask_output: Option<serde_json::Value>,
    mask: Option<serde_json::Value>,
}

pub struct MaskEditorNode {
    node_id: String,
    mask: Option<serde_json::Value>,
}

impl MaskEditorNode {
    pub fn from_node(node: &NodeInstance) -> Result<Self, EngineError> {
        let config: MaskEditorConfig = parse_config(node)?;
        Ok(Self {
            node_id: node.id.clone(),
            mask: config.mask_output.or(config.mask),
        })
    }
}

impl NodeHandler for MaskEditorNode {
    fn evaluate(&self, _inputs: &NodeInputs<'_>) -> Result<Evaluation, EngineError> {
        self.mask
            .clone()
            .map(Evaluation::Value)
            .ok_or_else(|| EngineError::node(&self.node_id, "no mask has been drawn"))
    }
}
