//! Input and media input nodes: values supplied by the caller or stored on the node.

use serde::Deserialize;

use crate::error::EngineError;
use crate::graph::NodeInstance;
use crate::node::{parse_config, Evaluation, NodeHandler, NodeInputs};
use crate::types::NodeKind;

#[derive(Debug, Default, Deserialize)]
struct InputConfig {
    value: Option<serde_json::Value>,
    default_value: Option<serde_json::Value>,
    url: Option<serde_json::Value>,
}

pub struct InputNode {
    declared_name: String,
    media: bool,
    config: InputConfig,
}

impl InputNode {
    pub fn from_node(node: &NodeInstance) -> Result<Self, EngineError> {
        Ok(Self {
            declared_name: node.declared_name().to_string(),
            media: node.kind == NodeKind::MediaInput,
            config: parse_config(node)?,
        })
    }

    /// Resolution order: caller override by declared name, `value`, `default_value`, then
    /// `url` for media inputs.
    fn resolve(&self, overrides: &serde_json::Map<String, serde_json::Value>) -> serde_json::Value {
        if let Some(value) = overrides.get(&self.declared_name) {
            return value.clone();
        }

        let media_url = if self.media { self.config.url.as_ref() } else { None };
        self.config
            .value
            .as_ref()
            .or(self.config.default_value.as_ref())
            .or(media_url)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }
}

impl NodeHandler for InputNode {
    fn evaluate(&self, inputs: &NodeInputs<'_>) -> Result<Evaluation, EngineError> {
        Ok(Evaluation::Value(self.resolve(inputs.overrides)))
    }
}
