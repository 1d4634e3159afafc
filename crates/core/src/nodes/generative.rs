//! Generative nodes (`replicate`, `inpaint`, `remove_bg`, `llm_model`): one billable model call.
//!
//! The handler only assembles the model id and parameter map. The executor performs the call
//! on the blocking pool and normalizes the output with [`normalize_output`].

use serde::Deserialize;

use crate::error::EngineError;
use crate::graph::NodeInstance;
use crate::model_runner::ModelInputs;
use crate::node::{parse_config, Evaluation, NodeHandler, NodeInputs};
use crate::types::{GenerativeKind, ParamValue};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenerativeConfig {
    model_id: Option<String>,
    parameters: serde_json::Map<String, serde_json::Value>,
}

pub struct GenerativeNode {
    node_id: String,
    kind: GenerativeKind,
    model_id: Option<String>,
    parameters: Vec<(String, ParamValue)>,
}

impl GenerativeNode {
    pub fn from_node(node: &NodeInstance, kind: GenerativeKind) -> Result<Self, EngineError> {
        let config: GenerativeConfig = parse_config(node)?;
        let parameters = config
            .parameters
            .into_iter()
            .map(|(key, value)| (key, ParamValue::from_json(value)))
            .collect();

        Ok(Self {
            node_id: node.id.clone(),
            kind,
            model_id: config
                .model_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
            parameters,
        })
    }

    pub fn kind(&self) -> GenerativeKind {
        self.kind
    }

    /// Static parameters, then resolved references, then edge inputs by handle.
    fn build_params(&self, inputs: &NodeInputs<'_>) -> Result<ModelInputs, EngineError> {
        let mut params = ModelInputs::new();

        for (key, value) in &self.parameters {
            let resolved = match value {
                ParamValue::Literal(literal) => literal.clone(),
                ParamValue::Reference(source_id) => {
                    inputs.context.get(source_id).cloned().ok_or_else(|| {
                        EngineError::node(
                            &self.node_id,
                            format!("parameter '{key}' references node '{source_id}' which has no value"),
                        )
                    })?
                }
            };
            params.insert(key.clone(), resolved);
        }

        // Edge inputs arrive sorted by (handle, source); repeated handles collect into a list.
        let mut idx = 0;
        while idx < inputs.edge_inputs.len() {
            let handle = &inputs.edge_inputs[idx].handle;
            let group: Vec<serde_json::Value> = inputs.edge_inputs[idx..]
                .iter()
                .take_while(|input| &input.handle == handle)
                .map(|input| input.value.clone())
                .collect();
            idx += group.len();

            let value = match <[serde_json::Value; 1]>::try_from(group) {
                Ok([single]) => single,
                Err(many) => serde_json::Value::Array(many),
            };
            params.insert(handle.clone(), value);
        }

        Ok(params)
    }
}

impl NodeHandler for GenerativeNode {
    fn evaluate(&self, inputs: &NodeInputs<'_>) -> Result<Evaluation, EngineError> {
        let model_id = self
            .model_id
            .clone()
            .ok_or_else(|| EngineError::node(&self.node_id, "model_id is required"))?;

        Ok(Evaluation::Invoke {
            model_id,
            params: self.build_params(inputs)?,
        })
    }
}

/// A one-element list unwraps to its element; a list of strings that are not URLs is joined
/// into one string (streamed text tokens); anything else is returned unchanged.
pub fn normalize_output(output: serde_json::Value) -> serde_json::Value {
    let serde_json::Value::Array(items) = output else {
        return output;
    };

    if items.len() == 1 {
        return items.into_iter().next().unwrap_or(serde_json::Value::Null);
    }

    let all_text = !items.is_empty()
        && items
            .iter()
            .all(|item| item.as_str().is_some_and(|s| !looks_like_url(s)));
    if all_text {
        let joined: String = items.iter().filter_map(serde_json::Value::as_str).collect();
        return serde_json::Value::String(joined);
    }

    serde_json::Value::Array(items)
}

fn looks_like_url(candidate: &str) -> bool {
    url::Url::parse(candidate.trim())
        .map(|url| matches!(url.scheme(), "http" | "https" | "data"))
        .unwrap_or(false)
}
