use std::fmt;

use serde::{Deserialize, Serialize};

/// Key used by the wire form of a typed node reference: `{"$ref": "<node_id>"}`.
pub const REFERENCE_KEY: &str = "$ref";

/// Generative node flavours. All of them invoke a billable model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerativeKind {
    Replicate,
    Inpaint,
    RemoveBg,
    LlmModel,
}

/// Closed set of node kinds a workflow may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Input,
    MediaInput,
    Utility,
    Generative(GenerativeKind),
    MaskEditor,
    Transform,
    Output,
}

impl NodeKind {
    /// Lift a document type tag into a node kind.
    ///
    /// `concat` is the editor's legacy tag for a concat utility node.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let kind = match tag {
            "input" => Self::Input,
            "media_input" => Self::MediaInput,
            "utility" | "concat" => Self::Utility,
            "replicate" => Self::Generative(GenerativeKind::Replicate),
            "inpaint" => Self::Generative(GenerativeKind::Inpaint),
            "remove_bg" => Self::Generative(GenerativeKind::RemoveBg),
            "llm_model" => Self::Generative(GenerativeKind::LlmModel),
            "mask_editor" => Self::MaskEditor,
            "transform" => Self::Transform,
            "output" => Self::Output,
            _ => return None,
        };
        Some(kind)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::MediaInput => "media_input",
            Self::Utility => "utility",
            Self::Generative(GenerativeKind::Replicate) => "replicate",
            Self::Generative(GenerativeKind::Inpaint) => "inpaint",
            Self::Generative(GenerativeKind::RemoveBg) => "remove_bg",
            Self::Generative(GenerativeKind::LlmModel) => "llm_model",
            Self::MaskEditor => "mask_editor",
            Self::Transform => "transform",
            Self::Output => "output",
        }
    }

    pub fn is_generative(&self) -> bool {
        matches!(self, Self::Generative(_))
    }

    /// Input and output endpoints may legitimately be left unconnected.
    pub fn is_endpoint(&self) -> bool {
        matches!(self, Self::Input | Self::Output)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A static node parameter: either a literal JSON value or a reference to another node's output.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Literal(serde_json::Value),
    Reference(String),
}

impl ParamValue {
    /// Only an object with a single string-valued `$ref` key is a reference. Strings that
    /// happen to start with `$` stay literals.
    pub fn from_json(value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = &value {
            if map.len() == 1 {
                if let Some(serde_json::Value::String(node_id)) = map.get(REFERENCE_KEY) {
                    return Self::Reference(node_id.clone());
                }
            }
        }
        Self::Literal(value)
    }

    pub fn reference(node_id: impl Into<String>) -> serde_json::Value {
        serde_json::json!({ REFERENCE_KEY: node_id.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind_tags_roundtrip() {
        for tag in [
            "input",
            "media_input",
            "utility",
            "replicate",
            "inpaint",
            "remove_bg",
            "llm_model",
            "mask_editor",
            "transform",
            "output",
        ] {
            let kind = NodeKind::from_tag(tag).expect("known tag");
            assert_eq!(kind.tag(), tag);
        }
        assert_eq!(NodeKind::from_tag("concat"), Some(NodeKind::Utility));
        assert_eq!(NodeKind::from_tag("ideation_source"), None);
    }

    #[test]
    fn test_generative_and_endpoint_classification() {
        assert!(NodeKind::Generative(GenerativeKind::RemoveBg).is_generative());
        assert!(!NodeKind::Transform.is_generative());
        assert!(NodeKind::Input.is_endpoint());
        assert!(NodeKind::Output.is_endpoint());
        assert!(!NodeKind::MediaInput.is_endpoint());
    }

    #[test]
    fn test_param_value_reference_requires_exact_wire_form() {
        assert_eq!(
            ParamValue::from_json(serde_json::json!({"$ref": "input_1"})),
            ParamValue::Reference("input_1".to_string())
        );
        assert_eq!(
            ParamValue::from_json(serde_json::json!("$input_1")),
            ParamValue::Literal(serde_json::json!("$input_1"))
        );
        assert_eq!(
            ParamValue::from_json(serde_json::json!({"$ref": "a", "extra": 1})),
            ParamValue::Literal(serde_json::json!({"$ref": "a", "extra": 1}))
        );
        assert_eq!(
            ParamValue::from_json(serde_json::json!({"$ref": 3})),
            ParamValue::Literal(serde_json::json!({"$ref": 3}))
        );
    }
}
