//! Handlers for every node kind a workflow may contain.

pub mod generative;
pub mod input;
pub mod mask_editor;
pub mod output;
pub mod transform;
pub mod utility;

use crate::error::EngineError;
use crate::graph::NodeInstance;
use crate::node::NodeHandler;
use crate::types::NodeKind;

use self::generative::GenerativeNode;
use self::input::InputNode;
use self::mask_editor::MaskEditorNode;
use self::output::OutputNode;
use self::transform::TransformNode;
use self::utility::UtilityNode;

/// Build the handler for `node` from its `data`. Config errors surface as node execution errors.
pub fn build_handler(node: &NodeInstance) -> Result<Box<dyn NodeHandler>, EngineError> {
    let handler: Box<dyn NodeHandler> = match node.kind {
        NodeKind::Input | NodeKind::MediaInput => Box::new(InputNode::from_node(node)?),
        NodeKind::Utility => Box::new(UtilityNode::from_node(node)?),
        NodeKind::Generative(kind) => Box::new(GenerativeNode::from_node(node, kind)?),
        NodeKind::MaskEditor => Box::new(MaskEditorNode::from_node(node)?),
        NodeKind::Transform => Box::new(TransformNode::from_node(node)?),
        NodeKind::Output => Box::new(OutputNode::from_node(node)),
    };
    Ok(handler)
}
