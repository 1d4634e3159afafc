use crate::graph::{NodeInstance, WorkflowGraph};
use crate::model_registry::ModelCatalog;
use crate::schedule::ExecutionPlan;

/// Credits billed for one successful run of `node`.
///
/// Non-generative nodes are free. A generative node without `model_id` is free here and fails
/// at run time; a model missing from the catalog costs the catalog default.
pub fn node_cost(node: &NodeInstance, catalog: &dyn ModelCatalog) -> i64 {
    if !node.kind.is_generative() {
        return 0;
    }
    let Some(model_id) = node.model_id() else {
        return 0;
    };

    match catalog.cost_per_run(model_id) {
        Some(cost) if cost.is_finite() => cost.max(0.0).trunc() as i64,
        _ => catalog.default_cost(),
    }
}

/// Sum of [`node_cost`] over the given node ids. Ids not in the graph contribute nothing.
pub fn estimate<'a>(
    graph: &WorkflowGraph,
    node_ids: impl IntoIterator<Item = &'a str>,
    catalog: &dyn ModelCatalog,
) -> i64 {
    node_ids
        .into_iter()
        .filter_map(|id| graph.node(id))
        .map(|node| node_cost(node, catalog))
        .sum()
}

pub fn estimate_plan(graph: &WorkflowGraph, plan: &ExecutionPlan, catalog: &dyn ModelCatalog) -> i64 {
    estimate(graph, plan.node_ids(), catalog)
}
