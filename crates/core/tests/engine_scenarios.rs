use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use clipflow_core::cost;
use clipflow_core::error::EngineError;
use clipflow_core::executor::{prepare, ExecutionReport, ExecutionRequest, ExecutionStatus, WorkflowExecutor};
use clipflow_core::graph::WorkflowGraph;
use clipflow_core::ledger::{CreditLedger, MemoryLedger, TransactionType};
use clipflow_core::model_registry::{ModelCategory, ModelEntry, StaticModelCatalog};
use clipflow_core::model_runner::{ModelInputs, ModelRunner};
use clipflow_core::schedule;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<String>>,
}

impl RecordingRunner {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ModelRunner for RecordingRunner {
    fn run(&self, model_id: &str, _inputs: &ModelInputs) -> anyhow::Result<Value> {
        self.calls.lock().unwrap().push(model_id.to_string());
        if model_id == "m/broken" {
            bail!("prediction failed: NSFW content detected");
        }
        Ok(json!([format!("https://cdn/{}.png", model_id.replace('/', "_"))]))
    }
}

fn catalog() -> StaticModelCatalog {
    let model = |id: &str, cost: f64| ModelEntry {
        model_id: id.to_string(),
        name: id.to_string(),
        category: ModelCategory::ImageGeneration,
        cost_per_run: cost,
        description: String::new(),
    };
    StaticModelCatalog::new(
        vec![model("m/two", 2.0), model("m/three", 3.0), model("m/broken", 4.0)],
        10,
    )
}

struct Engine {
    executor: WorkflowExecutor,
    runner: Arc<RecordingRunner>,
}

fn engine(balance: i64) -> Engine {
    let runner = Arc::new(RecordingRunner::default());
    let ledger = Arc::new(MemoryLedger::new());
    if balance > 0 {
        ledger
            .grant("creator", balance, TransactionType::Purchase, "credit pack")
            .unwrap();
    }
    Engine {
        executor: WorkflowExecutor::new(runner.clone(), Arc::new(catalog()), ledger),
        runner,
    }
}

async fn execute(engine: &Engine, document: &Value, request: ExecutionRequest) -> ExecutionReport {
    engine
        .executor
        .execute("creator", document, &request, CancellationToken::new(), None)
        .await
}

fn targets(ids: &[&str]) -> ExecutionRequest {
    ExecutionRequest {
        target_node_ids: Some(ids.iter().map(|id| id.to_string()).collect()),
        ..Default::default()
    }
}

fn two_generators() -> Value {
    json!({
        "nodes": [
            {"id": "G1", "type": "replicate", "data": {"model_id": "m/two"}},
            {"id": "G2", "type": "replicate", "data": {"model_id": "m/three"}},
            {"id": "O", "type": "output", "data": {"name": "Thumbnail"}}
        ],
        "edges": [
            {"source": "G1", "target": "O", "targetHandle": "first"},
            {"source": "G2", "target": "O", "targetHandle": "second"}
        ]
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn text_pipeline_without_models_costs_nothing() {
    let engine = engine(0);
    let document = json!({
        "nodes": [
            {"id": "A", "type": "input", "data": {"name": "Greeting", "value": "hello"}},
            {"id": "B", "type": "utility", "data": {"op_type": "concat", "separator": " "}},
            {"id": "C", "type": "output", "data": {"name": "Result"}}
        ],
        "edges": [
            {"source": "A", "target": "B"},
            {"source": "B", "target": "C"}
        ]
    });

    let report = execute(&engine, &document, ExecutionRequest::default()).await;

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(Value::Object(report.outputs), json!({"Result": "hello"}));
    assert_eq!(report.credits_used, 0);
    assert!(report.error_message.is_none());
    assert!(engine.runner.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn insufficient_balance_fails_before_any_model_call() {
    let engine = engine(4);
    let report = execute(&engine, &two_generators(), ExecutionRequest::default()).await;

    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(report.credits_used, 0);
    assert_eq!(
        report.error_message.as_deref(),
        Some("insufficient credits: required 5, available 4")
    );
    assert!(report.outputs.is_empty());
    assert!(engine.runner.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn targeted_run_only_pays_for_ancestors() {
    let document = two_generators();
    let prepared = prepare(&document, Some(&["G1".to_string()]), &catalog()).unwrap();
    assert_eq!(prepared.plan.generations, vec![vec!["G1".to_string()]]);
    assert_eq!(prepared.estimated_cost, 2);

    let engine = engine(4);
    let report = execute(&engine, &document, targets(&["G1"])).await;

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.credits_used, 2);
    assert_eq!(
        Value::Object(report.outputs),
        json!({"G1": "https://cdn/m_two.png"})
    );
    assert_eq!(engine.runner.calls(), ["m/two"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_middle_node_stops_the_chain() {
    let engine = engine(100);
    let document = json!({
        "nodes": [
            {"id": "A", "type": "replicate", "data": {"model_id": "m/two"}},
            {"id": "B", "type": "replicate", "data": {"model_id": "m/broken"}},
            {"id": "C", "type": "replicate", "data": {"model_id": "m/three"}}
        ],
        "edges": [
            {"source": "A", "target": "B", "targetHandle": "image"},
            {"source": "B", "target": "C", "targetHandle": "image"}
        ]
    });

    let report = execute(&engine, &document, ExecutionRequest::default()).await;

    assert_eq!(report.status, ExecutionStatus::Failed);
    assert!(report.outputs.is_empty());
    assert_eq!(report.credits_used, 2);
    let message = report.error_message.unwrap();
    assert!(message.contains("node 'B' failed"), "{message}");
    assert!(message.contains("NSFW"), "{message}");
    assert_eq!(engine.runner.calls(), ["m/two", "m/broken"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn cycle_is_rejected_before_planning() {
    let document = json!({
        "nodes": [
            {"id": "a", "type": "transform"},
            {"id": "b", "type": "transform"},
            {"id": "out", "type": "output"}
        ],
        "edges": [
            {"source": "a", "target": "b"},
            {"source": "b", "target": "a"},
            {"source": "b", "target": "out"}
        ]
    });
    assert_eq!(
        prepare(&document, None, &catalog()).unwrap_err(),
        EngineError::CyclicGraph
    );

    let engine = engine(10);
    let report = execute(&engine, &document, ExecutionRequest::default()).await;
    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(report.error_message.as_deref(), Some("workflow contains cycles"));
    assert_eq!(report.credits_used, 0);
}

/// Deterministic pseudo-random source so the generated graphs are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

/// Random DAG over `n0..n{size}`: roots are inputs, every other node concatenates its
/// parents, and a single output hangs off the last node.
fn random_text_dag(rng: &mut Lcg, size: usize) -> Value {
    let mut edges = Vec::new();
    let mut has_parent = vec![false; size];
    for target in 1..size {
        for source in 0..target {
            if rng.next() % 3 == 0 {
                edges.push(json!({"source": format!("n{source}"), "target": format!("n{target}")}));
                has_parent[target] = true;
            }
        }
    }

    let mut nodes: Vec<Value> = (0..size)
        .map(|idx| {
            if has_parent[idx] {
                json!({"id": format!("n{idx}"), "type": "utility", "data": {"separator": "+"}})
            } else {
                json!({"id": format!("n{idx}"), "type": "input", "data": {"value": format!("v{idx}")}})
            }
        })
        .collect();
    nodes.push(json!({"id": "out", "type": "output", "data": {"name": "Result"}}));
    edges.push(json!({"source": format!("n{}", size - 1), "target": "out"}));

    json!({"nodes": nodes, "edges": edges})
}

#[test]
fn generations_respect_every_edge() {
    let mut rng = Lcg(7);
    for size in 1..14 {
        let document = random_text_dag(&mut rng, size);
        let graph = WorkflowGraph::parse(&document).unwrap();
        graph.validate().unwrap();
        let generations = schedule::generations(&graph).unwrap();

        let level: HashMap<&str, usize> = generations
            .iter()
            .enumerate()
            .flat_map(|(idx, generation)| generation.iter().map(move |id| (id.as_str(), idx)))
            .collect();
        assert_eq!(level.len(), graph.node_count(), "every node placed exactly once");

        for edge in graph.edges() {
            assert!(
                level[edge.source.as_str()] < level[edge.target.as_str()],
                "edge {} -> {} crosses generations backwards",
                edge.source,
                edge.target
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn pruned_run_matches_full_run_for_each_target() {
    let mut rng = Lcg(42);
    for size in [3, 5, 8] {
        let document = random_text_dag(&mut rng, size);
        let graph = WorkflowGraph::parse(&document).unwrap();
        let all_ids: Vec<&str> = graph.nodes().map(|node| node.id.as_str()).collect();

        let engine = engine(0);
        let full = execute(&engine, &document, targets(&all_ids)).await;
        assert_eq!(full.status, ExecutionStatus::Completed);

        for target in &all_ids {
            let pruned = execute(&engine, &document, targets(&[*target])).await;
            assert_eq!(pruned.status, ExecutionStatus::Completed);
            assert_eq!(
                pruned.outputs.get(*target),
                full.outputs.get(*target),
                "value of {target} differs when pruned"
            );

            let closure = schedule::ancestor_closure(&graph, &[target.to_string()]).unwrap();
            let plan = schedule::plan(&graph, Some(&[target.to_string()])).unwrap();
            let mut planned: Vec<&str> = plan.node_ids().collect();
            let mut expected: Vec<&str> = closure.iter().map(String::as_str).collect();
            planned.sort_unstable();
            expected.sort_unstable();
            assert_eq!(planned, expected);
        }
    }
}

#[test]
fn subset_estimate_is_exact_sum() {
    let document = json!({
        "nodes": [
            {"id": "prompt", "type": "input", "data": {"value": "a cat"}},
            {"id": "g2", "type": "replicate", "data": {"model_id": "m/two"}},
            {"id": "g3", "type": "inpaint", "data": {"model_id": "m/three"}},
            {"id": "unknown", "type": "remove_bg", "data": {"model_id": "someone/else"}},
            {"id": "unset", "type": "llm_model", "data": {}},
            {"id": "out", "type": "output"}
        ],
        "edges": [
            {"source": "prompt", "target": "g2"},
            {"source": "g2", "target": "g3"},
            {"source": "g3", "target": "unknown"},
            {"source": "unknown", "target": "unset"},
            {"source": "unset", "target": "out"}
        ]
    });
    let graph = WorkflowGraph::parse(&document).unwrap();
    let catalog = catalog();
    let costs: HashMap<&str, i64> =
        HashMap::from([("prompt", 0), ("g2", 2), ("g3", 3), ("unknown", 10), ("unset", 0), ("out", 0)]);
    let ids: Vec<&str> = costs.keys().copied().collect();

    for mask in 0u32..(1 << ids.len()) {
        let subset: Vec<&str> = ids
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) != 0)
            .map(|(_, id)| *id)
            .collect();
        let expected: i64 = subset.iter().map(|id| costs[id]).sum();
        assert_eq!(cost::estimate(&graph, subset.iter().copied(), &catalog), expected);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_bills_only_completed_predecessors() {
    for broken_at in 0..4 {
        let nodes: Vec<Value> = (0..4)
            .map(|idx| {
                let model = if idx == broken_at { "m/broken" } else { "m/two" };
                json!({"id": format!("g{idx}"), "type": "replicate", "data": {"model_id": model}})
            })
            .collect();
        let edges: Vec<Value> = (1..4)
            .map(|idx| json!({"source": format!("g{}", idx - 1), "target": format!("g{idx}")}))
            .collect();
        let document = json!({"nodes": nodes, "edges": edges});

        let engine = engine(100);
        let report = execute(&engine, &document, ExecutionRequest::default()).await;

        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.credits_used, 2 * broken_at as i64);
        assert_eq!(engine.runner.calls().len(), broken_at + 1);
        assert!(report
            .error_message
            .unwrap()
            .contains(&format!("node 'g{broken_at}' failed")));
    }
}
