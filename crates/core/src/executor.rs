use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cost;
use crate::error::EngineError;
use crate::graph::{NodeInstance, WorkflowGraph};
use crate::ledger::{CreditHold, CreditLedger, CreditReservations, LedgerError};
use crate::model_registry::ModelCatalog;
use crate::model_runner::ModelRunner;
use crate::node::{Evaluation, ExecutionContext, NodeInputs};
use crate::nodes::build_handler;
use crate::nodes::generative::normalize_output;
use crate::schedule::{self, ExecutionPlan};
use crate::types::NodeKind;

pub type OutputMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub input_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub target_node_ids: Option<Vec<String>>,
}

impl ExecutionRequest {
    fn targets(&self) -> Option<&[String]> {
        self.target_node_ids
            .as_deref()
            .filter(|targets| !targets.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub completed_generations: usize,
    pub total_generations: usize,
    pub credits_used: i64,
}

pub type ProgressCallback = Arc<dyn Fn(ExecutionProgress) + Send + Sync>;

/// Terminal result of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub outputs: OutputMap,
    pub credits_used: i64,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
}

impl ExecutionReport {
    /// Turn the report into a cancellation, keeping the credits already spent.
    pub fn mark_cancelled(&mut self) {
        self.status = ExecutionStatus::Cancelled;
        self.outputs.clear();
        self.error_message = Some("execution cancelled".to_string());
    }

    fn cancelled(credits_used: i64, started: Instant) -> Self {
        let mut report = Self {
            status: ExecutionStatus::Cancelled,
            outputs: OutputMap::new(),
            credits_used,
            error_message: None,
            execution_time_ms: elapsed_ms(started),
        };
        report.mark_cancelled();
        report
    }

    fn failed(error: impl std::fmt::Display, credits_used: i64, started: Instant) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            outputs: OutputMap::new(),
            credits_used,
            error_message: Some(error.to_string()),
            execution_time_ms: elapsed_ms(started),
        }
    }
}

/// Result of the pre-flight phase: a validated graph, its (pruned) plan and the cost estimate.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub graph: WorkflowGraph,
    pub plan: ExecutionPlan,
    pub estimated_cost: i64,
}

/// Parse, validate, plan and estimate. Nothing runs and nothing is billed.
pub fn prepare(
    document: &serde_json::Value,
    targets: Option<&[String]>,
    catalog: &dyn ModelCatalog,
) -> Result<PreparedRun, EngineError> {
    let graph = WorkflowGraph::parse(document)?;
    graph.validate()?;
    let plan = schedule::plan(&graph, targets)?;
    let estimated_cost = cost::estimate_plan(&graph, &plan, catalog);

    Ok(PreparedRun {
        graph,
        plan,
        estimated_cost,
    })
}

/// A finished run and the credits still reserved for it.
///
/// The hold keeps other runs of the same user from being admitted against these credits. Drop
/// it only after the report has been settled with the ledger.
pub struct HeldExecution {
    pub report: ExecutionReport,
    pub hold: Option<CreditHold>,
}

struct NodeOutcome {
    value: serde_json::Value,
    billed: i64,
}

/// Drives one workflow run: generations sequentially, members of a generation concurrently.
pub struct WorkflowExecutor {
    runner: Arc<dyn ModelRunner>,
    catalog: Arc<dyn ModelCatalog>,
    ledger: Arc<dyn CreditLedger>,
    reservations: Arc<CreditReservations>,
}

impl WorkflowExecutor {
    pub fn new(
        runner: Arc<dyn ModelRunner>,
        catalog: Arc<dyn ModelCatalog>,
        ledger: Arc<dyn CreditLedger>,
    ) -> Self {
        Self {
            runner,
            catalog,
            ledger,
            reservations: Arc::new(CreditReservations::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn ModelCatalog> {
        &self.catalog
    }

    pub fn reservations(&self) -> &Arc<CreditReservations> {
        &self.reservations
    }

    /// Run `document` for `user_id` to a terminal status, releasing the credit hold on return.
    pub async fn execute(
        &self,
        user_id: &str,
        document: &serde_json::Value,
        request: &ExecutionRequest,
        cancel: CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> ExecutionReport {
        self.execute_held(user_id, document, request, cancel, progress)
            .await
            .report
    }

    /// Run `document` for `user_id` to a terminal status.
    ///
    /// Pre-flight failures (parse, validation, planning, insufficient balance) return `failed`
    /// with zero credits and no hold. Admitted runs reserve their estimate until the returned
    /// hold is dropped. The executor never deducts or refunds; `credits_used` is reported for
    /// the caller to settle.
    pub async fn execute_held(
        &self,
        user_id: &str,
        document: &serde_json::Value,
        request: &ExecutionRequest,
        cancel: CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> HeldExecution {
        let started = Instant::now();
        let rejected = |report: ExecutionReport| HeldExecution { report, hold: None };

        let prepared = match prepare(document, request.targets(), self.catalog.as_ref()) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(error = %err, "Workflow rejected before execution");
                return rejected(ExecutionReport::failed(err, 0, started));
            }
        };

        let hold = match self.reservations.reserve(
            self.ledger.as_ref(),
            user_id,
            prepared.estimated_cost,
        ) {
            Ok(hold) => hold,
            Err(LedgerError::InsufficientCredits {
                required,
                available,
            }) => {
                let err = EngineError::InsufficientCredits {
                    required,
                    available,
                };
                info!(user_id, required, available, "Insufficient credits");
                return rejected(ExecutionReport::failed(err, 0, started));
            }
            Err(err) => {
                warn!(user_id, error = %err, "Failed to read credit balance");
                return rejected(ExecutionReport::failed(err, 0, started));
            }
        };

        info!(
            user_id,
            generations = prepared.plan.len(),
            estimated_cost = prepared.estimated_cost,
            "Workflow execution started"
        );

        let report = self.run_plan(prepared, request, cancel, progress, started).await;
        HeldExecution {
            report,
            hold: Some(hold),
        }
    }

    async fn run_plan(
        &self,
        prepared: PreparedRun,
        request: &ExecutionRequest,
        cancel: CancellationToken,
        progress: Option<ProgressCallback>,
        started: Instant,
    ) -> ExecutionReport {
        let PreparedRun { graph, plan, .. } = prepared;
        let graph = Arc::new(graph);
        let overrides = Arc::new(request.input_data.clone());
        let total_generations = plan.len();

        // Tasks share the context by reference count; it is only mutated once they have joined.
        let mut context = Arc::new(ExecutionContext::new());
        let mut credits_used = 0i64;

        for (generation_idx, generation) in plan.generations.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(generation = generation_idx, credits_used, "Workflow execution cancelled");
                return ExecutionReport::cancelled(credits_used, started);
            }

            debug!(generation = generation_idx, nodes = ?generation, "Running generation");
            let results = self
                .run_generation(&graph, generation, &context, &overrides)
                .await;

            let values = Arc::make_mut(&mut context);
            let mut first_error: Option<EngineError> = None;
            for (node_id, result) in generation.iter().zip(results) {
                match result {
                    Ok(outcome) => {
                        credits_used += outcome.billed;
                        values.insert(node_id.clone(), outcome.value);
                    }
                    Err(err) => {
                        warn!(node_id = %node_id, error = %err, "Node failed");
                        first_error.get_or_insert(err);
                    }
                }
            }

            if let Some(err) = first_error {
                info!(generation = generation_idx, credits_used, "Workflow execution failed");
                return ExecutionReport::failed(err, credits_used, started);
            }

            if let Some(callback) = &progress {
                callback(ExecutionProgress {
                    completed_generations: generation_idx + 1,
                    total_generations,
                    credits_used,
                });
            }
        }

        if cancel.is_cancelled() {
            info!(credits_used, "Workflow execution cancelled after its last generation");
            return ExecutionReport::cancelled(credits_used, started);
        }

        let outputs = collect_outputs(&graph, &plan, &context, request.targets());
        let execution_time_ms = elapsed_ms(started);
        info!(credits_used, execution_time_ms, outputs = outputs.len(), "Workflow execution completed");

        ExecutionReport {
            status: ExecutionStatus::Completed,
            outputs,
            credits_used,
            error_message: None,
            execution_time_ms,
        }
    }

    /// Spawn every member into a task group and wait for all of them. Results come back in
    /// generation order.
    async fn run_generation(
        &self,
        graph: &Arc<WorkflowGraph>,
        generation: &[String],
        snapshot: &Arc<ExecutionContext>,
        overrides: &Arc<serde_json::Map<String, serde_json::Value>>,
    ) -> Vec<Result<NodeOutcome, EngineError>> {
        let mut results: Vec<Option<Result<NodeOutcome, EngineError>>> =
            generation.iter().map(|_| None).collect();
        let mut tasks = JoinSet::new();
        let mut task_slots = HashMap::new();

        for (slot, node_id) in generation.iter().enumerate() {
            let Some(node) = graph.node(node_id).cloned() else {
                results[slot] = Some(Err(EngineError::node(node_id, "node missing from graph")));
                continue;
            };
            let cost = cost::node_cost(&node, self.catalog.as_ref());
            let graph = Arc::clone(graph);
            let snapshot = Arc::clone(snapshot);
            let overrides = Arc::clone(overrides);
            let runner = Arc::clone(&self.runner);

            let handle = tasks.spawn(async move {
                execute_node(&graph, &node, &snapshot, &overrides, runner, cost).await
            });
            task_slots.insert(handle.id(), slot);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((task_id, result)) => {
                    if let Some(&slot) = task_slots.get(&task_id) {
                        results[slot] = Some(result);
                    }
                }
                Err(join_err) => {
                    if let Some(&slot) = task_slots.get(&join_err.id()) {
                        results[slot] = Some(Err(EngineError::node(
                            &generation[slot],
                            format!("node task aborted: {join_err}"),
                        )));
                    }
                }
            }
        }

        results
            .into_iter()
            .zip(generation)
            .map(|(result, node_id)| {
                result.unwrap_or_else(|| Err(EngineError::node(node_id, "node task produced no result")))
            })
            .collect()
    }
}

/// Execute one node against a read-only snapshot. Model calls run on the blocking pool.
async fn execute_node(
    graph: &WorkflowGraph,
    node: &NodeInstance,
    snapshot: &ExecutionContext,
    overrides: &serde_json::Map<String, serde_json::Value>,
    runner: Arc<dyn ModelRunner>,
    cost: i64,
) -> Result<NodeOutcome, EngineError> {
    let handler = build_handler(node)?;
    let evaluation = {
        let inputs = NodeInputs::collect(graph, node, snapshot, overrides);
        handler.evaluate(&inputs)?
    };

    match evaluation {
        Evaluation::Value(value) => Ok(NodeOutcome { value, billed: 0 }),
        Evaluation::Invoke { model_id, params } => {
            info!(node_id = %node.id, model_id = %model_id, "Invoking model");
            let call_model_id = model_id.clone();
            let output = tokio::task::spawn_blocking(move || runner.run(&call_model_id, &params))
                .await
                .map_err(|e| EngineError::node(&node.id, format!("model call aborted: {e}")))?
                .map_err(|e| EngineError::node(&node.id, format!("{e:#}")))?;

            debug!(node_id = %node.id, model_id = %model_id, cost, "Model call finished");
            Ok(NodeOutcome {
                value: normalize_output(output),
                billed: cost,
            })
        }
    }
}

/// Output nodes under their declared names, plus each requested target's raw value under its id.
fn collect_outputs(
    graph: &WorkflowGraph,
    plan: &ExecutionPlan,
    context: &ExecutionContext,
    targets: Option<&[String]>,
) -> OutputMap {
    let mut outputs = OutputMap::new();

    for node in graph.nodes() {
        if node.kind != NodeKind::Output || !plan.contains(&node.id) {
            continue;
        }
        if let Some(value) = context.get(&node.id) {
            outputs.insert(node.declared_name().to_string(), value.clone());
        }
    }

    for target in targets.unwrap_or_default() {
        if let Some(value) = context.get(target) {
            outputs.insert(target.clone(), value.clone());
        }
    }

    outputs
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
