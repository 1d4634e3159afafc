use std::path::Path as StdPath;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod persistence;

pub use persistence::{ExecutionRecord, ExecutionStore, WorkflowRecord};

use crate::config::{resolve_relative_to, AppConfig};
use crate::error::EngineError;
use crate::executor::{
    ExecutionProgress, ExecutionReport, ExecutionRequest, ExecutionStatus, HeldExecution,
    ProgressCallback, WorkflowExecutor,
};
use crate::graph::WorkflowGraph;
use crate::ledger::{CreditLedger, CreditTransaction, LedgerError, SqliteLedger};
use crate::model_registry::ModelEntry;
use crate::model_runner::ReplicateRunner;

pub const USER_ID_HEADER: &str = "x-user-id";
const DEFAULT_PAGE_LIMIT: usize = 50;
const MAX_PAGE_LIMIT: usize = 200;
const CANCELLED_WHILE_QUEUED: &str = "execution cancelled before it started";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    executor: WorkflowExecutor,
    ledger: Arc<dyn CreditLedger>,
    store: ExecutionStore,
    execution_semaphore: Arc<Semaphore>,
    live: DashMap<String, LiveExecution>,
}

/// In-flight bookkeeping for an execution until its final record is persisted.
///
/// `terminal` is set under the entry lock once the outcome is fixed; cancellation is only
/// accepted before that.
struct LiveExecution {
    cancel_token: CancellationToken,
    progress: Option<ExecutionProgress>,
    terminal: Option<ExecutionStatus>,
}

impl AppState {
    pub fn new(
        executor: WorkflowExecutor,
        ledger: Arc<dyn CreditLedger>,
        store: ExecutionStore,
        max_concurrent_executions: usize,
    ) -> Self {
        if let Err(err) = store.reconcile_interrupted() {
            warn!(
                error = %err,
                db_path = %store.db_path().display(),
                "Failed to reconcile interrupted executions"
            );
        }

        Self {
            inner: Arc::new(AppStateInner {
                executor,
                ledger,
                store,
                execution_semaphore: Arc::new(Semaphore::new(max_concurrent_executions.max(1))),
                live: DashMap::new(),
            }),
        }
    }

    /// Production wiring: Replicate runner, configured catalog, SQLite ledger and store.
    pub fn from_config(config: &AppConfig, data_dir: &StdPath) -> Result<Self> {
        let db_path = resolve_relative_to(data_dir, &config.paths.database);
        let runner = ReplicateRunner::from_config(&config.replicate)
            .context("failed to configure Replicate model runner")?;
        let ledger = SqliteLedger::open(&db_path)
            .with_context(|| format!("failed to open credit ledger: {}", db_path.display()))?;
        let store = ExecutionStore::open(&db_path)?;
        let ledger: Arc<dyn CreditLedger> = Arc::new(ledger);

        let executor = WorkflowExecutor::new(
            Arc::new(runner),
            Arc::new(config.model_catalog()),
            Arc::clone(&ledger),
        );

        info!(db_path = %db_path.display(), "Server state initialized");
        Ok(Self::new(
            executor,
            ledger,
            store,
            config.engine.max_concurrent_executions,
        ))
    }

    fn persist(&self, record: &ExecutionRecord) {
        if let Err(err) = self.inner.store.upsert_execution(record) {
            error!(execution_id = %record.id, error = ?err, "Failed to persist execution snapshot");
        }
    }

    fn progress_callback(&self, execution_id: &str) -> ProgressCallback {
        let inner = Arc::clone(&self.inner);
        let execution_id = execution_id.to_string();
        Arc::new(move |progress: ExecutionProgress| {
            if let Some(mut live) = inner.live.get_mut(&execution_id) {
                live.progress = Some(progress);
            }
            debug!(
                execution_id = %execution_id,
                completed = progress.completed_generations,
                total = progress.total_generations,
                credits_used = progress.credits_used,
                "Execution progress"
            );
        })
    }

    /// Deduct for completed runs, refund for failed or cancelled ones. A deduction that the
    /// ledger refuses turns the run into a failure.
    fn settle(&self, user_id: &str, execution_id: &str, report: &mut ExecutionReport) {
        match report.status {
            ExecutionStatus::Completed if report.credits_used > 0 => {
                let description = format!("Workflow execution {execution_id}");
                match self.inner.ledger.deduct(
                    user_id,
                    report.credits_used,
                    &description,
                    Some(execution_id),
                ) {
                    Ok(tx) => info!(
                        execution_id,
                        user_id,
                        amount = tx.amount,
                        "Credits deducted for execution"
                    ),
                    Err(err) => {
                        warn!(execution_id, user_id, error = %err, "Credit deduction failed");
                        report.status = ExecutionStatus::Failed;
                        report.outputs.clear();
                        report.error_message = Some(err.to_string());
                    }
                }
            }
            ExecutionStatus::Failed | ExecutionStatus::Cancelled if report.credits_used > 0 => {
                match self.inner.ledger.refund(execution_id) {
                    Ok(Some(tx)) => info!(execution_id, amount = tx.amount, "Execution refunded"),
                    Ok(None) => debug!(execution_id, "No deduction to refund"),
                    Err(err) => error!(execution_id, error = %err, "Refund failed"),
                }
            }
            _ => {}
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/models", get(list_models))
        .route("/api/workflows", post(create_workflow))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/workflows/{id}/execute", post(execute_workflow))
        .route("/api/workflows/{id}/executions", get(list_workflow_executions))
        .route(
            "/api/executions/{id}",
            get(get_execution).delete(cancel_execution),
        )
        .route("/api/credits/balance", get(get_balance))
        .route("/api/credits/transactions", get(list_transactions))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Caller identity taken from the `x-user-id` header.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| UserId(value.to_string()))
            .ok_or_else(|| AppError::Unauthorized(format!("missing {USER_ID_HEADER} header")))
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    #[serde(default)]
    pub is_public: bool,
    pub workflow: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl PageQuery {
    fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }

    fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

#[derive(Serialize)]
pub struct BalanceResponse {
    pub user_id: String,
    pub balance: i64,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelEntry>> {
    Json(state.inner.executor.catalog().list())
}

async fn create_workflow(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<(StatusCode, Json<WorkflowRecord>), AppError> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("workflow name must not be empty".to_string()));
    }

    let graph = WorkflowGraph::parse(&payload.workflow)?;
    graph.validate()?;

    let record = WorkflowRecord {
        id: Uuid::new_v4().to_string(),
        user_id,
        name: name.to_string(),
        is_public: payload.is_public,
        workflow: graph.to_document(),
        created_at: Utc::now(),
    };
    state.inner.store.insert_workflow(&record)?;

    info!(workflow_id = %record.id, user_id = %record.user_id, nodes = graph.node_count(), "Workflow saved");
    Ok((StatusCode::CREATED, Json(record)))
}

fn load_workflow(state: &AppState, id: &str, user_id: &str) -> Result<WorkflowRecord, AppError> {
    let workflow = state
        .inner
        .store
        .get_workflow(id)?
        .ok_or_else(|| AppError::NotFound(format!("workflow not found: {id}")))?;

    if workflow.user_id != user_id && !workflow.is_public {
        return Err(AppError::Forbidden(format!("no access to workflow {id}")));
    }
    Ok(workflow)
}

async fn get_workflow(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<Json<WorkflowRecord>, AppError> {
    load_workflow(&state, &id, &user_id).map(Json)
}

/// Runs the workflow to a terminal status before responding.
async fn execute_workflow(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
    Json(request): Json<ExecutionRequest>,
) -> Result<(StatusCode, Json<ExecutionRecord>), AppError> {
    let workflow = load_workflow(&state, &id, &user_id)?;

    let mut record = ExecutionRecord::pending(
        Uuid::new_v4().to_string(),
        workflow.id.clone(),
        user_id.clone(),
        request.input_data.clone(),
        request.target_node_ids.clone(),
    );
    state.inner.store.upsert_execution(&record)?;

    let cancel_token = CancellationToken::new();
    state.inner.live.insert(
        record.id.clone(),
        LiveExecution {
            cancel_token: cancel_token.clone(),
            progress: None,
            terminal: None,
        },
    );

    let permit = tokio::select! {
        permit = Arc::clone(&state.inner.execution_semaphore).acquire_owned() => permit.ok(),
        _ = cancel_token.cancelled() => None,
    };
    let Some(_permit) = permit else {
        if let Some(mut live) = state.inner.live.get_mut(&record.id) {
            live.terminal = Some(ExecutionStatus::Cancelled);
        }
        record.finish(ExecutionReport {
            status: ExecutionStatus::Cancelled,
            outputs: Default::default(),
            credits_used: 0,
            error_message: Some(CANCELLED_WHILE_QUEUED.to_string()),
            execution_time_ms: 0,
        });
        state.persist(&record);
        state.inner.live.remove(&record.id);
        info!(execution_id = %record.id, "Execution cancelled while queued");
        return Ok((StatusCode::CREATED, Json(record)));
    };

    record.mark_running();
    state.persist(&record);
    info!(execution_id = %record.id, workflow_id = %workflow.id, user_id = %user_id, "Execution started");

    let HeldExecution { mut report, hold } = state
        .inner
        .executor
        .execute_held(
            &user_id,
            &workflow.workflow,
            &request,
            cancel_token,
            Some(state.progress_callback(&record.id)),
        )
        .await;

    // A cancel accepted after the executor returned still wins over its result.
    if let Some(mut live) = state.inner.live.get_mut(&record.id) {
        if live.cancel_token.is_cancelled() && report.status != ExecutionStatus::Cancelled {
            report.mark_cancelled();
        }
        live.terminal = Some(report.status);
    }
    state.settle(&user_id, &record.id, &mut report);
    drop(hold);

    if let Some((_, live)) = state.inner.live.remove(&record.id) {
        record.progress = live.progress;
    }
    record.finish(report);
    state.persist(&record);

    info!(
        execution_id = %record.id,
        status = %record.status,
        credits_used = record.credits_used,
        "Execution finished"
    );
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_workflow_executions(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<ExecutionRecord>>, AppError> {
    let mut records =
        state
            .inner
            .store
            .list_executions(&id, &user_id, page.limit(), page.offset())?;
    for record in &mut records {
        overlay_live_progress(&state, record);
    }
    Ok(Json(records))
}

fn load_owned_execution(
    state: &AppState,
    id: &str,
    user_id: &str,
) -> Result<ExecutionRecord, AppError> {
    let record = state
        .inner
        .store
        .get_execution(id)?
        .ok_or_else(|| AppError::NotFound(format!("execution not found: {id}")))?;

    if record.user_id != user_id {
        return Err(AppError::Forbidden(format!("no access to execution {id}")));
    }
    Ok(record)
}

fn overlay_live_progress(state: &AppState, record: &mut ExecutionRecord) {
    if let Some(live) = state.inner.live.get(&record.id) {
        if live.progress.is_some() {
            record.progress = live.progress;
        }
    }
}

async fn get_execution(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRecord>, AppError> {
    let mut record = load_owned_execution(&state, &id, &user_id)?;
    overlay_live_progress(&state, &mut record);
    Ok(Json(record))
}

async fn cancel_execution(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let record = load_owned_execution(&state, &id, &user_id)?;

    let live = state.inner.live.get(&id);
    let status = match live {
        Some(live) => match live.terminal {
            None => {
                live.cancel_token.cancel();
                info!(execution_id = %id, status = %record.status, "Execution cancellation requested");
                return Ok(StatusCode::NO_CONTENT);
            }
            Some(terminal) => terminal,
        },
        None => record.status,
    };
    Err(AppError::BadRequest(format!(
        "execution {id} is {status} and cannot be cancelled"
    )))
}

async fn get_balance(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<BalanceResponse>, AppError> {
    let balance = state.inner.ledger.balance(&user_id)?;
    Ok(Json(BalanceResponse { user_id, balance }))
}

async fn list_transactions(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<CreditTransaction>>, AppError> {
    let transactions = state
        .inner
        .ledger
        .transactions(&user_id, page.limit(), page.offset())?;
    Ok(Json(transactions))
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError::Internal(err.to_string())
    }
}
