use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::executor::{ExecutionProgress, ExecutionReport, ExecutionStatus, OutputMap};
use crate::ledger::timestamp;

/// A stored workflow definition. `workflow` is the graph document as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub is_public: bool,
    pub workflow: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One execution of a workflow, from `pending` to a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub input_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_ids: Option<Vec<String>>,
    pub outputs: OutputMap,
    pub credits_used: i64,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ExecutionProgress>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn pending(
        id: String,
        workflow_id: String,
        user_id: String,
        input_data: serde_json::Map<String, serde_json::Value>,
        target_node_ids: Option<Vec<String>>,
    ) -> Self {
        Self {
            id,
            workflow_id,
            user_id,
            status: ExecutionStatus::Pending,
            input_data,
            target_node_ids,
            outputs: OutputMap::new(),
            credits_used: 0,
            error_message: None,
            execution_time_ms: None,
            progress: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, report: ExecutionReport) {
        self.status = report.status;
        self.outputs = report.outputs;
        self.credits_used = report.credits_used;
        self.error_message = report.error_message;
        self.execution_time_ms = Some(report.execution_time_ms);
        self.completed_at = Some(Utc::now());
    }
}

/// SQLite storage for workflows and execution records.
#[derive(Debug, Clone)]
pub struct ExecutionStore {
    db_path: PathBuf,
}

impl ExecutionStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory: {}", parent.display())
            })?;
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn insert_workflow(&self, record: &WorkflowRecord) -> Result<()> {
        let workflow_json =
            serde_json::to_string(&record.workflow).context("failed to serialize workflow")?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO workflows (id, user_id, name, is_public, workflow_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.user_id,
                    record.name,
                    record.is_public,
                    workflow_json,
                    timestamp(&record.created_at),
                ],
            )
            .with_context(|| format!("failed to insert workflow {}", record.id))?;
            Ok(())
        })
    }

    pub fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, user_id, name, is_public, workflow_json, created_at
                 FROM workflows WHERE id = ?1",
                params![id],
                |row| {
                    Ok(WorkflowRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        name: row.get(2)?,
                        is_public: row.get(3)?,
                        workflow: json_column(row, 4)?,
                        created_at: timestamp_column(row, 5)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load workflow {id}"))
        })
    }

    pub fn upsert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let input_json = serde_json::to_string(&record.input_data)
            .context("failed to serialize execution input")?;
        let target_ids_json = encode_optional_json(record.target_node_ids.as_ref())
            .context("failed to serialize execution targets")?;
        let outputs_json = serde_json::to_string(&record.outputs)
            .context("failed to serialize execution outputs")?;
        let progress_json = encode_optional_json(record.progress.as_ref())
            .context("failed to serialize execution progress")?;
        let execution_time_ms = record
            .execution_time_ms
            .map(|ms| i64::try_from(ms).unwrap_or(i64::MAX));

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO executions (
                    id, workflow_id, user_id, status, input_json, target_ids_json,
                    outputs_json, credits_used, error, execution_time_ms, progress_json,
                    created_at, started_at, completed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    outputs_json = excluded.outputs_json,
                    credits_used = excluded.credits_used,
                    error = excluded.error,
                    execution_time_ms = excluded.execution_time_ms,
                    progress_json = excluded.progress_json,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at",
                params![
                    record.id,
                    record.workflow_id,
                    record.user_id,
                    record.status.as_str(),
                    input_json,
                    target_ids_json,
                    outputs_json,
                    record.credits_used,
                    record.error_message,
                    execution_time_ms,
                    progress_json,
                    timestamp(&record.created_at),
                    record.started_at.as_ref().map(timestamp),
                    record.completed_at.as_ref().map(timestamp),
                ],
            )
            .with_context(|| format!("failed to upsert execution {}", record.id))?;
            Ok(())
        })
    }

    pub fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
                params![id],
                decode_execution,
            )
            .optional()
            .with_context(|| format!("failed to load execution {id}"))
        })
    }

    /// The caller's executions of one workflow, newest first. Undecodable rows are skipped.
    pub fn list_executions(
        &self,
        workflow_id: &str,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions
                 WHERE workflow_id = ?1 AND user_id = ?2
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3 OFFSET ?4"
            ))?;
            let rows = stmt.query_map(
                params![workflow_id, user_id, to_sql_count(limit), to_sql_count(offset)],
                decode_execution,
            )?;

            let mut records = Vec::new();
            for row in rows {
                match row {
                    Ok(record) => records.push(record),
                    Err(err) => warn!(workflow_id, error = %err, "Skipping invalid execution row"),
                }
            }
            Ok(records)
        })
    }

    /// Executions left `pending` or `running` by a previous process cannot resume; mark them
    /// cancelled. Returns how many rows changed.
    pub fn reconcile_interrupted(&self) -> Result<usize> {
        let now = timestamp(&Utc::now());
        let changed = self.with_connection(|conn| {
            let mut changed = 0;
            for previous in [ExecutionStatus::Pending, ExecutionStatus::Running] {
                changed += conn
                    .execute(
                        "UPDATE executions
                         SET status = ?1,
                             error = ?2,
                             completed_at = COALESCE(completed_at, ?3)
                         WHERE status = ?4",
                        params![
                            ExecutionStatus::Cancelled.as_str(),
                            interrupted_error(previous),
                            now,
                            previous.as_str(),
                        ],
                    )
                    .context("failed to reconcile interrupted executions")?;
            }
            Ok(changed)
        })?;

        if changed > 0 {
            info!(executions = changed, "Reconciled interrupted executions to cancelled");
        }
        Ok(changed)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS workflows (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    is_public INTEGER NOT NULL DEFAULT 0,
                    workflow_json TEXT NOT NULL,
                    created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS executions (
                    id TEXT PRIMARY KEY,
                    workflow_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    input_json TEXT NOT NULL,
                    target_ids_json TEXT,
                    outputs_json TEXT NOT NULL,
                    credits_used INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    execution_time_ms INTEGER,
                    progress_json TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                 );
                 CREATE INDEX IF NOT EXISTS idx_executions_workflow
                    ON executions(workflow_id, user_id, created_at DESC);
                 CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);",
            )
            .with_context(|| {
                format!(
                    "failed to initialize execution store schema: {}",
                    self.db_path.display()
                )
            })?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open database: {}", self.db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set database busy timeout")?;
        op(&conn)
    }
}

const EXECUTION_COLUMNS: &str = "id, workflow_id, user_id, status, input_json, target_ids_json,
    outputs_json, credits_used, error, execution_time_ms, progress_json,
    created_at, started_at, completed_at";

fn decode_execution(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let status_raw: String = row.get(3)?;
    let status = ExecutionStatus::parse(&status_raw)
        .ok_or_else(|| conversion_error(3, format!("unknown execution status: {status_raw}")))?;
    let execution_time_ms: Option<i64> = row.get(9)?;

    Ok(ExecutionRecord {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        user_id: row.get(2)?,
        status,
        input_data: json_column(row, 4)?,
        target_node_ids: optional_json_column(row, 5)?,
        outputs: json_column(row, 6)?,
        credits_used: row.get(7)?,
        error_message: row.get(8)?,
        execution_time_ms: execution_time_ms.map(|ms| ms.max(0) as u64),
        progress: optional_json_column(row, 10)?,
        created_at: timestamp_column(row, 11)?,
        started_at: optional_timestamp_column(row, 12)?,
        completed_at: optional_timestamp_column(row, 13)?,
    })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, column: usize) -> rusqlite::Result<T> {
    let encoded: String = row.get(column)?;
    serde_json::from_str(&encoded).map_err(|err| conversion_error(column, err.to_string()))
}

fn optional_json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    column: usize,
) -> rusqlite::Result<Option<T>> {
    let encoded: Option<String> = row.get(column)?;
    encoded
        .map(|raw| serde_json::from_str(&raw).map_err(|err| conversion_error(column, err.to_string())))
        .transpose()
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| conversion_error(column, format!("invalid RFC3339 timestamp {raw}: {err}")))
}

fn timestamp_column(row: &Row<'_>, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(column, &row.get::<_, String>(column)?)
}

fn optional_timestamp_column(row: &Row<'_>, column: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(column)?
        .map(|raw| parse_timestamp(column, &raw))
        .transpose()
}

fn encode_optional_json<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value
        .map(|value| serde_json::to_string(value).map_err(anyhow::Error::from))
        .transpose()
}

fn to_sql_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn interrupted_error(previous: ExecutionStatus) -> String {
    format!(
        "execution was '{previous}' when the server stopped and has been marked 'cancelled' at startup"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ExecutionStore) {
        let dir = tempdir().expect("tempdir");
        let store = ExecutionStore::open(&dir.path().join("clipflow.db")).expect("open store");
        (dir, store)
    }

    fn execution(id: &str, workflow_id: &str, user_id: &str) -> ExecutionRecord {
        let mut input = serde_json::Map::new();
        input.insert("Topic".into(), json!("rust"));
        ExecutionRecord::pending(
            id.into(),
            workflow_id.into(),
            user_id.into(),
            input,
            Some(vec!["g1".into()]),
        )
    }

    #[test]
    fn workflow_round_trip() {
        let (_dir, store) = store();
        let record = WorkflowRecord {
            id: "wf-1".into(),
            user_id: "alice".into(),
            name: "Thumbnail".into(),
            is_public: true,
            workflow: json!({"nodes": [{"id": "o", "type": "output"}], "edges": []}),
            created_at: Utc::now(),
        };
        store.insert_workflow(&record).unwrap();

        let loaded = store.get_workflow("wf-1").unwrap().expect("stored workflow");
        assert_eq!(loaded.name, "Thumbnail");
        assert!(loaded.is_public);
        assert_eq!(loaded.workflow, record.workflow);
        assert!(store.get_workflow("missing").unwrap().is_none());
    }

    #[test]
    fn execution_upsert_updates_terminal_fields() {
        let (_dir, store) = store();
        let mut record = execution("ex-1", "wf-1", "alice");
        store.upsert_execution(&record).unwrap();

        record.mark_running();
        record.progress = Some(ExecutionProgress {
            completed_generations: 1,
            total_generations: 2,
            credits_used: 3,
        });
        store.upsert_execution(&record).unwrap();

        let mut outputs = OutputMap::new();
        outputs.insert("Result".into(), json!("https://cdn/x.png"));
        record.finish(ExecutionReport {
            status: ExecutionStatus::Completed,
            outputs,
            credits_used: 5,
            error_message: None,
            execution_time_ms: 42,
        });
        store.upsert_execution(&record).unwrap();

        let loaded = store.get_execution("ex-1").unwrap().expect("stored execution");
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.credits_used, 5);
        assert_eq!(loaded.execution_time_ms, Some(42));
        assert_eq!(loaded.outputs["Result"], json!("https://cdn/x.png"));
        assert_eq!(loaded.input_data["Topic"], json!("rust"));
        assert_eq!(loaded.target_node_ids, Some(vec!["g1".to_string()]));
        assert_eq!(loaded.progress.map(|p| p.total_generations), Some(2));
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn list_is_scoped_and_newest_first() {
        let (_dir, store) = store();
        for (idx, id) in ["ex-a", "ex-b", "ex-c"].iter().enumerate() {
            let mut record = execution(id, "wf-1", "alice");
            record.created_at = Utc::now() + chrono::Duration::seconds(idx as i64);
            store.upsert_execution(&record).unwrap();
        }
        store.upsert_execution(&execution("ex-bob", "wf-1", "bob")).unwrap();
        store.upsert_execution(&execution("ex-other", "wf-2", "alice")).unwrap();

        let ids: Vec<String> = store
            .list_executions("wf-1", "alice", 10, 0)
            .unwrap()
            .into_iter()
            .map(|record| record.id)
            .collect();
        assert_eq!(ids, ["ex-c", "ex-b", "ex-a"]);

        let page = store.list_executions("wf-1", "alice", 1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "ex-b");
    }

    #[test]
    fn interrupted_executions_are_cancelled_on_startup() {
        let (dir, store) = store();
        let pending = execution("ex-pending", "wf-1", "alice");
        let mut running = execution("ex-running", "wf-1", "alice");
        running.mark_running();
        let mut done = execution("ex-done", "wf-1", "alice");
        done.finish(ExecutionReport {
            status: ExecutionStatus::Completed,
            outputs: OutputMap::new(),
            credits_used: 0,
            error_message: None,
            execution_time_ms: 1,
        });
        for record in [&pending, &running, &done] {
            store.upsert_execution(record).unwrap();
        }

        let reopened = ExecutionStore::open(&dir.path().join("clipflow.db")).unwrap();
        assert_eq!(reopened.reconcile_interrupted().unwrap(), 2);

        let running = reopened.get_execution("ex-running").unwrap().unwrap();
        assert_eq!(running.status, ExecutionStatus::Cancelled);
        assert!(running.error_message.unwrap().contains("'running'"));
        assert!(running.completed_at.is_some());

        let pending = reopened.get_execution("ex-pending").unwrap().unwrap();
        assert!(pending.error_message.unwrap().contains("'pending'"));

        let done = reopened.get_execution("ex-done").unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.error_message.is_none());

        assert_eq!(reopened.reconcile_interrupted().unwrap(), 0);
    }
}
