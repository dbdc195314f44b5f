//! Processing task (audit trail) repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use serde_json::Value as JsonValue;

use docket_core::{
    new_v7, Error, ProcessingTask, Result, Stage, TaskOutcome, TaskRepository, TaskStatus,
};

use crate::PgStore;

const TASK_COLUMNS: &str =
    "id, document_id, stage, status, started_at, completed_at, error, retry_count, output";

fn parse_task_row(row: &sqlx::postgres::PgRow) -> Result<ProcessingTask> {
    let stage: String = row.get("stage");
    let status: String = row.get("status");
    let output: Option<JsonValue> = row.get("output");
    Ok(ProcessingTask {
        id: row.get("id"),
        document_id: row.get("document_id"),
        stage: stage.parse()?,
        status: status.parse()?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error: row.get("error"),
        retry_count: row.get::<i32, _>("retry_count").max(0) as u32,
        output: output.map(serde_json::from_value).transpose()?,
    })
}

#[async_trait]
impl TaskRepository for PgStore {
    async fn start_task(&self, document_id: Uuid, stage: Stage) -> Result<ProcessingTask> {
        let task = ProcessingTask {
            id: new_v7(),
            document_id,
            stage,
            status: TaskStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            retry_count: 0,
            output: None,
        };

        sqlx::query(
            "INSERT INTO processing_tasks (id, document_id, stage, status, started_at, retry_count)
             VALUES ($1, $2, $3, $4, $5, 0)",
        )
        .bind(task.id)
        .bind(document_id)
        .bind(stage.as_str())
        .bind(task.status.as_str())
        .bind(task.started_at)
        .execute(self.pool())
        .await
        .map_err(Error::Database)?;

        Ok(task)
    }

    async fn finish_task(&self, task_id: Uuid, outcome: &TaskOutcome) -> Result<()> {
        let output = outcome
            .output
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(
            "UPDATE processing_tasks
             SET status = $1, completed_at = $2, error = $3, retry_count = $4, output = $5
             WHERE id = $6",
        )
        .bind(outcome.status.as_str())
        .bind(Utc::now())
        .bind(outcome.error.as_deref())
        .bind(outcome.retry_count as i32)
        .bind(output)
        .bind(task_id)
        .execute(self.pool())
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn list_tasks(&self, document_id: Uuid) -> Result<Vec<ProcessingTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM processing_tasks WHERE document_id = $1 ORDER BY started_at, id"
        ))
        .bind(document_id)
        .fetch_all(self.pool())
        .await
        .map_err(Error::Database)?;

        rows.iter().map(parse_task_row).collect()
    }

    async fn latest_failure(&self, document_id: Uuid) -> Result<Option<ProcessingTask>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM processing_tasks
             WHERE document_id = $1 AND status IN ('failed', 'rejected')
             ORDER BY started_at DESC, id DESC LIMIT 1"
        ))
        .bind(document_id)
        .fetch_optional(self.pool())
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(parse_task_row).transpose()
    }
}
