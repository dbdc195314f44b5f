//! Batch repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use docket_core::{
    BatchJob, BatchProgress, BatchRepository, BatchStatus, Error, NewBatch, Result,
};

use crate::PgStore;

fn parse_batch_row(row: &sqlx::postgres::PgRow) -> Result<BatchJob> {
    let priority: String = row.get("priority");
    let status: String = row.get("status");
    let count = |col: &str| row.get::<i64, _>(col).max(0) as u64;
    Ok(BatchJob {
        id: row.get("id"),
        name: row.get("name"),
        priority: priority.parse()?,
        status: status.parse()?,
        progress: BatchProgress {
            total: count("total"),
            completed: count("completed"),
            failed: count("failed"),
            in_flight: count("in_flight"),
        },
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const BATCH_COLUMNS: &str =
    "id, name, priority, status, total, completed, failed, in_flight, created_at, updated_at";

#[async_trait]
impl BatchRepository for PgStore {
    async fn create_batch(&self, batch: &NewBatch) -> Result<BatchJob> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO batches (id, name, priority, status, created_at, updated_at)
             VALUES ($1, $2, $3, 'running', $4, $4)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(batch.id)
        .bind(&batch.name)
        .bind(batch.priority.as_str())
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(Error::Database)?;

        self.get_batch(batch.id)
            .await?
            .ok_or(Error::BatchNotFound(batch.id))
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<BatchJob>> {
        let row = sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(parse_batch_row).transpose()
    }

    async fn batch_progress(&self, id: Uuid) -> Result<BatchProgress> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                    COUNT(*) FILTER (WHERE status = 'failed') AS failed
             FROM documents WHERE batch_id = $1",
        )
        .bind(id)
        .fetch_one(self.pool())
        .await
        .map_err(Error::Database)?;

        let total = row.get::<i64, _>("total").max(0) as u64;
        let completed = row.get::<i64, _>("completed").max(0) as u64;
        let failed = row.get::<i64, _>("failed").max(0) as u64;
        Ok(BatchProgress {
            total,
            completed,
            failed,
            in_flight: total.saturating_sub(completed + failed),
        })
    }

    async fn update_batch(
        &self,
        id: Uuid,
        progress: BatchProgress,
        status: BatchStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE batches
             SET total = $1, completed = $2, failed = $3, in_flight = $4, status = $5, updated_at = $6
             WHERE id = $7",
        )
        .bind(progress.total as i64)
        .bind(progress.completed as i64)
        .bind(progress.failed as i64)
        .bind(progress.in_flight as i64)
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::BatchNotFound(id));
        }
        Ok(())
    }
}
