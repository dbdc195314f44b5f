//! PostgreSQL stage queue.
//!
//! Each tier is a partition of `stage_queue`. A claim flips one visible row to
//! `leased` with `FOR UPDATE SKIP LOCKED`, so concurrent workers never take the
//! same message. A leased row whose lease expires without an ack becomes
//! claimable again, which is how a crashed worker's message is re-delivered;
//! a live worker keeps its lease with `renew`. A partial unique index allows
//! one live message per document and stage, so enqueueing is idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use docket_core::{
    defaults, new_v7, Error, Priority, QueuedTask, Result, StageMessage, TaskQueue,
};

/// Queue row status.
const QUEUED: &str = "queued";
const LEASED: &str = "leased";
const DEAD: &str = "dead";

/// PostgreSQL implementation of [`TaskQueue`].
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: Pool<Postgres>,
    /// Notify handle for event-driven worker wake.
    notify: Arc<Notify>,
    lease: Duration,
}

impl PgTaskQueue {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self::with_notify(pool, Arc::new(Notify::new()))
    }

    /// Create a queue sharing an existing notify handle.
    pub fn with_notify(pool: Pool<Postgres>, notify: Arc<Notify>) -> Self {
        Self {
            pool,
            notify,
            lease: Duration::from_secs(defaults::QUEUE_LEASE_SECS),
        }
    }

    /// Override the lease after which an unacked message is re-delivered.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn parse_task_row(row: sqlx::postgres::PgRow) -> Result<QueuedTask> {
        let stage: String = row.get("stage");
        let tier: String = row.get("tier");
        Ok(QueuedTask {
            id: row.get("id"),
            message: StageMessage {
                document_id: row.get("document_id"),
                batch_id: row.get("batch_id"),
                stage: stage.parse()?,
                tier: tier.parse()?,
                attempt: row.get::<i32, _>("attempt").max(0) as u32,
            },
            deliveries: row.get::<i32, _>("deliveries").max(0) as u32,
            claimed_at: row.get("claimed_at"),
        })
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, message: &StageMessage) -> Result<Uuid> {
        let id = new_v7();
        let now = Utc::now();

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO stage_queue (id, document_id, batch_id, stage, tier, attempt, status, visible_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
             ON CONFLICT (document_id, stage) WHERE status IN ('queued', 'leased') DO NOTHING
             RETURNING id",
        )
        .bind(id)
        .bind(message.document_id)
        .bind(message.batch_id)
        .bind(message.stage.as_str())
        .bind(message.tier.as_str())
        .bind(message.attempt as i32)
        .bind(QUEUED)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let Some((id,)) = inserted else {
            let existing: Option<(Uuid,)> = sqlx::query_as(
                "SELECT id FROM stage_queue
                 WHERE document_id = $1 AND stage = $2 AND status IN ($3, $4)",
            )
            .bind(message.document_id)
            .bind(message.stage.as_str())
            .bind(QUEUED)
            .bind(LEASED)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
            debug!(
                subsystem = "queue",
                component = "pg",
                document_id = %message.document_id,
                stage = %message.stage,
                "Stage already queued, enqueue skipped"
            );
            // Acked between the two statements: nothing live remains, try again.
            return match existing {
                Some((existing,)) => Ok(existing),
                None => self.enqueue(message).await,
            };
        };

        debug!(
            subsystem = "queue",
            component = "pg",
            task_id = %id,
            document_id = %message.document_id,
            stage = %message.stage,
            tier = %message.tier,
            "Enqueued stage task"
        );
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn claim(&self, tier: Priority) -> Result<Option<QueuedTask>> {
        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(self.lease)
                .map_err(|e| Error::Config(format!("invalid queue lease: {e}")))?;

        // Filter before locking; expired leases are claimable like fresh rows.
        let row = sqlx::query(
            "UPDATE stage_queue
             SET status = $1, deliveries = deliveries + 1, claimed_at = $2, leased_until = $3
             WHERE id = (
                 SELECT id FROM stage_queue
                 WHERE tier = $4
                   AND ((status = $5 AND visible_at <= $2) OR (status = $1 AND leased_until < $2))
                 ORDER BY visible_at ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, document_id, batch_id, stage, tier, attempt, deliveries, claimed_at",
        )
        .bind(LEASED)
        .bind(now)
        .bind(lease_until)
        .bind(tier.as_str())
        .bind(QUEUED)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_task_row).transpose()
    }

    async fn ack(&self, task_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM stage_queue WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn retry(&self, task_id: Uuid, delay: Duration, error: &str) -> Result<()> {
        let visible_at = Utc::now()
            + chrono::Duration::from_std(delay)
                .map_err(|e| Error::Config(format!("invalid retry delay: {e}")))?;

        sqlx::query(
            "UPDATE stage_queue
             SET status = $1, visible_at = $2, leased_until = NULL, last_error = $3
             WHERE id = $4",
        )
        .bind(QUEUED)
        .bind(visible_at)
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn renew(&self, task_id: Uuid) -> Result<bool> {
        let lease_until = Utc::now()
            + chrono::Duration::from_std(self.lease)
                .map_err(|e| Error::Config(format!("invalid queue lease: {e}")))?;
        let result = sqlx::query(
            "UPDATE stage_queue SET leased_until = $1 WHERE id = $2 AND status = $3",
        )
        .bind(lease_until)
        .bind(task_id)
        .bind(LEASED)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn dead_letter(&self, task_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE stage_queue SET status = $1, leased_until = NULL, last_error = $2 WHERE id = $3",
        )
        .bind(DEAD)
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        warn!(
            subsystem = "queue",
            component = "pg",
            task_id = %task_id,
            error = error,
            "Stage task dead-lettered"
        );
        Ok(())
    }

    async fn depth(&self, tier: Priority) -> Result<u64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM stage_queue WHERE tier = $1 AND status IN ($2, $3)",
        )
        .bind(tier.as_str())
        .bind(QUEUED)
        .bind(LEASED)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(count.0.max(0) as u64)
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
