//! Per-document circuit breaker counters, shared by every worker.

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use docket_core::{BreakerRecord, BreakerRepository, Error, Result};

use crate::PgStore;

#[async_trait]
impl BreakerRepository for PgStore {
    async fn load_breaker(&self, document_id: Uuid) -> Result<Option<BreakerRecord>> {
        let row = sqlx::query(
            "SELECT document_id, consecutive_failures, opened_at, open_until, updated_at
             FROM document_breakers WHERE document_id = $1",
        )
        .bind(document_id)
        .fetch_optional(self.pool())
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|row| BreakerRecord {
            document_id: row.get("document_id"),
            consecutive_failures: row.get::<i32, _>("consecutive_failures").max(0) as u32,
            opened_at: row.get("opened_at"),
            open_until: row.get("open_until"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn save_breaker(&self, record: &BreakerRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO document_breakers (document_id, consecutive_failures, opened_at, open_until, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (document_id) DO UPDATE SET
                consecutive_failures = EXCLUDED.consecutive_failures,
                opened_at = EXCLUDED.opened_at,
                open_until = EXCLUDED.open_until,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(record.document_id)
        .bind(record.consecutive_failures as i32)
        .bind(record.opened_at)
        .bind(record.open_until)
        .bind(record.updated_at)
        .execute(self.pool())
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn delete_breaker(&self, document_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM document_breakers WHERE document_id = $1")
            .bind(document_id)
            .execute(self.pool())
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}
