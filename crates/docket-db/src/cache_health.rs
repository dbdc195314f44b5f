//! Shared cache health record and the keys awaiting removal from the cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use docket_core::{CacheHealthRecord, CacheHealthRepository, Error, Result};

use crate::PgStore;

const RECORD_COLUMNS: &str = "scope, generation, disabled_until, trips, updated_at";

fn parse_record(row: sqlx::postgres::PgRow) -> CacheHealthRecord {
    CacheHealthRecord {
        scope: row.get("scope"),
        generation: row.get::<i64, _>("generation").max(0) as u64,
        disabled_until: row.get("disabled_until"),
        trips: row.get::<i64, _>("trips").max(0) as u64,
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl CacheHealthRepository for PgStore {
    async fn load_cache_health(&self, scope: &str) -> Result<Option<CacheHealthRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM cache_health WHERE scope = $1"
        ))
        .bind(scope)
        .fetch_optional(self.pool())
        .await
        .map_err(Error::Database)?;
        Ok(row.map(parse_record))
    }

    async fn trip_cache_health(
        &self,
        scope: &str,
        disabled_until: DateTime<Utc>,
    ) -> Result<CacheHealthRecord> {
        // A concurrent trip with a later deadline wins.
        let row = sqlx::query(&format!(
            "INSERT INTO cache_health (scope, generation, disabled_until, trips, updated_at)
             VALUES ($1, 1, $2, 1, $3)
             ON CONFLICT (scope) DO UPDATE SET
                generation = cache_health.generation + 1,
                disabled_until = GREATEST(COALESCE(cache_health.disabled_until, EXCLUDED.disabled_until), EXCLUDED.disabled_until),
                trips = cache_health.trips + 1,
                updated_at = EXCLUDED.updated_at
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(scope)
        .bind(disabled_until)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await
        .map_err(Error::Database)?;
        Ok(parse_record(row))
    }

    async fn reset_cache_health(&self, scope: &str) -> Result<CacheHealthRecord> {
        let row = sqlx::query(&format!(
            "INSERT INTO cache_health (scope, generation, disabled_until, trips, updated_at)
             VALUES ($1, 1, NULL, 0, $2)
             ON CONFLICT (scope) DO UPDATE SET
                generation = cache_health.generation + 1,
                disabled_until = NULL,
                updated_at = EXCLUDED.updated_at
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(scope)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await
        .map_err(Error::Database)?;
        Ok(parse_record(row))
    }

    async fn mark_cache_keys_stale(&self, scope: &str, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO cache_stale_keys (scope, cache_key, recorded_at)
             SELECT $1, k, $3 FROM UNNEST($2::text[]) AS k
             ON CONFLICT (scope, cache_key) DO UPDATE SET recorded_at = EXCLUDED.recorded_at",
        )
        .bind(scope)
        .bind(keys)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn take_stale_cache_keys(&self, scope: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("DELETE FROM cache_stale_keys WHERE scope = $1 RETURNING cache_key")
            .bind(scope)
            .fetch_all(self.pool())
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(|row| row.get("cache_key")).collect())
    }
}
