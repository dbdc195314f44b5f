//! Chunk repository implementation.

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use docket_core::{Chunk, ChunkRepository, Error, Result};

use crate::{to_i32, to_i64, to_usize, PgStore};

#[async_trait]
impl ChunkRepository for PgStore {
    async fn replace_chunks(&self, document_id: Uuid, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool().begin().await.map_err(Error::Database)?;

        // Mentions reference chunks, so a new chunk set invalidates them too.
        sqlx::query("DELETE FROM entity_mentions WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query("DELETE FROM chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, start_offset, end_offset, text)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(chunk.id)
            .bind(document_id)
            .bind(to_i32(chunk.chunk_index))
            .bind(to_i64(chunk.start_offset))
            .bind(to_i64(chunk.end_offset))
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn list_chunks(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, start_offset, end_offset, text
             FROM chunks WHERE document_id = $1 ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(self.pool())
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| Chunk {
                id: row.get("id"),
                document_id: row.get("document_id"),
                chunk_index: row.get::<i32, _>("chunk_index").max(0) as usize,
                start_offset: to_usize(row.get("start_offset")),
                end_offset: to_usize(row.get("end_offset")),
                text: row.get("text"),
            })
            .collect())
    }
}
