//! Document repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use docket_core::{
    Document, DocumentRepository, DocumentStatus, Error, NewDocument, Result, SourceLocation,
    Stage,
};

use crate::PgStore;

const DOCUMENT_COLUMNS: &str = "id, batch_id, bucket, object_key, size_bytes, status, stage, \
     extracted_text_ref, created_at, updated_at";

/// Reference written to `documents.extracted_text_ref` once text is stored.
pub fn text_ref(document_id: Uuid) -> String {
    format!("document_texts/{document_id}")
}

pub(crate) fn parse_document_row(row: &sqlx::postgres::PgRow) -> Result<Document> {
    let status: String = row.get("status");
    let stage: Option<String> = row.get("stage");
    let size: Option<i64> = row.get("size_bytes");
    Ok(Document {
        id: row.get("id"),
        batch_id: row.get("batch_id"),
        location: SourceLocation::new(
            row.get::<String, _>("bucket"),
            row.get::<String, _>("object_key"),
        ),
        size_bytes: size.map(|s| s.max(0) as u64),
        status: status.parse()?,
        stage: stage.map(|s| s.parse::<Stage>()).transpose()?,
        extracted_text_ref: row.get("extracted_text_ref"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl DocumentRepository for PgStore {
    async fn insert_document(&self, doc: &NewDocument) -> Result<bool> {
        let now = Utc::now();
        // Racing writers for the same id: the loser's insert is a no-op.
        let result = sqlx::query(
            "INSERT INTO documents (id, batch_id, bucket, object_key, size_bytes, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'pending', $6, $6)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(doc.id)
        .bind(doc.batch_id)
        .bind(&doc.location.bucket)
        .bind(&doc.location.key)
        .bind(doc.size_bytes.map(|s| s as i64))
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(parse_document_row).transpose()
    }

    async fn update_document(&self, id: Uuid, status: DocumentStatus, stage: Stage) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = $1, stage = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(status.as_str())
        .bind(stage.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(id));
        }
        Ok(())
    }

    async fn save_extracted_text(&self, id: Uuid, text: &str) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await.map_err(Error::Database)?;

        sqlx::query(
            "INSERT INTO document_texts (document_id, text, updated_at) VALUES ($1, $2, $3)
             ON CONFLICT (document_id) DO UPDATE SET text = EXCLUDED.text, updated_at = EXCLUDED.updated_at",
        )
        .bind(id)
        .bind(text)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query("UPDATE documents SET extracted_text_ref = $1, updated_at = $2 WHERE id = $3")
            .bind(text_ref(id))
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn load_extracted_text(&self, id: Uuid) -> Result<Option<String>> {
        let text: Option<String> =
            sqlx::query_scalar("SELECT text FROM document_texts WHERE document_id = $1")
                .bind(id)
                .fetch_optional(self.pool())
                .await
                .map_err(Error::Database)?;
        Ok(text)
    }

    async fn list_batch_documents(&self, batch_id: Uuid) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE batch_id = $1 ORDER BY created_at, id"
        ))
        .bind(batch_id)
        .fetch_all(self.pool())
        .await
        .map_err(Error::Database)?;

        rows.iter().map(parse_document_row).collect()
    }
}
