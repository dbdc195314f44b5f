//! Relationship repository implementation.

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use docket_core::{Error, Relationship, RelationshipRepository, Result};

use crate::{to_i32, PgStore};

#[async_trait]
impl RelationshipRepository for PgStore {
    async fn replace_relationships(
        &self,
        document_id: Uuid,
        relationships: &[Relationship],
    ) -> Result<()> {
        let mut tx = self.pool().begin().await.map_err(Error::Database)?;

        sqlx::query("DELETE FROM relationships WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        for (position, rel) in relationships.iter().enumerate() {
            sqlx::query(
                "INSERT INTO relationships
                    (id, document_id, position, source_entity_id, target_entity_id, relationship_type, weight)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(rel.id)
            .bind(document_id)
            .bind(to_i32(position))
            .bind(rel.source_entity_id)
            .bind(rel.target_entity_id)
            .bind(rel.relationship_type.as_str())
            .bind(rel.weight as i32)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn list_relationships(&self, document_id: Uuid) -> Result<Vec<Relationship>> {
        let rows = sqlx::query(
            "SELECT id, document_id, source_entity_id, target_entity_id, relationship_type, weight
             FROM relationships WHERE document_id = $1 ORDER BY position",
        )
        .bind(document_id)
        .fetch_all(self.pool())
        .await
        .map_err(Error::Database)?;

        rows.into_iter()
            .map(|row| {
                let kind: String = row.get("relationship_type");
                Ok(Relationship {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    source_entity_id: row.get("source_entity_id"),
                    target_entity_id: row.get("target_entity_id"),
                    relationship_type: kind.parse()?,
                    weight: row.get::<i32, _>("weight").max(0) as u32,
                })
            })
            .collect()
    }
}
