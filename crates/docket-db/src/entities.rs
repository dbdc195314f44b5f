//! Entity mention and canonical entity repository implementation.

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use docket_core::{
    CanonicalEntity, EntityMention, EntityRepository, EntityType, Error, MentionAssignment,
    Result,
};

use crate::{to_i32, to_i64, to_usize, PgStore};

fn parse_entity_type(s: &str) -> EntityType {
    EntityType::from_label(s)
}

#[async_trait]
impl EntityRepository for PgStore {
    async fn replace_mentions(&self, document_id: Uuid, mentions: &[EntityMention]) -> Result<()> {
        let mut tx = self.pool().begin().await.map_err(Error::Database)?;

        sqlx::query("DELETE FROM entity_mentions WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        for (position, mention) in mentions.iter().enumerate() {
            sqlx::query(
                "INSERT INTO entity_mentions
                    (id, document_id, chunk_id, position, text, entity_type, start_offset, end_offset, confidence, canonical_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(mention.id)
            .bind(document_id)
            .bind(mention.chunk_id)
            .bind(to_i32(position))
            .bind(&mention.text)
            .bind(mention.entity_type.as_str())
            .bind(to_i64(mention.start_offset))
            .bind(to_i64(mention.end_offset))
            .bind(mention.confidence)
            .bind(mention.canonical_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn list_mentions(&self, document_id: Uuid) -> Result<Vec<EntityMention>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_id, text, entity_type, start_offset, end_offset, confidence, canonical_id
             FROM entity_mentions WHERE document_id = $1 ORDER BY position",
        )
        .bind(document_id)
        .fetch_all(self.pool())
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| EntityMention {
                id: row.get("id"),
                document_id: row.get("document_id"),
                chunk_id: row.get("chunk_id"),
                text: row.get("text"),
                entity_type: parse_entity_type(row.get("entity_type")),
                start_offset: to_usize(row.get("start_offset")),
                end_offset: to_usize(row.get("end_offset")),
                confidence: row.get("confidence"),
                canonical_id: row.get("canonical_id"),
            })
            .collect())
    }

    async fn replace_canonical_entities(
        &self,
        document_id: Uuid,
        entities: &[CanonicalEntity],
        assignments: &[MentionAssignment],
    ) -> Result<()> {
        let mut tx = self.pool().begin().await.map_err(Error::Database)?;

        sqlx::query("UPDATE entity_mentions SET canonical_id = NULL WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query("DELETE FROM canonical_entities WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        for (position, entity) in entities.iter().enumerate() {
            sqlx::query(
                "INSERT INTO canonical_entities (id, document_id, position, name, entity_type, member_count)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(entity.id)
            .bind(document_id)
            .bind(to_i32(position))
            .bind(&entity.name)
            .bind(entity.entity_type.as_str())
            .bind(to_i32(entity.member_count))
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        for assignment in assignments {
            sqlx::query(
                "UPDATE entity_mentions SET canonical_id = $1 WHERE id = $2 AND document_id = $3",
            )
            .bind(assignment.canonical_id)
            .bind(assignment.mention_id)
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn list_canonical_entities(&self, document_id: Uuid) -> Result<Vec<CanonicalEntity>> {
        let rows = sqlx::query(
            "SELECT id, document_id, name, entity_type, member_count
             FROM canonical_entities WHERE document_id = $1 ORDER BY position",
        )
        .bind(document_id)
        .fetch_all(self.pool())
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| CanonicalEntity {
                id: row.get("id"),
                document_id: row.get("document_id"),
                name: row.get("name"),
                entity_type: parse_entity_type(row.get("entity_type")),
                member_count: row.get::<i32, _>("member_count").max(0) as usize,
            })
            .collect())
    }
}
