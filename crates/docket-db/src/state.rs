//! Durable mirror of the per-document pipeline state.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use docket_core::{Error, PipelineState, Result, StateRepository};

use crate::PgStore;

#[async_trait]
impl StateRepository for PgStore {
    async fn save_pipeline_state(&self, state: &PipelineState) -> Result<()> {
        let json = serde_json::to_value(state)?;
        sqlx::query(
            "INSERT INTO pipeline_states (document_id, state, updated_at) VALUES ($1, $2, $3)
             ON CONFLICT (document_id) DO UPDATE SET state = EXCLUDED.state, updated_at = EXCLUDED.updated_at",
        )
        .bind(state.document_id)
        .bind(json)
        .bind(state.updated_at)
        .execute(self.pool())
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn load_pipeline_state(&self, document_id: Uuid) -> Result<Option<PipelineState>> {
        let json: Option<JsonValue> =
            sqlx::query_scalar("SELECT state FROM pipeline_states WHERE document_id = $1")
                .bind(document_id)
                .fetch_optional(self.pool())
                .await
                .map_err(Error::Database)?;

        json.map(|v| serde_json::from_value(v).map_err(Error::from))
            .transpose()
    }
}
