use async_trait::async_trait;
use tracing::info;

use docket_core::{Document, DocumentStatus, Error, Result, Stage, StageOutput};

use super::StageExecutor;
use crate::context::PipelineContext;

/// Verifies the durable artifacts and marks the document completed.
///
/// Counts are read from the durable store, never the cache, since this is
/// the stage that declares the document consistent.
pub struct FinalizationStage;

#[async_trait]
impl StageExecutor for FinalizationStage {
    fn stage(&self) -> Stage {
        Stage::Finalization
    }

    async fn execute(&self, ctx: &PipelineContext, document: &Document) -> Result<StageOutput> {
        let store = &ctx.store;
        let chunks = store.list_chunks(document.id).await?.len();
        if chunks == 0 {
            return Err(Error::Validation(format!(
                "document {} has no stored chunks",
                document.id
            )));
        }
        let mentions = store.list_mentions(document.id).await?.len();
        let canonical_entities = store.list_canonical_entities(document.id).await?.len();
        let relationships = store.list_relationships(document.id).await?.len();

        store
            .update_document(document.id, DocumentStatus::Completed, Stage::Finalization)
            .await?;

        info!(
            subsystem = "jobs",
            component = "finalization",
            document_id = %document.id,
            chunk_count = chunks,
            mention_count = mentions,
            entity_count = canonical_entities,
            relationships,
            "Document finalized"
        );
        Ok(StageOutput::Finalization {
            chunks,
            mentions,
            canonical_entities,
            relationships,
        })
    }
}
