use async_trait::async_trait;
use tracing::info;

use docket_cache::Artifact;
use docket_core::{Document, Error, Result, Stage, StageOutput};

use super::{publish, read_text, StageExecutor};
use crate::context::PipelineContext;

/// Splits extracted text into ordered chunks and replaces the stored set.
pub struct SegmentationStage;

#[async_trait]
impl StageExecutor for SegmentationStage {
    fn stage(&self) -> Stage {
        Stage::Segmentation
    }

    async fn execute(&self, ctx: &PipelineContext, document: &Document) -> Result<StageOutput> {
        let text = read_text(ctx, document.id).await?;
        if text.trim().is_empty() {
            return Err(Error::Validation(format!(
                "document {} has empty extracted text",
                document.id
            )));
        }

        let chunks = ctx.chunker.chunk(document.id, &text);
        if chunks.is_empty() {
            return Err(Error::Validation(format!(
                "document {} produced no chunks",
                document.id
            )));
        }

        ctx.store.replace_chunks(document.id, &chunks).await?;
        // Downstream artifacts were derived from the previous chunk set
        for artifact in [
            Artifact::Mentions,
            Artifact::CanonicalEntities,
            Artifact::ResolvedMentions,
        ] {
            ctx.cache
                .delete(&ctx.cache.keys().artifact(document.id, artifact))
                .await;
        }
        publish(ctx, &ctx.cache.keys().chunks(document.id), Artifact::Chunks, &chunks).await;

        info!(
            subsystem = "jobs",
            component = "segmentation",
            document_id = %document.id,
            chunk_count = chunks.len(),
            "Document segmented"
        );
        Ok(StageOutput::Segmentation {
            chunks: chunks.len(),
        })
    }
}
