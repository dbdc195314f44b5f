use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{info, trace};

use docket_cache::Artifact;
use docket_core::{
    mention_id, normalize_confidence, Chunk, Document, EntityMention, EntityType, Error,
    RawEntity, Result, Stage, StageOutput,
};

use super::{publish, read_chunks, StageExecutor};
use crate::context::PipelineContext;

/// Runs the entity model over every chunk and stores the mentions.
///
/// Offsets from the model are chunk-relative; stored mentions carry
/// document-relative character offsets. Confidence is normalized to 0..=1.
/// Entities without text are kept (with empty text) so resolution can count
/// and report them as malformed.
pub struct EntityExtractionStage;

fn to_mention(chunk: &Chunk, ordinal: usize, raw: RawEntity) -> EntityMention {
    EntityMention {
        id: mention_id(chunk.id, ordinal),
        document_id: chunk.document_id,
        chunk_id: chunk.id,
        text: raw.text.unwrap_or_default(),
        entity_type: EntityType::from_label(&raw.entity_type),
        start_offset: chunk.start_offset + raw.start,
        end_offset: chunk.start_offset + raw.end,
        confidence: normalize_confidence(raw.confidence),
        canonical_id: None,
    }
}

async fn extract_chunk(
    ctx: &PipelineContext,
    document: &Document,
    chunk: &Chunk,
) -> Result<Vec<EntityMention>> {
    let timeout = ctx.config.ner_timeout;
    let raw = tokio::time::timeout(timeout, ctx.ner.extract(&chunk.text))
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "entity extraction for chunk {} exceeded {}s",
                chunk.chunk_index,
                timeout.as_secs()
            ))
        })??;
    trace!(
        subsystem = "jobs",
        component = "entity_extraction",
        document_id = %document.id,
        chunk_index = chunk.chunk_index,
        found = raw.len(),
        "Chunk processed"
    );
    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(ordinal, entity)| to_mention(chunk, ordinal, entity))
        .collect())
}

#[async_trait]
impl StageExecutor for EntityExtractionStage {
    fn stage(&self) -> Stage {
        Stage::EntityExtraction
    }

    async fn execute(&self, ctx: &PipelineContext, document: &Document) -> Result<StageOutput> {
        let chunks = read_chunks(ctx, document.id).await?;
        if chunks.is_empty() {
            return Err(Error::Validation(format!(
                "document {} has no chunks",
                document.id
            )));
        }

        // Results come back in chunk order regardless of completion order
        let calls: Vec<BoxFuture<'_, Result<Vec<EntityMention>>>> = chunks
            .iter()
            .map(|chunk| extract_chunk(ctx, document, chunk).boxed())
            .collect();
        let per_chunk: Vec<Vec<EntityMention>> = stream::iter(calls)
            .buffered(ctx.config.ner_concurrency.max(1))
            .try_collect()
            .await?;
        let mentions: Vec<EntityMention> = per_chunk.into_iter().flatten().collect();

        ctx.store.replace_mentions(document.id, &mentions).await?;
        publish(
            ctx,
            &ctx.cache.keys().mentions(document.id),
            Artifact::Mentions,
            &mentions,
        )
        .await;

        info!(
            subsystem = "jobs",
            component = "entity_extraction",
            document_id = %document.id,
            chunk_count = chunks.len(),
            mention_count = mentions.len(),
            "Entities extracted"
        );
        Ok(StageOutput::EntityExtraction {
            chunks_processed: chunks.len(),
            mentions: mentions.len(),
        })
    }
}
