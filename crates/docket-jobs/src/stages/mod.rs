//! The six stage executors and the artifact hand-off between them.
//!
//! Every executor reads its input through the cache with a durable-store
//! fallback, validates it, transforms it and writes the result durably before
//! caching it. Executors never enqueue work themselves; the runner advances
//! the pipeline after recording the outcome.

mod entity_extraction;
mod entity_resolution;
mod extraction;
mod finalization;
mod relationships;
mod segmentation;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use docket_cache::Artifact;
use docket_core::{
    CanonicalEntity, Chunk, Document, EntityMention, Error, Result, Stage, StageOutput,
};

use crate::context::PipelineContext;

pub use entity_extraction::EntityExtractionStage;
pub use entity_resolution::EntityResolutionStage;
pub use extraction::ExtractionStage;
pub use finalization::FinalizationStage;
pub use relationships::{build_relationships, RelationshipStage};
pub use segmentation::SegmentationStage;

/// One step of the document pipeline.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Run the stage for one document and persist its output.
    ///
    /// A missing or empty input is a validation error, never a silent no-op.
    async fn execute(&self, ctx: &PipelineContext, document: &Document) -> Result<StageOutput>;
}

/// Executors by stage.
#[derive(Clone)]
pub struct StageRegistry {
    executors: HashMap<Stage, Arc<dyn StageExecutor>>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// The full six-stage pipeline.
    pub fn standard() -> Self {
        Self::empty()
            .with_executor(ExtractionStage)
            .with_executor(SegmentationStage)
            .with_executor(EntityExtractionStage)
            .with_executor(EntityResolutionStage)
            .with_executor(RelationshipStage)
            .with_executor(FinalizationStage)
    }

    /// Register (or replace) the executor for its stage.
    pub fn with_executor<E: StageExecutor + 'static>(mut self, executor: E) -> Self {
        self.executors.insert(executor.stage(), Arc::new(executor));
        self
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&stage).cloned()
    }
}

/// Cache a freshly written artifact. A skipped write drops any older copy
/// (inside the cache layer), so the next reader falls through to the store.
pub(crate) async fn publish<T: Serialize + ?Sized>(
    ctx: &PipelineContext,
    key: &str,
    artifact: Artifact,
    value: &T,
) {
    ctx.cache.set(key, value, ctx.cache.ttl_for(artifact)).await;
}

async fn read_through<T, F, Fut>(
    ctx: &PipelineContext,
    document_id: Uuid,
    artifact: Artifact,
    load: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let key = ctx.cache.keys().artifact(document_id, artifact);
    ctx.cache
        .get_or_compute(&key, ctx.cache.ttl_for(artifact), load)
        .await
}

pub(crate) async fn read_text(ctx: &PipelineContext, document_id: Uuid) -> Result<String> {
    let store = ctx.store.clone();
    read_through(ctx, document_id, Artifact::ExtractedText, move || async move {
        store.load_extracted_text(document_id).await?.ok_or_else(|| {
            Error::Validation(format!("document {document_id} has no extracted text"))
        })
    })
    .await
}

pub(crate) async fn read_chunks(ctx: &PipelineContext, document_id: Uuid) -> Result<Vec<Chunk>> {
    let store = ctx.store.clone();
    read_through(ctx, document_id, Artifact::Chunks, move || async move {
        store.list_chunks(document_id).await
    })
    .await
}

pub(crate) async fn read_mentions(
    ctx: &PipelineContext,
    document_id: Uuid,
) -> Result<Vec<EntityMention>> {
    let store = ctx.store.clone();
    read_through(ctx, document_id, Artifact::Mentions, move || async move {
        store.list_mentions(document_id).await
    })
    .await
}

pub(crate) async fn read_resolved_mentions(
    ctx: &PipelineContext,
    document_id: Uuid,
) -> Result<Vec<EntityMention>> {
    let store = ctx.store.clone();
    read_through(ctx, document_id, Artifact::ResolvedMentions, move || async move {
        store.list_mentions(document_id).await
    })
    .await
}

pub(crate) async fn read_entities(
    ctx: &PipelineContext,
    document_id: Uuid,
) -> Result<Vec<CanonicalEntity>> {
    let store = ctx.store.clone();
    read_through(ctx, document_id, Artifact::CanonicalEntities, move || async move {
        store.list_canonical_entities(document_id).await
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_every_stage() {
        let registry = StageRegistry::standard();
        for stage in Stage::ALL {
            let executor = registry.get(stage).unwrap();
            assert_eq!(executor.stage(), stage);
        }
        assert!(StageRegistry::empty().get(Stage::Extraction).is_none());
    }
}
