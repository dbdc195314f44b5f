//! Loading and saving the per-document pipeline state.
//!
//! The cached copy is disposable. [`load`] goes cache, then the durable
//! mirror, then a rebuild from the succeeded task records, so losing the
//! cache (or the mirror row) never loses progress. Stage ordering decisions
//! use [`load_durable`], which never consults the cache.

use tracing::{debug, info};

use docket_cache::{Artifact, CacheLayer};
use docket_core::{
    Document, DurableStore, ErrorKind, PipelineState, Result, StageFailure, TaskStatus,
};

pub async fn load(
    store: &dyn DurableStore,
    cache: &CacheLayer,
    document: &Document,
) -> Result<PipelineState> {
    let key = cache.keys().state(document.id);
    if let Some(state) = cache.get::<PipelineState>(&key).await {
        return Ok(state);
    }

    if let Some(state) = store.load_pipeline_state(document.id).await? {
        debug!(
            subsystem = "jobs",
            component = "state",
            document_id = %document.id,
            "Pipeline state served from durable mirror"
        );
        cache
            .set(&key, &state, cache.ttl_for(Artifact::PipelineState))
            .await;
        return Ok(state);
    }

    let state = reconstruct(store, document).await?;
    if !state.completed.is_empty() {
        info!(
            subsystem = "jobs",
            component = "state",
            document_id = %document.id,
            completed = state.completed.len(),
            "Pipeline state rebuilt from task history"
        );
        save(store, cache, &state).await?;
    }
    Ok(state)
}

/// The durable view of a document's progress: the mirror, else a rebuild
/// from task history.
pub async fn load_durable(store: &dyn DurableStore, document: &Document) -> Result<PipelineState> {
    if let Some(state) = store.load_pipeline_state(document.id).await? {
        return Ok(state);
    }
    let state = reconstruct(store, document).await?;
    if !state.completed.is_empty() {
        info!(
            subsystem = "jobs",
            component = "state",
            document_id = %document.id,
            completed = state.completed.len(),
            "Pipeline state rebuilt from task history"
        );
        store.save_pipeline_state(&state).await?;
    }
    Ok(state)
}

/// Rebuild state from the succeeded task records of a document.
///
/// Only an unbroken prefix of the pipeline counts as completed.
pub async fn reconstruct(store: &dyn DurableStore, document: &Document) -> Result<PipelineState> {
    let mut state = PipelineState::new(document.id, document.batch_id);
    for task in store.list_tasks(document.id).await? {
        if task.status != TaskStatus::Succeeded {
            continue;
        }
        let Some(output) = task.output else { continue };
        let prefix_ok = task
            .stage
            .previous()
            .map_or(true, |prev| state.is_complete(prev));
        if prefix_ok {
            state.record_success(output);
        }
    }

    state.status = document.status;
    if document.status.is_terminal() || state.completed.is_empty() {
        if let Some(task) = store.latest_failure(document.id).await? {
            if let Some(message) = task.error {
                let kind = match task.status {
                    TaskStatus::Rejected => ErrorKind::CircuitOpen,
                    _ => ErrorKind::Fatal,
                };
                state.last_error = Some(StageFailure { kind, message });
            }
        }
    }
    Ok(state)
}

/// Write the state durably, then refresh the cached copy. A cache write that
/// is skipped removes the older cached copy.
pub async fn save(
    store: &dyn DurableStore,
    cache: &CacheLayer,
    state: &PipelineState,
) -> Result<()> {
    store.save_pipeline_state(state).await?;
    cache
        .set(
            &cache.keys().state(state.document_id),
            state,
            cache.ttl_for(Artifact::PipelineState),
        )
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::{
        DocumentRepository, DocumentStatus, NewDocument, SourceLocation, Stage, StageOutput,
        StateRepository, TaskOutcome, TaskRepository,
    };
    use docket_db::MemoryStore;
    use uuid::Uuid;

    async fn seeded(store: &MemoryStore) -> Document {
        let id = Uuid::new_v4();
        store
            .insert_document(&NewDocument {
                id,
                batch_id: None,
                location: SourceLocation::new("b", "k"),
                size_bytes: None,
            })
            .await
            .unwrap();
        store.get_document(id).await.unwrap().unwrap()
    }

    async fn succeed(store: &MemoryStore, doc: Uuid, output: StageOutput) {
        let task = store.start_task(doc, output.stage()).await.unwrap();
        store
            .finish_task(task.id, &TaskOutcome::succeeded(output, 0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rebuilds_from_task_history() {
        let store = MemoryStore::new();
        let doc = seeded(&store).await;
        succeed(&store, doc.id, StageOutput::Segmentation { chunks: 4 }).await;

        let task = store.start_task(doc.id, Stage::Extraction).await.unwrap();
        store
            .finish_task(task.id, &TaskOutcome::failed("ocr down", 0))
            .await
            .unwrap();

        // Segmentation without a completed extraction is not a valid prefix
        let state = reconstruct(&store, &doc).await.unwrap();
        assert!(state.completed.is_empty());

        succeed(
            &store,
            doc.id,
            StageOutput::Extraction {
                characters: 10,
                pages: 1,
                mode: docket_core::ExtractionMode::InMemory,
                confidence: None,
                source_sha256: "00".into(),
            },
        )
        .await;
        succeed(&store, doc.id, StageOutput::Segmentation { chunks: 4 }).await;

        let state = reconstruct(&store, &doc).await.unwrap();
        assert_eq!(state.next_stage(), Some(Stage::EntityExtraction));
        assert_eq!(state.status, DocumentStatus::Pending);
    }

    #[tokio::test]
    async fn test_load_prefers_cache_then_mirror() {
        let store = MemoryStore::new();
        let cache = CacheLayer::new(
            std::sync::Arc::new(docket_cache::MemoryBackend::new()),
            docket_cache::CacheConfig::default(),
        );
        let doc = seeded(&store).await;

        let mut state = PipelineState::new(doc.id, None);
        state.record_success(StageOutput::Segmentation { chunks: 1 });
        store.save_pipeline_state(&state).await.unwrap();

        let loaded = load(&store, &cache, &doc).await.unwrap();
        assert_eq!(loaded.completed.len(), 1);

        // Mirror gone, cache still answers
        store.set_unavailable(true);
        let cached = load(&store, &cache, &doc).await.unwrap();
        assert_eq!(cached, loaded);
    }

    #[tokio::test]
    async fn test_durable_load_ignores_stale_cached_state() {
        let store = MemoryStore::new();
        let cache = CacheLayer::new(
            std::sync::Arc::new(docket_cache::MemoryBackend::new()),
            docket_cache::CacheConfig::default(),
        );
        let doc = seeded(&store).await;
        let extraction = StageOutput::Extraction {
            characters: 10,
            pages: 1,
            mode: docket_core::ExtractionMode::InMemory,
            confidence: None,
            source_sha256: "00".into(),
        };

        // The cached copy missed the segmentation write
        let mut stale = PipelineState::new(doc.id, None);
        stale.record_success(extraction.clone());
        cache
            .set(&cache.keys().state(doc.id), &stale, cache.ttl_for(Artifact::PipelineState))
            .await;
        let mut current = stale.clone();
        current.record_success(StageOutput::Segmentation { chunks: 3 });
        store.save_pipeline_state(&current).await.unwrap();

        assert_eq!(
            load(&store, &cache, &doc).await.unwrap().next_stage(),
            Some(Stage::Segmentation)
        );
        let durable = load_durable(&store, &doc).await.unwrap();
        assert_eq!(durable.next_stage(), Some(Stage::EntityExtraction));
    }

    #[tokio::test]
    async fn test_durable_load_rebuilds_missing_mirror() {
        let store = MemoryStore::new();
        let doc = seeded(&store).await;
        succeed(
            &store,
            doc.id,
            StageOutput::Extraction {
                characters: 10,
                pages: 1,
                mode: docket_core::ExtractionMode::InMemory,
                confidence: None,
                source_sha256: "00".into(),
            },
        )
        .await;

        let state = load_durable(&store, &doc).await.unwrap();
        assert_eq!(state.next_stage(), Some(Stage::Segmentation));
        let mirror = store.load_pipeline_state(doc.id).await.unwrap().unwrap();
        assert_eq!(mirror, state);
    }
}
