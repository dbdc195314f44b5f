//! Shared collaborators handed to every stage execution.

use std::sync::Arc;

use docket_cache::CacheLayer;
use docket_core::{DurableStore, EntityExtractionService, EntityResolver, ObjectStore, TaskQueue};
use docket_services::OcrWaiter;

use crate::breaker::DocumentBreaker;
use crate::chunker::TextChunker;
use crate::config::PipelineConfig;
use crate::events::EventBus;

/// Everything a stage needs, cheap to clone into spawned tasks.
///
/// Stages share no in-process state beyond this bundle: hand-off between
/// stages goes through the cache and the durable store.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn DurableStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub cache: CacheLayer,
    pub objects: Arc<dyn ObjectStore>,
    pub ocr: OcrWaiter,
    pub ner: Arc<dyn EntityExtractionService>,
    pub config: PipelineConfig,
    pub resolver: EntityResolver,
    pub chunker: TextChunker,
    pub breaker: DocumentBreaker,
    pub events: EventBus,
}

impl PipelineContext {
    pub fn new(
        store: Arc<dyn DurableStore>,
        queue: Arc<dyn TaskQueue>,
        cache: CacheLayer,
        objects: Arc<dyn ObjectStore>,
        ocr: OcrWaiter,
        ner: Arc<dyn EntityExtractionService>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            resolver: EntityResolver::new(config.resolver.clone()),
            chunker: TextChunker::new(config.chunking.clone()),
            breaker: DocumentBreaker::new(store.clone(), config.breaker.clone()),
            events: EventBus::default(),
            store,
            queue,
            cache,
            objects,
            ocr,
            ner,
            config,
        }
    }

    /// Publish on an existing bus instead of a private one.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }
}
