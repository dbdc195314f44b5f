//! Shared in-memory pipeline fixture for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use docket_cache::{CacheConfig, CacheLayer, MemoryBackend};
use docket_db::{MemoryStore, MemoryTaskQueue};
use docket_jobs::{
    BatchManager, BreakerConfig, Document, DocumentRepository, ObjectStore, PipelineConfig,
    PipelineContext, Priority, RetryPolicy, SourceLocation, StageRegistry, StageRunner, TaskQueue,
};
use docket_services::{
    FilesystemObjectStore, MockEntityService, MockOcrService, OcrCallbacks, OcrWaitConfig,
    OcrWaiter,
};
use tempfile::TempDir;
use uuid::Uuid;

pub const BUCKET: &str = "intake";

/// A short deposition excerpt the mock entity model recognizes.
pub const DEPOSITION: &str = "Deposition of Javier Hinojo, taken on behalf of \
Wombat Acquisitions, LLC. The witness, Javier Hinojo, confirmed the lease. \
Counsel then asked J. Hinojo to identify the signature block.";

pub fn legal_ner() -> MockEntityService {
    MockEntityService::new()
        .with_entity("Javier Hinojo", "PERSON")
        .with_entity("J. Hinojo", "PERSON")
        .with_entity("Wombat Acquisitions, LLC", "ORG")
}

/// Fast defaults: no real backoff, short breaker cooldown.
pub fn fast_config() -> PipelineConfig {
    PipelineConfig::default()
        .with_retry(
            RetryPolicy::default()
                .with_max_retries(1)
                .with_backoff(Duration::from_millis(1), Duration::from_millis(5)),
        )
        .with_breaker(BreakerConfig::new(3, Duration::from_millis(200)))
        .with_stage_timeout(Duration::from_secs(10))
}

pub struct HarnessOptions {
    pub config: PipelineConfig,
    pub cache: CacheConfig,
    pub ner: MockEntityService,
    pub ocr: Box<dyn FnOnce(MockOcrService) -> MockOcrService>,
    pub registry: StageRegistry,
    pub queue_lease: Option<Duration>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            config: fast_config(),
            cache: CacheConfig::default(),
            ner: legal_ner(),
            ocr: Box::new(|ocr| ocr),
            registry: StageRegistry::standard(),
            queue_lease: None,
        }
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryTaskQueue>,
    pub backend: Arc<MemoryBackend>,
    pub objects: Arc<FilesystemObjectStore>,
    pub ocr: MockOcrService,
    pub ner: MockEntityService,
    pub runner: StageRunner,
    pub batches: BatchManager,
    _root: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        let root = TempDir::new().expect("temp dir");
        let store = Arc::new(MemoryStore::new());
        let queue = match options.queue_lease {
            Some(lease) => MemoryTaskQueue::new().with_lease(lease),
            None => MemoryTaskQueue::new(),
        };
        let queue = Arc::new(queue);
        let backend = Arc::new(MemoryBackend::new());
        let cache =
            CacheLayer::new(backend.clone(), options.cache).with_health_store(store.clone());
        let objects = Arc::new(FilesystemObjectStore::new(root.path()));

        let ocr = (options.ocr)(MockOcrService::new(objects.clone()));
        let waiter = OcrWaiter::new(
            Arc::new(ocr.clone()),
            OcrCallbacks::new(),
            OcrWaitConfig::default().with_poll_interval(Duration::from_millis(1)),
        );
        let ner = options.ner;

        let ctx = PipelineContext::new(
            store.clone(),
            queue.clone(),
            cache,
            objects.clone(),
            waiter,
            Arc::new(ner.clone()),
            options.config,
        );
        let batches = BatchManager::new(&ctx);
        let runner = StageRunner::new(ctx, options.registry);

        Self {
            store,
            queue,
            backend,
            objects,
            ocr,
            ner,
            runner,
            batches,
            _root: root,
        }
    }

    pub fn ctx(&self) -> &PipelineContext {
        self.runner.context()
    }

    /// Another worker's cache layer on the same backend and health store.
    pub fn peer_cache(&self, config: CacheConfig) -> CacheLayer {
        CacheLayer::new(self.backend.clone(), config).with_health_store(self.store.clone())
    }

    pub async fn put(&self, key: &str, body: &str) -> SourceLocation {
        let location = SourceLocation::new(BUCKET, key);
        self.objects
            .put(&location, body.as_bytes())
            .await
            .expect("put object");
        location
    }

    /// Submit one document as its own batch. Returns (batch_id, document_id).
    pub async fn submit_one(&self, key: &str, body: &str) -> (Uuid, Uuid) {
        let location = self.put(key, body).await;
        let submitted = self
            .batches
            .submit("single", [(location, Priority::Normal)], None)
            .await
            .expect("submit");
        assert_eq!(submitted.accepted.len(), 1);
        (submitted.batch_id, submitted.accepted[0])
    }

    /// Claim and handle messages on every tier until the queue is idle.
    pub async fn drain(&self) {
        loop {
            let mut handled = 0;
            for tier in Priority::ALL {
                while let Some(task) = self.queue.claim(tier).await.expect("claim") {
                    self.runner.handle(task).await;
                    handled += 1;
                }
            }
            if handled == 0 {
                break;
            }
        }
    }

    pub async fn document(&self, id: Uuid) -> Document {
        self.store
            .get_document(id)
            .await
            .expect("get document")
            .expect("document exists")
    }
}
