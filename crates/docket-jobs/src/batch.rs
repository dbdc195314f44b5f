//! Batch submission, progress tracking and partial-failure recovery.
//!
//! Submission is never all-or-nothing: a document that cannot be registered
//! or enqueued is reported back and the rest of the batch proceeds. Progress
//! is always recomputed from member document statuses in the durable store,
//! so every process sees the same counts.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use docket_cache::CacheLayer;
use docket_core::{
    document_id_for, new_v7, BatchJob, BatchProgress, BatchStatus, BreakerState, DocumentStatus,
    DurableStore, Error, NewBatch, NewDocument, ObjectStore, PipelineState, Priority,
    ProcessingTask, Result, SourceLocation, Stage, StageMessage, TaskQueue,
};

use crate::breaker::DocumentBreaker;
use crate::context::PipelineContext;
use crate::events::PipelineEvent;
use crate::state;

/// Recompute a batch's counters from its documents and persist them.
pub async fn refresh(store: &dyn DurableStore, batch_id: Uuid) -> Result<BatchProgress> {
    let progress = store.batch_progress(batch_id).await?;
    let status = if progress.is_terminal() {
        BatchStatus::Completed
    } else {
        BatchStatus::Running
    };
    store.update_batch(batch_id, progress, status).await?;
    if status == BatchStatus::Completed {
        info!(
            subsystem = "batch",
            component = "manager",
            batch_id = %batch_id,
            total = progress.total,
            completed = progress.completed,
            failed = progress.failed,
            "Batch reached terminal status"
        );
    }
    Ok(progress)
}

/// One document of a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRef {
    pub location: SourceLocation,
    pub priority: Priority,
}

impl DocumentRef {
    pub fn new(location: SourceLocation, priority: Priority) -> Self {
        Self { location, priority }
    }
}

impl From<(SourceLocation, Priority)> for DocumentRef {
    fn from((location, priority): (SourceLocation, Priority)) -> Self {
        Self { location, priority }
    }
}

/// What a submission did.
#[derive(Debug, Clone)]
pub struct BatchSubmission {
    pub batch_id: Uuid,
    pub progress: BatchProgress,
    /// Newly registered documents, in submission order.
    pub accepted: Vec<Uuid>,
    /// Documents already present in the batch; resubmitting them is a no-op.
    pub duplicates: Vec<Uuid>,
    /// Documents that could not be registered, with the reason.
    pub rejected: Vec<(SourceLocation, String)>,
}

#[derive(Clone)]
pub struct BatchManager {
    store: Arc<dyn DurableStore>,
    queue: Arc<dyn TaskQueue>,
    objects: Arc<dyn ObjectStore>,
    breaker: DocumentBreaker,
    cache: CacheLayer,
}

impl BatchManager {
    pub fn new(ctx: &PipelineContext) -> Self {
        Self {
            store: ctx.store.clone(),
            queue: ctx.queue.clone(),
            objects: ctx.objects.clone(),
            breaker: ctx.breaker.clone(),
            cache: ctx.cache.clone(),
        }
    }

    /// Register documents and enqueue their first stage.
    ///
    /// Passing an existing `batch_id` adds to that batch. Document ids derive
    /// from the batch and location, so submitting the same file twice to one
    /// batch registers it once.
    pub async fn submit<I, D>(
        &self,
        name: &str,
        documents: I,
        batch_id: Option<Uuid>,
    ) -> Result<BatchSubmission>
    where
        I: IntoIterator<Item = D>,
        D: Into<DocumentRef>,
    {
        let documents: Vec<DocumentRef> = documents.into_iter().map(Into::into).collect();
        if documents.is_empty() && batch_id.is_none() {
            return Err(Error::Validation("a new batch needs at least one document".into()));
        }

        let batch_id = batch_id.unwrap_or_else(new_v7);
        let priority = documents
            .iter()
            .map(|d| d.priority)
            .min()
            .unwrap_or_default();
        let batch = self
            .store
            .create_batch(&NewBatch {
                id: batch_id,
                name: name.to_string(),
                priority,
            })
            .await?;

        let mut accepted = Vec::new();
        let mut duplicates = Vec::new();
        let mut rejected = Vec::new();
        for doc in documents {
            let document_id = document_id_for(batch.id, &doc.location.to_string());
            match self.register(batch.id, document_id, &doc).await {
                Ok(true) => accepted.push(document_id),
                Ok(false) => duplicates.push(document_id),
                Err(e) => {
                    warn!(
                        subsystem = "batch",
                        component = "manager",
                        batch_id = %batch.id,
                        location = %doc.location,
                        error = %e,
                        "Document rejected at submission"
                    );
                    rejected.push((doc.location, e.to_string()));
                }
            }
        }

        let progress = refresh(self.store.as_ref(), batch.id).await?;
        info!(
            subsystem = "batch",
            component = "manager",
            batch_id = %batch.id,
            tier = %priority,
            accepted = accepted.len(),
            duplicates = duplicates.len(),
            rejected = rejected.len(),
            "Batch submitted"
        );
        Ok(BatchSubmission {
            batch_id: batch.id,
            progress,
            accepted,
            duplicates,
            rejected,
        })
    }

    /// Insert one document and enqueue its first stage. `false` if it existed.
    async fn register(&self, batch_id: Uuid, document_id: Uuid, doc: &DocumentRef) -> Result<bool> {
        let size_bytes = match self.objects.size(&doc.location).await {
            Ok(size) => Some(size),
            Err(e) => {
                debug!(
                    subsystem = "batch",
                    component = "manager",
                    location = %doc.location,
                    error = %e,
                    "Source size unknown at submission"
                );
                None
            }
        };

        let inserted = self
            .store
            .insert_document(&NewDocument {
                id: document_id,
                batch_id: Some(batch_id),
                location: doc.location.clone(),
                size_bytes,
            })
            .await?;
        if !inserted {
            return Ok(false);
        }

        let message = StageMessage::begin(document_id, Some(batch_id), doc.priority);
        if let Err(e) = self.queue.enqueue(&message).await {
            // Registered but never queued; fail it so the batch can still finish
            self.store
                .update_document(document_id, DocumentStatus::Failed, Stage::first())
                .await?;
            return Err(e);
        }
        Ok(true)
    }

    /// Current counters, recomputed from the durable store.
    pub async fn get_batch_status(&self, batch_id: Uuid) -> Result<BatchProgress> {
        self.batch(batch_id).await.map(|b| b.progress)
    }

    /// The batch row with freshly recomputed counters.
    pub async fn batch(&self, batch_id: Uuid) -> Result<BatchJob> {
        if self.store.get_batch(batch_id).await?.is_none() {
            return Err(Error::BatchNotFound(batch_id));
        }
        refresh(self.store.as_ref(), batch_id).await?;
        self.store
            .get_batch(batch_id)
            .await?
            .ok_or(Error::BatchNotFound(batch_id))
    }

    /// Refresh batch progress on every terminal document notification.
    ///
    /// Runs until the event channel closes.
    pub fn track(&self, mut events: broadcast::Receiver<PipelineEvent>) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(batch_id) = event.terminal_batch() else { continue };
                        if let Err(e) = refresh(store.as_ref(), batch_id).await {
                            warn!(
                                subsystem = "batch",
                                component = "tracker",
                                batch_id = %batch_id,
                                error = %e,
                                "Failed to refresh batch progress"
                            );
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            subsystem = "batch",
                            component = "tracker",
                            skipped,
                            "Batch tracker lagged behind pipeline events"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Put a failed document back into the pipeline at the stage it failed.
    ///
    /// Resets its breaker first, so the resubmitted attempt is not rejected.
    pub async fn retry_document(&self, document_id: Uuid) -> Result<StageMessage> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or(Error::DocumentNotFound(document_id))?;
        if document.status != DocumentStatus::Failed {
            return Err(Error::Validation(format!(
                "document {document_id} is {}, only failed documents can be retried",
                document.status.as_str()
            )));
        }

        let stage = document.stage.unwrap_or_else(Stage::first);
        let tier = match document.batch_id {
            Some(batch_id) => self
                .store
                .get_batch(batch_id)
                .await?
                .map(|b| b.priority)
                .unwrap_or_default(),
            None => Priority::default(),
        };
        let retries = self
            .store
            .list_tasks(document_id)
            .await?
            .iter()
            .filter(|t| t.stage == stage)
            .count();

        self.breaker.reset(document_id).await?;
        self.store
            .update_document(document_id, DocumentStatus::Processing, stage)
            .await?;
        let message = StageMessage {
            document_id,
            batch_id: document.batch_id,
            stage,
            tier,
            attempt: u32::try_from(retries).unwrap_or(u32::MAX),
        };
        self.queue.enqueue(&message).await?;

        if let Some(batch_id) = document.batch_id {
            refresh(self.store.as_ref(), batch_id).await?;
        }
        info!(
            subsystem = "batch",
            component = "manager",
            document_id = %document_id,
            stage = %stage,
            tier = %tier,
            "Failed document resubmitted"
        );
        Ok(message)
    }

    /// Most recent failed or rejected attempt of a document.
    pub async fn document_error(&self, document_id: Uuid) -> Result<Option<ProcessingTask>> {
        self.store.latest_failure(document_id).await
    }

    pub async fn breaker_state(&self, document_id: Uuid) -> Result<BreakerState> {
        self.breaker.state(document_id).await
    }

    pub async fn reset_breaker(&self, document_id: Uuid) -> Result<()> {
        self.breaker.reset(document_id).await
    }

    /// Progress of one document, served from the cache when present.
    pub async fn pipeline_state(&self, document_id: Uuid) -> Result<PipelineState> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or(Error::DocumentNotFound(document_id))?;
        state::load(self.store.as_ref(), &self.cache, &document).await
    }

    /// Re-enable the cache for every worker without waiting for its cooldown.
    pub async fn reset_cache_health(&self) {
        self.cache.reset_health().await;
    }
}
