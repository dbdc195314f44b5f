//! Core traits for docket abstractions.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy, enabling pluggable backends and testability.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// DURABLE STORE
// =============================================================================

/// Repository for document rows.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Insert a document if its id is not present yet.
    ///
    /// Returns `false` when another writer created the row first; that is a
    /// successful no-op, not an error.
    async fn insert_document(&self, doc: &NewDocument) -> Result<bool>;

    /// Fetch a document by id.
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>>;

    /// Update lifecycle status and the most recently attempted stage.
    async fn update_document(&self, id: Uuid, status: DocumentStatus, stage: Stage) -> Result<()>;

    /// Store extracted text durably and point the document at it.
    async fn save_extracted_text(&self, id: Uuid, text: &str) -> Result<()>;

    /// Load extracted text, if extraction has completed.
    async fn load_extracted_text(&self, id: Uuid) -> Result<Option<String>>;

    /// All documents belonging to a batch, oldest first.
    async fn list_batch_documents(&self, batch_id: Uuid) -> Result<Vec<Document>>;
}

/// Repository for chunk sets.
#[async_trait]
pub trait ChunkRepository: Send + Sync {
    /// Replace the document's chunk set atomically.
    async fn replace_chunks(&self, document_id: Uuid, chunks: &[Chunk]) -> Result<()>;

    /// Chunks of a document in index order.
    async fn list_chunks(&self, document_id: Uuid) -> Result<Vec<Chunk>>;
}

/// Repository for entity mentions and canonical entities.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    /// Replace the document's mention set atomically.
    async fn replace_mentions(&self, document_id: Uuid, mentions: &[EntityMention])
        -> Result<()>;

    /// Mentions of a document in extraction order.
    async fn list_mentions(&self, document_id: Uuid) -> Result<Vec<EntityMention>>;

    /// Replace canonical entities and attach every assignment to its mention,
    /// in one transaction.
    async fn replace_canonical_entities(
        &self,
        document_id: Uuid,
        entities: &[CanonicalEntity],
        assignments: &[MentionAssignment],
    ) -> Result<()>;

    /// Canonical entities of a document.
    async fn list_canonical_entities(&self, document_id: Uuid) -> Result<Vec<CanonicalEntity>>;
}

/// Repository for relationship edges.
#[async_trait]
pub trait RelationshipRepository: Send + Sync {
    /// Replace the document's edge set atomically.
    async fn replace_relationships(
        &self,
        document_id: Uuid,
        relationships: &[Relationship],
    ) -> Result<()>;

    async fn list_relationships(&self, document_id: Uuid) -> Result<Vec<Relationship>>;
}

/// Repository for the processing task audit trail.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Open a `running` record for a stage attempt.
    async fn start_task(&self, document_id: Uuid, stage: Stage) -> Result<ProcessingTask>;

    /// Close a task record with its outcome.
    async fn finish_task(&self, task_id: Uuid, outcome: &TaskOutcome) -> Result<()>;

    /// Task history of a document, oldest first.
    async fn list_tasks(&self, document_id: Uuid) -> Result<Vec<ProcessingTask>>;

    /// Most recent failed or rejected task, for diagnosis.
    async fn latest_failure(&self, document_id: Uuid) -> Result<Option<ProcessingTask>>;
}

/// Repository for batch rows.
#[async_trait]
pub trait BatchRepository: Send + Sync {
    /// Create the batch, or return the existing row if the id is taken.
    async fn create_batch(&self, batch: &NewBatch) -> Result<BatchJob>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<BatchJob>>;

    /// Count member documents by status.
    async fn batch_progress(&self, id: Uuid) -> Result<BatchProgress>;

    /// Persist a recomputed progress snapshot.
    async fn update_batch(&self, id: Uuid, progress: BatchProgress, status: BatchStatus)
        -> Result<()>;
}

/// Durable mirror of the per-document pipeline state.
#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn save_pipeline_state(&self, state: &PipelineState) -> Result<()>;

    async fn load_pipeline_state(&self, document_id: Uuid) -> Result<Option<PipelineState>>;
}

/// Shared storage for per-document breaker counters.
#[async_trait]
pub trait BreakerRepository: Send + Sync {
    async fn load_breaker(&self, document_id: Uuid) -> Result<Option<BreakerRecord>>;

    async fn save_breaker(&self, record: &BreakerRecord) -> Result<()>;

    async fn delete_breaker(&self, document_id: Uuid) -> Result<()>;
}

/// Shared health of the cache layer, keyed by cache namespace.
#[async_trait]
pub trait CacheHealthRepository: Send + Sync {
    async fn load_cache_health(&self, scope: &str) -> Result<Option<CacheHealthRecord>>;

    /// Disable the namespace until `disabled_until` and bump the generation.
    async fn trip_cache_health(
        &self,
        scope: &str,
        disabled_until: DateTime<Utc>,
    ) -> Result<CacheHealthRecord>;

    /// Re-enable the namespace immediately and bump the generation.
    async fn reset_cache_health(&self, scope: &str) -> Result<CacheHealthRecord>;

    /// Remember keys that could not be removed from the cache.
    async fn mark_cache_keys_stale(&self, scope: &str, keys: &[String]) -> Result<()>;

    /// Take (and forget) every key marked stale for the namespace.
    async fn take_stale_cache_keys(&self, scope: &str) -> Result<Vec<String>>;
}

/// Everything the pipeline needs from the durable store.
pub trait DurableStore:
    DocumentRepository
    + ChunkRepository
    + EntityRepository
    + RelationshipRepository
    + TaskRepository
    + BatchRepository
    + StateRepository
    + BreakerRepository
    + CacheHealthRepository
{
}

impl<T> DurableStore for T where
    T: DocumentRepository
        + ChunkRepository
        + EntityRepository
        + RelationshipRepository
        + TaskRepository
        + BatchRepository
        + StateRepository
        + BreakerRepository
        + CacheHealthRepository
{
}

// =============================================================================
// TASK QUEUE
// =============================================================================

/// Tiered message queue the stages hand off through.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a message on its tier. Returns the message id.
    ///
    /// At most one live (queued or leased) message exists per document and
    /// stage; enqueueing a duplicate returns the existing message's id.
    async fn enqueue(&self, message: &StageMessage) -> Result<Uuid>;

    /// Claim the next visible message of a tier under a lease.
    ///
    /// Messages whose lease expired without an ack are handed out again.
    async fn claim(&self, tier: Priority) -> Result<Option<QueuedTask>>;

    /// Remove a message after it was handled.
    async fn ack(&self, task_id: Uuid) -> Result<()>;

    /// Release a message back to its tier, visible again after `delay`.
    async fn retry(&self, task_id: Uuid, delay: Duration, error: &str) -> Result<()>;

    /// Extend the lease of a message that is still being handled.
    ///
    /// Returns `false` when the message is no longer leased (acked, released
    /// or already re-delivered elsewhere).
    async fn renew(&self, task_id: Uuid) -> Result<bool>;

    /// Park a message that will never succeed.
    async fn dead_letter(&self, task_id: Uuid, error: &str) -> Result<()>;

    /// Messages waiting or leased on a tier.
    async fn depth(&self, tier: Priority) -> Result<u64>;

    /// Signalled on every enqueue so idle workers wake immediately.
    fn notifier(&self) -> Arc<Notify>;
}

// =============================================================================
// EXTERNAL SERVICES
// =============================================================================

/// Status of an OCR job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrStatus {
    InProgress,
    Succeeded,
    Failed,
}

/// Poll (or callback) payload of an OCR job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrPoll {
    pub status: OcrStatus,
    #[serde(default)]
    pub pages: Option<u32>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl OcrPoll {
    pub fn in_progress() -> Self {
        Self {
            status: OcrStatus::InProgress,
            pages: None,
            text: None,
            confidence: None,
            error: None,
        }
    }

    pub fn succeeded(text: impl Into<String>, pages: u32, confidence: Option<f64>) -> Self {
        Self {
            status: OcrStatus::Succeeded,
            pages: Some(pages),
            text: Some(text.into()),
            confidence,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OcrStatus::Failed,
            pages: None,
            text: None,
            confidence: None,
            error: Some(error.into()),
        }
    }
}

/// External OCR engine.
#[async_trait]
pub trait OcrService: Send + Sync {
    /// Start an OCR job for a stored file. Returns the job id.
    async fn submit(&self, location: &SourceLocation) -> Result<String>;

    /// Current status of a job.
    async fn poll(&self, job_id: &str) -> Result<OcrPoll>;
}

/// External named-entity extraction model.
#[async_trait]
pub trait EntityExtractionService: Send + Sync {
    /// Extract entities from one chunk. Offsets are relative to `text`.
    async fn extract(&self, text: &str) -> Result<Vec<RawEntity>>;
}

/// Object storage holding source files.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Object size in bytes.
    async fn size(&self, location: &SourceLocation) -> Result<u64>;

    /// Read an object fully into memory.
    async fn read(&self, location: &SourceLocation) -> Result<Vec<u8>>;

    /// Stream an object to a local path without buffering it whole.
    /// Returns the number of bytes written.
    async fn download_to(&self, location: &SourceLocation, dest: &Path) -> Result<u64>;

    /// Write an object.
    async fn put(&self, location: &SourceLocation, data: &[u8]) -> Result<()>;

    /// Upload a local file as an object. Returns the number of bytes written.
    async fn upload_from(&self, location: &SourceLocation, src: &Path) -> Result<u64>;

    /// Delete an object. Missing objects are not an error.
    async fn delete(&self, location: &SourceLocation) -> Result<()>;
}
