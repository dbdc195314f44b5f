//! In-memory store and queue.
//!
//! Same contracts as the PostgreSQL implementations, held in process. Used by
//! the integration tests and for single-process runs without a database.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use docket_core::{
    defaults, new_v7, BatchJob, BatchProgress, BatchRepository, BatchStatus, BreakerRecord,
    BreakerRepository, CacheHealthRecord, CacheHealthRepository, CanonicalEntity, Chunk,
    ChunkRepository, Document, DocumentRepository, DocumentStatus, EntityMention,
    EntityRepository, Error, MentionAssignment, NewBatch, NewDocument, PipelineState, Priority,
    ProcessingTask, QueuedTask, Relationship, RelationshipRepository, Result, Stage,
    StageMessage, StateRepository, TaskOutcome, TaskQueue, TaskRepository, TaskStatus,
};

use crate::documents::text_ref;

#[derive(Default)]
struct Inner {
    documents: HashMap<Uuid, Document>,
    /// Insertion order of documents.
    document_order: Vec<Uuid>,
    texts: HashMap<Uuid, String>,
    chunks: HashMap<Uuid, Vec<Chunk>>,
    mentions: HashMap<Uuid, Vec<EntityMention>>,
    entities: HashMap<Uuid, Vec<CanonicalEntity>>,
    relationships: HashMap<Uuid, Vec<Relationship>>,
    tasks: Vec<ProcessingTask>,
    batches: HashMap<Uuid, BatchJob>,
    states: HashMap<Uuid, PipelineState>,
    breakers: HashMap<Uuid, BreakerRecord>,
    cache_health: HashMap<String, CacheHealthRecord>,
    stale_cache_keys: HashMap<String, BTreeSet<String>>,
}

/// In-process [`docket_core::DurableStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
    reads: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a transient error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of artifact reads served (text, chunks, mentions, entities, state).
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Transient("durable store unavailable".to_string()));
        }
        Ok(())
    }

    fn count_read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentRepository for MemoryStore {
    async fn insert_document(&self, doc: &NewDocument) -> Result<bool> {
        self.check()?;
        let mut inner = self.inner.write().await;
        if inner.documents.contains_key(&doc.id) {
            return Ok(false);
        }
        let now = Utc::now();
        inner.documents.insert(
            doc.id,
            Document {
                id: doc.id,
                batch_id: doc.batch_id,
                location: doc.location.clone(),
                size_bytes: doc.size_bytes,
                status: DocumentStatus::Pending,
                stage: None,
                extracted_text_ref: None,
                created_at: now,
                updated_at: now,
            },
        );
        inner.document_order.push(doc.id);
        Ok(true)
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        self.check()?;
        Ok(self.inner.read().await.documents.get(&id).cloned())
    }

    async fn update_document(&self, id: Uuid, status: DocumentStatus, stage: Stage) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.write().await;
        let doc = inner
            .documents
            .get_mut(&id)
            .ok_or(Error::DocumentNotFound(id))?;
        doc.status = status;
        doc.stage = Some(stage);
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn save_extracted_text(&self, id: Uuid, text: &str) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.write().await;
        let doc = inner
            .documents
            .get_mut(&id)
            .ok_or(Error::DocumentNotFound(id))?;
        doc.extracted_text_ref = Some(text_ref(id));
        doc.updated_at = Utc::now();
        inner.texts.insert(id, text.to_string());
        Ok(())
    }

    async fn load_extracted_text(&self, id: Uuid) -> Result<Option<String>> {
        self.check()?;
        self.count_read();
        Ok(self.inner.read().await.texts.get(&id).cloned())
    }

    async fn list_batch_documents(&self, batch_id: Uuid) -> Result<Vec<Document>> {
        self.check()?;
        let inner = self.inner.read().await;
        Ok(inner
            .document_order
            .iter()
            .filter_map(|id| inner.documents.get(id))
            .filter(|d| d.batch_id == Some(batch_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ChunkRepository for MemoryStore {
    async fn replace_chunks(&self, document_id: Uuid, chunks: &[Chunk]) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.write().await;
        inner.mentions.remove(&document_id);
        inner.chunks.insert(document_id, chunks.to_vec());
        Ok(())
    }

    async fn list_chunks(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        self.check()?;
        self.count_read();
        let inner = self.inner.read().await;
        Ok(inner.chunks.get(&document_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl EntityRepository for MemoryStore {
    async fn replace_mentions(&self, document_id: Uuid, mentions: &[EntityMention]) -> Result<()> {
        self.check()?;
        self.inner
            .write()
            .await
            .mentions
            .insert(document_id, mentions.to_vec());
        Ok(())
    }

    async fn list_mentions(&self, document_id: Uuid) -> Result<Vec<EntityMention>> {
        self.check()?;
        self.count_read();
        let inner = self.inner.read().await;
        Ok(inner.mentions.get(&document_id).cloned().unwrap_or_default())
    }

    async fn replace_canonical_entities(
        &self,
        document_id: Uuid,
        entities: &[CanonicalEntity],
        assignments: &[MentionAssignment],
    ) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.write().await;
        let canonical_of: HashMap<Uuid, Uuid> = assignments
            .iter()
            .map(|a| (a.mention_id, a.canonical_id))
            .collect();
        if let Some(mentions) = inner.mentions.get_mut(&document_id) {
            for mention in mentions.iter_mut() {
                mention.canonical_id = canonical_of.get(&mention.id).copied();
            }
        }
        inner.entities.insert(document_id, entities.to_vec());
        Ok(())
    }

    async fn list_canonical_entities(&self, document_id: Uuid) -> Result<Vec<CanonicalEntity>> {
        self.check()?;
        self.count_read();
        let inner = self.inner.read().await;
        Ok(inner.entities.get(&document_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl RelationshipRepository for MemoryStore {
    async fn replace_relationships(
        &self,
        document_id: Uuid,
        relationships: &[Relationship],
    ) -> Result<()> {
        self.check()?;
        self.inner
            .write()
            .await
            .relationships
            .insert(document_id, relationships.to_vec());
        Ok(())
    }

    async fn list_relationships(&self, document_id: Uuid) -> Result<Vec<Relationship>> {
        self.check()?;
        let inner = self.inner.read().await;
        Ok(inner
            .relationships
            .get(&document_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn start_task(&self, document_id: Uuid, stage: Stage) -> Result<ProcessingTask> {
        self.check()?;
        let task = ProcessingTask {
            id: new_v7(),
            document_id,
            stage,
            status: TaskStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            retry_count: 0,
            output: None,
        };
        self.inner.write().await.tasks.push(task.clone());
        Ok(task)
    }

    async fn finish_task(&self, task_id: Uuid, outcome: &TaskOutcome) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.write().await;
        if let Some(task) = inner.tasks.iter_mut().find(|t| t.id == task_id) {
            task.status = outcome.status;
            task.completed_at = Some(Utc::now());
            task.error = outcome.error.clone();
            task.retry_count = outcome.retry_count;
            task.output = outcome.output.clone();
        }
        Ok(())
    }

    async fn list_tasks(&self, document_id: Uuid) -> Result<Vec<ProcessingTask>> {
        self.check()?;
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .iter()
            .filter(|t| t.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn latest_failure(&self, document_id: Uuid) -> Result<Option<ProcessingTask>> {
        self.check()?;
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .iter()
            .rev()
            .find(|t| {
                t.document_id == document_id
                    && matches!(t.status, TaskStatus::Failed | TaskStatus::Rejected)
            })
            .cloned())
    }
}

#[async_trait]
impl BatchRepository for MemoryStore {
    async fn create_batch(&self, batch: &NewBatch) -> Result<BatchJob> {
        self.check()?;
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let job = inner.batches.entry(batch.id).or_insert_with(|| BatchJob {
            id: batch.id,
            name: batch.name.clone(),
            priority: batch.priority,
            status: BatchStatus::Running,
            progress: BatchProgress::default(),
            created_at: now,
            updated_at: now,
        });
        Ok(job.clone())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<BatchJob>> {
        self.check()?;
        Ok(self.inner.read().await.batches.get(&id).cloned())
    }

    async fn batch_progress(&self, id: Uuid) -> Result<BatchProgress> {
        self.check()?;
        let inner = self.inner.read().await;
        Ok(BatchProgress::from_statuses(
            inner
                .documents
                .values()
                .filter(|d| d.batch_id == Some(id))
                .map(|d| d.status),
        ))
    }

    async fn update_batch(
        &self,
        id: Uuid,
        progress: BatchProgress,
        status: BatchStatus,
    ) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.write().await;
        let job = inner.batches.get_mut(&id).ok_or(Error::BatchNotFound(id))?;
        job.progress = progress;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl StateRepository for MemoryStore {
    async fn save_pipeline_state(&self, state: &PipelineState) -> Result<()> {
        self.check()?;
        self.inner
            .write()
            .await
            .states
            .insert(state.document_id, state.clone());
        Ok(())
    }

    async fn load_pipeline_state(&self, document_id: Uuid) -> Result<Option<PipelineState>> {
        self.check()?;
        self.count_read();
        Ok(self.inner.read().await.states.get(&document_id).cloned())
    }
}

#[async_trait]
impl BreakerRepository for MemoryStore {
    async fn load_breaker(&self, document_id: Uuid) -> Result<Option<BreakerRecord>> {
        self.check()?;
        Ok(self.inner.read().await.breakers.get(&document_id).cloned())
    }

    async fn save_breaker(&self, record: &BreakerRecord) -> Result<()> {
        self.check()?;
        self.inner
            .write()
            .await
            .breakers
            .insert(record.document_id, record.clone());
        Ok(())
    }

    async fn delete_breaker(&self, document_id: Uuid) -> Result<()> {
        self.check()?;
        self.inner.write().await.breakers.remove(&document_id);
        Ok(())
    }
}

#[async_trait]
impl CacheHealthRepository for MemoryStore {
    async fn load_cache_health(&self, scope: &str) -> Result<Option<CacheHealthRecord>> {
        self.check()?;
        Ok(self.inner.read().await.cache_health.get(scope).cloned())
    }

    async fn trip_cache_health(
        &self,
        scope: &str,
        disabled_until: DateTime<Utc>,
    ) -> Result<CacheHealthRecord> {
        self.check()?;
        let mut inner = self.inner.write().await;
        let record = inner
            .cache_health
            .entry(scope.to_string())
            .or_insert_with(|| CacheHealthRecord::healthy(scope));
        record.generation += 1;
        record.trips += 1;
        record.disabled_until = Some(
            record
                .disabled_until
                .map_or(disabled_until, |until| until.max(disabled_until)),
        );
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn reset_cache_health(&self, scope: &str) -> Result<CacheHealthRecord> {
        self.check()?;
        let mut inner = self.inner.write().await;
        let record = inner
            .cache_health
            .entry(scope.to_string())
            .or_insert_with(|| CacheHealthRecord::healthy(scope));
        record.generation += 1;
        record.disabled_until = None;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn mark_cache_keys_stale(&self, scope: &str, keys: &[String]) -> Result<()> {
        self.check()?;
        self.inner
            .write()
            .await
            .stale_cache_keys
            .entry(scope.to_string())
            .or_default()
            .extend(keys.iter().cloned());
        Ok(())
    }

    async fn take_stale_cache_keys(&self, scope: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(self
            .inner
            .write()
            .await
            .stale_cache_keys
            .remove(scope)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default())
    }
}

// =============================================================================
// QUEUE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Queued,
    Leased,
    Dead,
}

#[derive(Debug, Clone)]
struct Entry {
    id: Uuid,
    message: StageMessage,
    status: EntryStatus,
    deliveries: u32,
    visible_at: Instant,
    leased_until: Option<Instant>,
    claimed_at: DateTime<Utc>,
    last_error: Option<String>,
}

/// In-process [`TaskQueue`] with the same lease and visibility semantics as
/// the PostgreSQL queue. Timing follows `tokio::time`, so paused-clock tests
/// can advance past delays and leases.
pub struct MemoryTaskQueue {
    entries: Mutex<Vec<Entry>>,
    notify: Arc<Notify>,
    lease: Duration,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            notify: Arc::new(Notify::new()),
            lease: Duration::from_secs(defaults::QUEUE_LEASE_SECS),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, Vec<Entry>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Queue("queue lock poisoned".to_string()))
    }

    /// Messages parked as dead letters, with their last error.
    pub fn dead_letters(&self) -> Vec<(StageMessage, String)> {
        self.entries()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.status == EntryStatus::Dead)
                    .map(|e| (e.message.clone(), e.last_error.clone().unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Messages waiting or leased across all tiers.
    pub fn pending(&self) -> usize {
        self.entries()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.status != EntryStatus::Dead)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, message: &StageMessage) -> Result<Uuid> {
        let mut entries = self.entries()?;
        let live = entries.iter().find(|e| {
            e.status != EntryStatus::Dead
                && e.message.document_id == message.document_id
                && e.message.stage == message.stage
        });
        if let Some(existing) = live {
            return Ok(existing.id);
        }

        let id = new_v7();
        entries.push(Entry {
            id,
            message: message.clone(),
            status: EntryStatus::Queued,
            deliveries: 0,
            visible_at: Instant::now(),
            leased_until: None,
            claimed_at: Utc::now(),
            last_error: None,
        });
        drop(entries);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn claim(&self, tier: Priority) -> Result<Option<QueuedTask>> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        let candidate = entries
            .iter_mut()
            .filter(|e| e.message.tier == tier)
            .filter(|e| match e.status {
                EntryStatus::Queued => e.visible_at <= now,
                EntryStatus::Leased => e.leased_until.is_some_and(|until| until < now),
                EntryStatus::Dead => false,
            })
            .min_by_key(|e| e.visible_at);

        Ok(candidate.map(|entry| {
            entry.status = EntryStatus::Leased;
            entry.deliveries += 1;
            entry.leased_until = Some(now + self.lease);
            entry.claimed_at = Utc::now();
            QueuedTask {
                id: entry.id,
                message: entry.message.clone(),
                deliveries: entry.deliveries,
                claimed_at: entry.claimed_at,
            }
        }))
    }

    async fn ack(&self, task_id: Uuid) -> Result<()> {
        self.entries()?.retain(|e| e.id != task_id);
        Ok(())
    }

    async fn retry(&self, task_id: Uuid, delay: Duration, error: &str) -> Result<()> {
        let mut entries = self.entries()?;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == task_id) {
            entry.status = EntryStatus::Queued;
            entry.visible_at = Instant::now() + delay;
            entry.leased_until = None;
            entry.last_error = Some(error.to_string());
        }
        drop(entries);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn renew(&self, task_id: Uuid) -> Result<bool> {
        let mut entries = self.entries()?;
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.id == task_id && e.status == EntryStatus::Leased)
        else {
            return Ok(false);
        };
        entry.leased_until = Some(Instant::now() + self.lease);
        Ok(true)
    }

    async fn dead_letter(&self, task_id: Uuid, error: &str) -> Result<()> {
        let mut entries = self.entries()?;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == task_id) {
            entry.status = EntryStatus::Dead;
            entry.leased_until = None;
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn depth(&self, tier: Priority) -> Result<u64> {
        Ok(self
            .entries()?
            .iter()
            .filter(|e| e.message.tier == tier && e.status != EntryStatus::Dead)
            .count() as u64)
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::SourceLocation;

    fn new_doc(batch_id: Option<Uuid>) -> NewDocument {
        NewDocument {
            id: Uuid::new_v4(),
            batch_id,
            location: SourceLocation::new("bucket", "file.txt"),
            size_bytes: Some(12),
        }
    }

    #[tokio::test]
    async fn test_insert_document_is_idempotent() {
        let store = MemoryStore::new();
        let doc = new_doc(None);
        assert!(store.insert_document(&doc).await.unwrap());
        assert!(!store.insert_document(&doc).await.unwrap());
        let fetched = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, DocumentStatus::Pending);
    }

    #[tokio::test]
    async fn test_batch_progress_counts_member_statuses() {
        let store = MemoryStore::new();
        let batch = Uuid::new_v4();
        store
            .create_batch(&NewBatch {
                id: batch,
                name: "b".into(),
                priority: Priority::Normal,
            })
            .await
            .unwrap();
        let a = new_doc(Some(batch));
        let b = new_doc(Some(batch));
        store.insert_document(&a).await.unwrap();
        store.insert_document(&b).await.unwrap();
        store.insert_document(&new_doc(None)).await.unwrap();
        store
            .update_document(a.id, DocumentStatus::Completed, Stage::Finalization)
            .await
            .unwrap();

        let progress = store.batch_progress(batch).await.unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.in_flight, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_transiently() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.get_document(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_transient());
        store.set_unavailable(false);
        assert!(store.get_document(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_chunks_drops_stale_mentions() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        let chunk = docket_core::chunk_id(doc, 0);
        let mention = EntityMention {
            id: docket_core::mention_id(chunk, 0),
            document_id: doc,
            chunk_id: chunk,
            text: "Acme".into(),
            entity_type: docket_core::EntityType::Organization,
            start_offset: 0,
            end_offset: 4,
            confidence: 0.9,
            canonical_id: None,
        };
        store.replace_mentions(doc, &[mention]).await.unwrap();
        assert_eq!(store.list_mentions(doc).await.unwrap().len(), 1);

        store.replace_chunks(doc, &[]).await.unwrap();
        assert!(store.list_mentions(doc).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_claim_is_per_tier_and_fifo() {
        let queue = MemoryTaskQueue::new();
        let high = StageMessage::begin(Uuid::new_v4(), None, Priority::High);
        let low = StageMessage::begin(Uuid::new_v4(), None, Priority::Low);
        let high2 = StageMessage::begin(Uuid::new_v4(), None, Priority::High);
        queue.enqueue(&high).await.unwrap();
        queue.enqueue(&low).await.unwrap();
        queue.enqueue(&high2).await.unwrap();

        let first = queue.claim(Priority::High).await.unwrap().unwrap();
        assert_eq!(first.message, high);
        assert_eq!(first.deliveries, 1);
        let second = queue.claim(Priority::High).await.unwrap().unwrap();
        assert_eq!(second.message, high2);
        assert!(queue.claim(Priority::High).await.unwrap().is_none());
        assert_eq!(queue.depth(Priority::Low).await.unwrap(), 1);

        queue.ack(first.id).await.unwrap();
        assert_eq!(queue.depth(Priority::High).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_retry_delay_and_lease_redelivery() {
        let queue = MemoryTaskQueue::new().with_lease(Duration::from_secs(60));
        let msg = StageMessage::begin(Uuid::new_v4(), None, Priority::Normal);
        queue.enqueue(&msg).await.unwrap();

        let task = queue.claim(Priority::Normal).await.unwrap().unwrap();
        queue
            .retry(task.id, Duration::from_secs(5), "timeout")
            .await
            .unwrap();
        assert!(queue.claim(Priority::Normal).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        let again = queue.claim(Priority::Normal).await.unwrap().unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(again.deliveries, 2);

        // Never acked: re-delivered once the lease lapses
        assert!(queue.claim(Priority::Normal).await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(61)).await;
        let redelivered = queue.claim(Priority::Normal).await.unwrap().unwrap();
        assert_eq!(redelivered.deliveries, 3);
    }

    #[tokio::test]
    async fn test_dead_letter_leaves_depth() {
        let queue = MemoryTaskQueue::new();
        let msg = StageMessage::begin(Uuid::new_v4(), None, Priority::Low);
        queue.enqueue(&msg).await.unwrap();
        let task = queue.claim(Priority::Low).await.unwrap().unwrap();
        queue.dead_letter(task.id, "bad input").await.unwrap();

        assert_eq!(queue.depth(Priority::Low).await.unwrap(), 0);
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, "bad input");
    }

    #[tokio::test]
    async fn test_enqueue_keeps_one_live_message_per_stage() {
        let queue = MemoryTaskQueue::new();
        let msg = StageMessage::begin(Uuid::new_v4(), None, Priority::Normal);
        let first = queue.enqueue(&msg).await.unwrap();
        assert_eq!(queue.enqueue(&msg).await.unwrap(), first);
        assert_eq!(queue.pending(), 1);

        // Still deduplicated while leased, free again once acked
        let task = queue.claim(Priority::Normal).await.unwrap().unwrap();
        assert_eq!(queue.enqueue(&msg).await.unwrap(), first);
        queue.ack(task.id).await.unwrap();
        assert_ne!(queue.enqueue(&msg).await.unwrap(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_lease_is_not_redelivered() {
        let queue = MemoryTaskQueue::new().with_lease(Duration::from_secs(60));
        let msg = StageMessage::begin(Uuid::new_v4(), None, Priority::High);
        queue.enqueue(&msg).await.unwrap();
        let task = queue.claim(Priority::High).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(queue.renew(task.id).await.unwrap());
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(queue.claim(Priority::High).await.unwrap().is_none());

        queue.ack(task.id).await.unwrap();
        assert!(!queue.renew(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_health_record_is_shared_and_resettable() {
        let store = MemoryStore::new();
        assert!(store.load_cache_health("docket").await.unwrap().is_none());

        let until = Utc::now() + chrono::Duration::seconds(300);
        let tripped = store.trip_cache_health("docket", until).await.unwrap();
        assert_eq!((tripped.generation, tripped.trips), (1, 1));
        assert!(tripped.is_disabled_at(Utc::now()));

        let reset = store.reset_cache_health("docket").await.unwrap();
        assert_eq!(reset.generation, 2);
        assert!(!reset.is_disabled_at(Utc::now()));

        store
            .mark_cache_keys_stale("docket", &["docket:a".into(), "docket:a".into()])
            .await
            .unwrap();
        assert_eq!(
            store.take_stale_cache_keys("docket").await.unwrap(),
            vec!["docket:a".to_string()]
        );
        assert!(store.take_stale_cache_keys("docket").await.unwrap().is_empty());
    }
}
