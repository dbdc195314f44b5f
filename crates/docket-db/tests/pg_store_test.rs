//! PostgreSQL store and queue tests.
//!
//! **IMPORTANT**: These tests need a running PostgreSQL server. Run with
//! `DATABASE_URL=... cargo test -p docket-db -- --ignored`.

use std::time::Duration;

use docket_db::test_fixtures::TestDatabase;
use docket_db::{
    chunk_id, BatchRepository, CacheHealthRepository, BatchStatus, BreakerRecord, BreakerRepository, Chunk,
    ChunkRepository, DocumentRepository, DocumentStatus, NewBatch, NewDocument, PipelineState,
    Priority, SourceLocation, Stage, StageMessage, StageOutput, StateRepository, TaskQueue,
    TaskOutcome, TaskRepository,
};
use uuid::Uuid;

async fn test_database() -> TestDatabase {
    dotenvy::dotenv().ok();
    TestDatabase::new().await
}

async fn seed_document(test_db: &TestDatabase, batch_id: Option<Uuid>, key: &str) -> Uuid {
    let id = Uuid::new_v4();
    let inserted = test_db
        .db
        .store
        .insert_document(&NewDocument {
            id,
            batch_id,
            location: SourceLocation::new("intake", key),
            size_bytes: Some(1024),
        })
        .await
        .expect("insert document");
    assert!(inserted);
    id
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_concurrent_insert_is_noop_for_second_writer() {
    let test_db = test_database().await;
    let doc = NewDocument {
        id: Uuid::new_v4(),
        batch_id: None,
        location: SourceLocation::new("intake", "race.pdf"),
        size_bytes: None,
    };

    let (a, b) = tokio::join!(
        test_db.db.store.insert_document(&doc),
        test_db.db.store.insert_document(&doc)
    );
    let created = [a.unwrap(), b.unwrap()];
    assert_eq!(created.iter().filter(|c| **c).count(), 1);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_chunks_replace_atomically() {
    let test_db = test_database().await;
    let doc = seed_document(&test_db, None, "a.txt").await;
    let chunks = |n: usize| -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk {
                id: chunk_id(doc, i),
                document_id: doc,
                chunk_index: i,
                start_offset: i * 10,
                end_offset: i * 10 + 10,
                text: "x".repeat(10),
            })
            .collect()
    };

    test_db.db.store.replace_chunks(doc, &chunks(3)).await.unwrap();
    test_db.db.store.replace_chunks(doc, &chunks(3)).await.unwrap();
    assert_eq!(test_db.db.store.list_chunks(doc).await.unwrap().len(), 3);

    test_db.db.store.replace_chunks(doc, &chunks(2)).await.unwrap();
    assert_eq!(test_db.db.store.list_chunks(doc).await.unwrap().len(), 2);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_batch_progress_from_documents() {
    let test_db = test_database().await;
    let batch = Uuid::new_v4();
    let created = test_db
        .db
        .store
        .create_batch(&NewBatch {
            id: batch,
            name: "filings".into(),
            priority: Priority::High,
        })
        .await
        .unwrap();
    assert_eq!(created.status, BatchStatus::Running);

    let a = seed_document(&test_db, Some(batch), "a.pdf").await;
    let b = seed_document(&test_db, Some(batch), "b.pdf").await;
    seed_document(&test_db, Some(batch), "c.pdf").await;
    test_db
        .db
        .store
        .update_document(a, DocumentStatus::Completed, Stage::Finalization)
        .await
        .unwrap();
    test_db
        .db
        .store
        .update_document(b, DocumentStatus::Failed, Stage::Extraction)
        .await
        .unwrap();

    let progress = test_db.db.store.batch_progress(batch).await.unwrap();
    assert_eq!((progress.total, progress.completed, progress.failed, progress.in_flight), (3, 1, 1, 1));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_tasks_state_and_breaker_round_trip() {
    let test_db = test_database().await;
    let doc = seed_document(&test_db, None, "d.pdf").await;
    let store = &test_db.db.store;

    let task = store.start_task(doc, Stage::Extraction).await.unwrap();
    store
        .finish_task(task.id, &TaskOutcome::failed("ocr timed out", 3))
        .await
        .unwrap();
    let failure = store.latest_failure(doc).await.unwrap().unwrap();
    assert_eq!(failure.error.as_deref(), Some("ocr timed out"));
    assert_eq!(failure.retry_count, 3);

    let mut state = PipelineState::new(doc, None);
    state.record_success(StageOutput::Segmentation { chunks: 2 });
    store.save_pipeline_state(&state).await.unwrap();
    let loaded = store.load_pipeline_state(doc).await.unwrap().unwrap();
    assert!(loaded.is_complete(Stage::Segmentation));

    let mut record = BreakerRecord::closed(doc);
    record.consecutive_failures = 2;
    store.save_breaker(&record).await.unwrap();
    assert_eq!(
        store.load_breaker(doc).await.unwrap().unwrap().consecutive_failures,
        2
    );
    store.delete_breaker(doc).await.unwrap();
    assert!(store.load_breaker(doc).await.unwrap().is_none());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_queue_claim_skips_leased_and_honours_retry_delay() {
    let test_db = test_database().await;
    let queue = &test_db.db.queue;
    let msg = StageMessage::begin(Uuid::new_v4(), None, Priority::Normal);
    queue.enqueue(&msg).await.unwrap();

    let task = queue.claim(Priority::Normal).await.unwrap().unwrap();
    assert_eq!(task.message, msg);
    assert!(queue.claim(Priority::Normal).await.unwrap().is_none());
    assert!(queue.claim(Priority::High).await.unwrap().is_none());

    queue
        .retry(task.id, Duration::from_secs(3600), "rate limited")
        .await
        .unwrap();
    assert!(queue.claim(Priority::Normal).await.unwrap().is_none());
    assert_eq!(queue.depth(Priority::Normal).await.unwrap(), 1);

    queue.ack(task.id).await.unwrap();
    assert_eq!(queue.depth(Priority::Normal).await.unwrap(), 0);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_queue_keeps_one_live_message_and_renews_leases() {
    let test_db = test_database().await;
    let queue = &test_db.db.queue;
    let msg = StageMessage::begin(Uuid::new_v4(), None, Priority::Normal);

    let first = queue.enqueue(&msg).await.unwrap();
    let again = queue.enqueue(&msg).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(queue.depth(Priority::Normal).await.unwrap(), 1);

    let task = queue.claim(Priority::Normal).await.unwrap().unwrap();
    assert!(queue.renew(task.id).await.unwrap());
    // Leased messages still count as live
    assert_eq!(queue.enqueue(&msg).await.unwrap(), task.id);

    queue.ack(task.id).await.unwrap();
    assert!(!queue.renew(task.id).await.unwrap());
    assert_ne!(queue.enqueue(&msg).await.unwrap(), task.id);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_cache_health_trip_reset_and_stale_keys() {
    let test_db = test_database().await;
    let store = &test_db.db.store;
    assert!(store.load_cache_health("docket").await.unwrap().is_none());

    let until = chrono::Utc::now() + chrono::Duration::minutes(5);
    let tripped = store.trip_cache_health("docket", until).await.unwrap();
    assert_eq!(tripped.generation, 1);
    assert!(tripped.is_disabled_at(chrono::Utc::now()));

    let reset = store.reset_cache_health("docket").await.unwrap();
    assert_eq!(reset.generation, 2);
    assert_eq!(reset.trips, 1);
    assert!(reset.disabled_until.is_none());

    let keys = vec!["docket:text:a".to_string(), "docket:state:a".to_string()];
    store.mark_cache_keys_stale("docket", &keys).await.unwrap();
    store.mark_cache_keys_stale("docket", &keys[..1]).await.unwrap();
    let mut taken = store.take_stale_cache_keys("docket").await.unwrap();
    taken.sort();
    assert_eq!(taken, vec!["docket:state:a".to_string(), "docket:text:a".to_string()]);
    assert!(store.take_stale_cache_keys("docket").await.unwrap().is_empty());

    test_db.cleanup().await;
}
