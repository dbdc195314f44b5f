//! End-to-end pipeline runs over the in-memory store, queue and cache.

mod common;

use docket_jobs::{
    BatchProgress, BatchRepository, ChunkRepository, DocumentRepository, DocumentStatus,
    EntityRepository, EntityType, RelationshipRepository, RelationshipType, Stage, StageOutput,
    TaskRepository, TaskStatus,
};
use uuid::Uuid;

use common::{Harness, DEPOSITION};

async fn output_of(h: &Harness, document_id: Uuid, stage: Stage) -> StageOutput {
    h.store
        .list_tasks(document_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.stage == stage && t.status == TaskStatus::Succeeded)
        .last()
        .and_then(|t| t.output)
        .expect("succeeded task with output")
}

#[tokio::test]
async fn single_document_runs_every_stage() {
    let h = Harness::new();
    let (batch_id, doc) = h.submit_one("depo-001.txt", DEPOSITION).await;

    h.drain().await;

    let document = h.document(doc).await;
    assert_eq!(document.status, DocumentStatus::Completed);
    assert_eq!(document.stage, Some(Stage::Finalization));

    // Task records follow pipeline order, one success per stage
    let stages: Vec<Stage> = h
        .store
        .list_tasks(doc)
        .await
        .unwrap()
        .iter()
        .map(|t| t.stage)
        .collect();
    assert_eq!(stages, Stage::ALL.to_vec());

    let text = h.store.load_extracted_text(doc).await.unwrap().unwrap();
    assert!(text.contains("Wombat Acquisitions, LLC"));
    assert_eq!(h.store.list_chunks(doc).await.unwrap().len(), 1);

    let entities = h.store.list_canonical_entities(doc).await.unwrap();
    assert_eq!(entities.len(), 2);
    let person = entities
        .iter()
        .find(|e| e.entity_type == EntityType::Person)
        .unwrap();
    assert_eq!(person.name, "Javier Hinojo");
    assert_eq!(person.member_count, 3);
    assert!(entities
        .iter()
        .any(|e| e.entity_type == EntityType::Organization));

    // Every mention ends up assigned to a canonical entity
    let mentions = h.store.list_mentions(doc).await.unwrap();
    assert_eq!(mentions.len(), 4);
    assert!(mentions.iter().all(|m| m.canonical_id.is_some()));
    assert!(mentions.iter().all(|m| (0.0..=1.0).contains(&m.confidence)));

    let relationships = h.store.list_relationships(doc).await.unwrap();
    let mentioned_in = relationships
        .iter()
        .filter(|r| r.relationship_type == RelationshipType::MentionedIn)
        .count();
    let co_occurs = relationships
        .iter()
        .filter(|r| r.relationship_type == RelationshipType::CoOccursWith)
        .count();
    assert_eq!(mentioned_in, 2);
    assert_eq!(co_occurs, 1);

    match output_of(&h, doc, Stage::Finalization).await {
        StageOutput::Finalization {
            chunks,
            mentions,
            canonical_entities,
            relationships,
        } => {
            assert_eq!((chunks, mentions, canonical_entities, relationships), (1, 4, 2, 3));
        }
        other => panic!("unexpected output: {other:?}"),
    }

    let progress = h.batches.get_batch_status(batch_id).await.unwrap();
    assert_eq!(
        progress,
        BatchProgress {
            total: 1,
            completed: 1,
            failed: 0,
            in_flight: 0
        }
    );
    assert_eq!(h.queue.pending(), 0);
}

#[tokio::test]
async fn malformed_mentions_are_dropped_from_resolution() {
    let h = Harness::with_options(common::HarnessOptions {
        ner: common::legal_ner().with_malformed("J. Hinojo"),
        ..Default::default()
    });
    let (_, doc) = h.submit_one("depo-002.txt", DEPOSITION).await;

    h.drain().await;

    assert_eq!(h.document(doc).await.status, DocumentStatus::Completed);
    match output_of(&h, doc, Stage::EntityResolution).await {
        StageOutput::EntityResolution {
            malformed,
            canonical_entities,
            ..
        } => {
            assert_eq!(malformed, 1);
            assert_eq!(canonical_entities, 2);
        }
        other => panic!("unexpected output: {other:?}"),
    }
    let person = h
        .store
        .list_canonical_entities(doc)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.entity_type == EntityType::Person)
        .unwrap();
    assert_eq!(person.member_count, 2);
}

#[tokio::test]
async fn stage_requested_out_of_order_is_not_attempted() {
    let h = Harness::new();
    let (_, doc) = h.submit_one("depo-003.txt", DEPOSITION).await;

    let result = h.runner.execute(doc, Stage::Segmentation).await.unwrap();

    assert!(!result.is_success());
    assert_eq!(result.attempts, 0);
    assert!(h.store.list_tasks(doc).await.unwrap().is_empty());
    assert!(h.store.list_chunks(doc).await.unwrap().is_empty());
}

#[tokio::test]
async fn rerunning_stages_does_not_duplicate_artifacts() {
    let h = Harness::new();
    let (_, doc) = h.submit_one("depo-004.txt", DEPOSITION).await;
    h.drain().await;

    let chunk_ids: Vec<Uuid> = h.store.list_chunks(doc).await.unwrap().iter().map(|c| c.id).collect();
    let mention_ids: Vec<Uuid> = h.store.list_mentions(doc).await.unwrap().iter().map(|m| m.id).collect();
    let entity_count = h.store.list_canonical_entities(doc).await.unwrap().len();
    let relationship_count = h.store.list_relationships(doc).await.unwrap().len();

    for stage in Stage::ALL.into_iter().skip(1) {
        let result = h.runner.execute(doc, stage).await.unwrap();
        assert!(result.is_success(), "{stage} failed on rerun: {:?}", result.error);
    }

    let rerun_chunks: Vec<Uuid> = h.store.list_chunks(doc).await.unwrap().iter().map(|c| c.id).collect();
    let rerun_mentions: Vec<Uuid> = h.store.list_mentions(doc).await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(rerun_chunks, chunk_ids);
    assert_eq!(rerun_mentions, mention_ids);
    assert_eq!(h.store.list_canonical_entities(doc).await.unwrap().len(), entity_count);
    assert_eq!(h.store.list_relationships(doc).await.unwrap().len(), relationship_count);
    assert_eq!(h.document(doc).await.status, DocumentStatus::Completed);
}

#[tokio::test]
async fn empty_source_fails_only_its_document() {
    let h = Harness::new();
    let good = h.put("depo-005.txt", DEPOSITION).await;
    let empty = h.put("blank.txt", "").await;

    let submitted = h
        .batches
        .submit(
            "mixed",
            [
                (good, docket_jobs::Priority::Normal),
                (empty, docket_jobs::Priority::Normal),
            ],
            None,
        )
        .await
        .unwrap();
    h.drain().await;

    let progress = h.batches.get_batch_status(submitted.batch_id).await.unwrap();
    assert_eq!((progress.total, progress.completed, progress.failed), (2, 1, 1));

    let failed = submitted.accepted[1];
    assert_eq!(h.document(failed).await.status, DocumentStatus::Failed);
    let error = h.batches.document_error(failed).await.unwrap().unwrap();
    assert_eq!(error.stage, Stage::Extraction);
    assert_eq!(error.status, TaskStatus::Failed);
    assert!(error.error.unwrap().contains("empty"));

    let batch = h.store.get_batch(submitted.batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, docket_jobs::BatchStatus::Completed);
}

#[tokio::test]
async fn exhausted_retries_fail_document_until_resubmitted() {
    let h = Harness::with_options(common::HarnessOptions {
        // First attempt and its single retry both fail
        ner: common::legal_ner().with_transient_failures(2),
        ..Default::default()
    });
    let (batch_id, doc) = h.submit_one("depo-006.txt", DEPOSITION).await;
    h.drain().await;

    let document = h.document(doc).await;
    assert_eq!(document.status, DocumentStatus::Failed);
    assert_eq!(document.stage, Some(Stage::EntityExtraction));
    let progress = h.batches.get_batch_status(batch_id).await.unwrap();
    assert_eq!((progress.completed, progress.failed), (0, 1));

    let message = h.batches.retry_document(doc).await.unwrap();
    assert_eq!(message.stage, Stage::EntityExtraction);
    assert_eq!(message.attempt, 2);
    h.drain().await;

    assert_eq!(h.document(doc).await.status, DocumentStatus::Completed);
    let progress = h.batches.get_batch_status(batch_id).await.unwrap();
    assert_eq!((progress.completed, progress.failed), (1, 0));

    // Completed documents cannot be retried
    assert!(h.batches.retry_document(doc).await.is_err());
}

#[tokio::test]
async fn resubmitting_a_location_is_a_no_op() {
    let h = Harness::new();
    let location = h.put("depo-007.txt", DEPOSITION).await;

    let first = h
        .batches
        .submit("dupes", [(location.clone(), docket_jobs::Priority::Low)], None)
        .await
        .unwrap();
    let second = h
        .batches
        .submit(
            "dupes",
            [(location, docket_jobs::Priority::Low)],
            Some(first.batch_id),
        )
        .await
        .unwrap();

    assert_eq!(second.batch_id, first.batch_id);
    assert!(second.accepted.is_empty());
    assert_eq!(second.duplicates, first.accepted);
    assert_eq!(second.progress.total, 1);
    assert_eq!(h.queue.pending(), 1);
}

#[tokio::test]
async fn batch_takes_its_highest_member_tier() {
    let h = Harness::new();
    let a = h.put("a.txt", DEPOSITION).await;
    let b = h.put("b.txt", DEPOSITION).await;

    let submitted = h
        .batches
        .submit(
            "urgent",
            [
                (a, docket_jobs::Priority::Low),
                (b, docket_jobs::Priority::High),
            ],
            None,
        )
        .await
        .unwrap();

    let batch = h.batches.batch(submitted.batch_id).await.unwrap();
    assert_eq!(batch.priority, docket_jobs::Priority::High);
    assert_eq!(batch.progress.in_flight, 2);
}

#[tokio::test]
async fn empty_new_batch_is_rejected() {
    let h = Harness::new();
    let none: Vec<docket_jobs::DocumentRef> = Vec::new();
    let err = h.batches.submit("empty", none, None).await.unwrap_err();
    assert!(matches!(err, docket_jobs::Error::Validation(_)));
}
