use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use docket_core::{
    relationship_id, CanonicalEntity, Document, EntityMention, Relationship, RelationshipType,
    Result, Stage, StageOutput,
};

use super::{read_entities, read_resolved_mentions, StageExecutor};
use crate::context::PipelineContext;

/// Builds the document graph from resolved mentions.
pub struct RelationshipStage;

/// Structural and co-occurrence edges of one document.
///
/// Every canonical entity gets a `MENTIONED_IN` edge to the document,
/// weighted by its member count. Each unordered pair of distinct entities
/// that share at least one chunk gets one `CO_OCCURS_WITH` edge, weighted by
/// the number of shared chunks. Co-occurrence edges point from the entity
/// that appears first to the one that appears later, so the output is stable
/// for a fixed input.
pub fn build_relationships(
    document_id: Uuid,
    entities: &[CanonicalEntity],
    mentions: &[EntityMention],
) -> Vec<Relationship> {
    let order: HashMap<Uuid, usize> = entities
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id, i))
        .collect();

    let mut edges: Vec<Relationship> = entities
        .iter()
        .map(|e| Relationship {
            id: relationship_id(
                document_id,
                e.id,
                document_id,
                RelationshipType::MentionedIn.as_str(),
            ),
            document_id,
            source_entity_id: e.id,
            target_entity_id: document_id,
            relationship_type: RelationshipType::MentionedIn,
            weight: u32::try_from(e.member_count).unwrap_or(u32::MAX),
        })
        .collect();

    // chunk -> entity positions present in it
    let mut by_chunk: BTreeMap<Uuid, BTreeSet<usize>> = BTreeMap::new();
    for mention in mentions {
        if let Some(pos) = mention.canonical_id.and_then(|id| order.get(&id)) {
            by_chunk.entry(mention.chunk_id).or_default().insert(*pos);
        }
    }

    let mut shared: BTreeMap<(usize, usize), u32> = BTreeMap::new();
    for present in by_chunk.values() {
        let present: Vec<usize> = present.iter().copied().collect();
        for (i, &a) in present.iter().enumerate() {
            for &b in &present[i + 1..] {
                *shared.entry((a, b)).or_default() += 1;
            }
        }
    }

    edges.extend(shared.into_iter().map(|((a, b), weight)| {
        let (source, target) = (entities[a].id, entities[b].id);
        Relationship {
            id: relationship_id(
                document_id,
                source,
                target,
                RelationshipType::CoOccursWith.as_str(),
            ),
            document_id,
            source_entity_id: source,
            target_entity_id: target,
            relationship_type: RelationshipType::CoOccursWith,
            weight,
        }
    }));
    edges
}

#[async_trait]
impl StageExecutor for RelationshipStage {
    fn stage(&self) -> Stage {
        Stage::RelationshipBuilding
    }

    async fn execute(&self, ctx: &PipelineContext, document: &Document) -> Result<StageOutput> {
        let entities = read_entities(ctx, document.id).await?;
        let mentions = read_resolved_mentions(ctx, document.id).await?;

        let relationships = build_relationships(document.id, &entities, &mentions);
        ctx.store
            .replace_relationships(document.id, &relationships)
            .await?;

        info!(
            subsystem = "jobs",
            component = "relationships",
            document_id = %document.id,
            entity_count = entities.len(),
            relationships = relationships.len(),
            "Relationships built"
        );
        Ok(StageOutput::RelationshipBuilding {
            relationships: relationships.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::{chunk_id, EntityType};

    fn entity(doc: Uuid, name: &str, members: usize) -> CanonicalEntity {
        CanonicalEntity {
            id: Uuid::new_v4(),
            document_id: doc,
            name: name.into(),
            entity_type: EntityType::Person,
            member_count: members,
        }
    }

    fn mention(doc: Uuid, chunk: usize, canonical: &CanonicalEntity) -> EntityMention {
        EntityMention {
            id: Uuid::new_v4(),
            document_id: doc,
            chunk_id: chunk_id(doc, chunk),
            text: canonical.name.clone(),
            entity_type: canonical.entity_type,
            start_offset: 0,
            end_offset: canonical.name.len(),
            confidence: 0.9,
            canonical_id: Some(canonical.id),
        }
    }

    #[test]
    fn test_edges_and_weights() {
        let doc = Uuid::new_v4();
        let a = entity(doc, "Javier Hinojo", 3);
        let b = entity(doc, "Wombat Acquisitions", 2);
        let c = entity(doc, "Joseph Ott", 1);
        let mentions = vec![
            mention(doc, 0, &a),
            mention(doc, 0, &b),
            mention(doc, 0, &a),
            mention(doc, 1, &a),
            mention(doc, 1, &b),
            mention(doc, 2, &c),
        ];
        let entities = vec![a.clone(), b.clone(), c.clone()];
        let edges = build_relationships(doc, &entities, &mentions);

        let structural: Vec<_> = edges
            .iter()
            .filter(|e| e.relationship_type == RelationshipType::MentionedIn)
            .collect();
        assert_eq!(structural.len(), 3);
        assert!(structural.iter().all(|e| e.target_entity_id == doc));
        assert_eq!(structural[0].weight, 3);

        let co: Vec<_> = edges
            .iter()
            .filter(|e| e.relationship_type == RelationshipType::CoOccursWith)
            .collect();
        assert_eq!(co.len(), 1);
        assert_eq!(co[0].source_entity_id, a.id);
        assert_eq!(co[0].target_entity_id, b.id);
        assert_eq!(co[0].weight, 2);

        assert_eq!(edges, build_relationships(doc, &entities, &mentions));
    }

    #[test]
    fn test_unresolved_mentions_are_ignored() {
        let doc = Uuid::new_v4();
        let a = entity(doc, "A", 1);
        let mut stray = mention(doc, 0, &a);
        stray.canonical_id = None;
        let edges = build_relationships(doc, &[a.clone()], &[mention(doc, 0, &a), stray]);
        assert_eq!(edges.len(), 1);
    }
}
