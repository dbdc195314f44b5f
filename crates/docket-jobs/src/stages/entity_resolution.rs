use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{info, warn};

use docket_cache::Artifact;
use docket_core::{Document, EntityMention, Result, Stage, StageOutput};

use super::{publish, read_mentions, StageExecutor};
use crate::context::PipelineContext;

/// Canonicalizes the document's mentions and stores entities plus the
/// mention-to-entity assignments.
///
/// A document without mentions resolves to zero entities; that is a valid
/// outcome, not a failed precondition.
pub struct EntityResolutionStage;

#[async_trait]
impl StageExecutor for EntityResolutionStage {
    fn stage(&self) -> Stage {
        Stage::EntityResolution
    }

    async fn execute(&self, ctx: &PipelineContext, document: &Document) -> Result<StageOutput> {
        let mentions = read_mentions(ctx, document.id).await?;
        let resolution = ctx.resolver.resolve(document.id, &mentions);
        if !resolution.malformed.is_empty() {
            warn!(
                subsystem = "jobs",
                component = "entity_resolution",
                document_id = %document.id,
                malformed = resolution.malformed.len(),
                "Malformed mentions excluded from resolution"
            );
        }

        ctx.store
            .replace_canonical_entities(document.id, &resolution.entities, &resolution.assignments)
            .await?;

        let canonical: HashMap<_, _> = resolution
            .assignments
            .iter()
            .map(|a| (a.mention_id, a.canonical_id))
            .collect();
        let resolved: Vec<EntityMention> = mentions
            .into_iter()
            .map(|m| EntityMention {
                canonical_id: canonical.get(&m.id).copied(),
                ..m
            })
            .collect();

        publish(
            ctx,
            &ctx.cache.keys().entities(document.id),
            Artifact::CanonicalEntities,
            &resolution.entities,
        )
        .await;
        publish(
            ctx,
            &ctx.cache.keys().resolved(document.id),
            Artifact::ResolvedMentions,
            &resolved,
        )
        .await;

        info!(
            subsystem = "jobs",
            component = "entity_resolution",
            document_id = %document.id,
            mention_count = resolution.mention_count(),
            entity_count = resolution.entities.len(),
            dedup_ratio = resolution.dedup_ratio(),
            "Entities resolved"
        );
        Ok(StageOutput::EntityResolution {
            mentions: resolution.mention_count(),
            canonical_entities: resolution.entities.len(),
            malformed: resolution.malformed.len(),
            dedup_ratio: resolution.dedup_ratio(),
        })
    }
}
