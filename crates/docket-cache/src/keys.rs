//! Cache key scheme: one namespaced key per document per artifact.

use std::fmt;

use uuid::Uuid;

use docket_core::defaults;

/// Per-document artifact held in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    ExtractedText,
    Chunks,
    Mentions,
    CanonicalEntities,
    ResolvedMentions,
    PipelineState,
}

impl Artifact {
    pub const ALL: [Artifact; 6] = [
        Artifact::ExtractedText,
        Artifact::Chunks,
        Artifact::Mentions,
        Artifact::CanonicalEntities,
        Artifact::ResolvedMentions,
        Artifact::PipelineState,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Artifact::ExtractedText => "text",
            Artifact::Chunks => "chunks",
            Artifact::Mentions => "mentions",
            Artifact::CanonicalEntities => "entities",
            Artifact::ResolvedMentions => "resolved",
            Artifact::PipelineState => "state",
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds `{prefix}:doc:{document_id}:{artifact}` keys.
#[derive(Debug, Clone)]
pub struct CacheKeys {
    prefix: String,
}

impl Default for CacheKeys {
    fn default() -> Self {
        Self::new(defaults::CACHE_KEY_PREFIX)
    }
}

impl CacheKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn artifact(&self, document_id: Uuid, artifact: Artifact) -> String {
        format!("{}:doc:{}:{}", self.prefix, document_id, artifact.as_str())
    }

    pub fn text(&self, document_id: Uuid) -> String {
        self.artifact(document_id, Artifact::ExtractedText)
    }

    pub fn chunks(&self, document_id: Uuid) -> String {
        self.artifact(document_id, Artifact::Chunks)
    }

    pub fn mentions(&self, document_id: Uuid) -> String {
        self.artifact(document_id, Artifact::Mentions)
    }

    pub fn entities(&self, document_id: Uuid) -> String {
        self.artifact(document_id, Artifact::CanonicalEntities)
    }

    pub fn resolved(&self, document_id: Uuid) -> String {
        self.artifact(document_id, Artifact::ResolvedMentions)
    }

    pub fn state(&self, document_id: Uuid) -> String {
        self.artifact(document_id, Artifact::PipelineState)
    }

    /// Every key held for a document.
    pub fn all(&self, document_id: Uuid) -> Vec<String> {
        Artifact::ALL
            .iter()
            .map(|a| self.artifact(document_id, *a))
            .collect()
    }
}
