//! Data model shared by the pipeline crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ErrorKind};

// =============================================================================
// STAGES
// =============================================================================

/// One step of the fixed six-step document pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Segmentation,
    EntityExtraction,
    EntityResolution,
    RelationshipBuilding,
    Finalization,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 6] = [
        Stage::Extraction,
        Stage::Segmentation,
        Stage::EntityExtraction,
        Stage::EntityResolution,
        Stage::RelationshipBuilding,
        Stage::Finalization,
    ];

    /// The first stage of every document.
    pub fn first() -> Stage {
        Stage::Extraction
    }

    /// The stage enqueued after this one succeeds, if any.
    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    /// The stage whose success enqueues this one, if any.
    pub fn previous(self) -> Option<Stage> {
        self.index().checked_sub(1).map(|i| Stage::ALL[i])
    }

    /// Zero-based position in the pipeline.
    pub fn index(self) -> usize {
        match self {
            Stage::Extraction => 0,
            Stage::Segmentation => 1,
            Stage::EntityExtraction => 2,
            Stage::EntityResolution => 3,
            Stage::RelationshipBuilding => 4,
            Stage::Finalization => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Segmentation => "segmentation",
            Stage::EntityExtraction => "entity_extraction",
            Stage::EntityResolution => "entity_resolution",
            Stage::RelationshipBuilding => "relationship_building",
            Stage::Finalization => "finalization",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown stage: {s}")))
    }
}

// =============================================================================
// PRIORITY TIERS
// =============================================================================

/// Queue tier a document is processed on.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All tiers, highest first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(Error::Validation(format!("unknown priority tier: {other}"))),
        }
    }
}

// =============================================================================
// DOCUMENTS
// =============================================================================

/// Object storage location of a source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub bucket: String,
    pub key: String,
}

impl SourceLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Location of the n-th page-bounded part of this file.
    pub fn part(&self, index: usize) -> SourceLocation {
        SourceLocation {
            bucket: self.bucket.clone(),
            key: format!("{}.part-{:04}", self.key, index),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

impl FromStr for SourceLocation {
    type Err = Error;

    /// Accepts `s3://bucket/key` or `bucket/key`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let rest = trimmed
            .strip_prefix("s3://")
            .or_else(|| trimmed.strip_prefix("gs://"))
            .unwrap_or(trimmed);
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(SourceLocation::new(bucket, key))
            }
            _ => Err(Error::Validation(format!(
                "source location must be bucket/key, got '{s}'"
            ))),
        }
    }
}

/// Lifecycle status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(Error::Validation(format!("unknown document status: {other}"))),
        }
    }
}

/// A legal document moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub batch_id: Option<Uuid>,
    pub location: SourceLocation,
    pub size_bytes: Option<u64>,
    pub status: DocumentStatus,
    /// Stage most recently attempted.
    pub stage: Option<Stage>,
    pub extracted_text_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Intake request for a new document row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDocument {
    pub id: Uuid,
    pub batch_id: Option<Uuid>,
    pub location: SourceLocation,
    pub size_bytes: Option<u64>,
}

/// Ordered text segment of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: usize,
    /// Character offset (inclusive) into the extracted text.
    pub start_offset: usize,
    /// Character offset (exclusive) into the extracted text.
    pub end_offset: usize,
    pub text: String,
}

// =============================================================================
// ENTITIES
// =============================================================================

/// Named-entity class. Mentions of different types are never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Date,
    Money,
    Law,
    CaseNumber,
    Other,
}

impl EntityType {
    /// Map a label from the extraction service onto a type.
    ///
    /// Unknown labels become `Other` rather than failing the chunk.
    pub fn from_label(label: &str) -> EntityType {
        match label.trim().to_ascii_uppercase().as_str() {
            "PERSON" | "PER" | "PEOPLE" => EntityType::Person,
            "ORG" | "ORGANIZATION" | "ORGANISATION" | "COMPANY" => EntityType::Organization,
            "LOC" | "LOCATION" | "GPE" | "FAC" | "ADDRESS" => EntityType::Location,
            "DATE" | "TIME" => EntityType::Date,
            "MONEY" | "AMOUNT" => EntityType::Money,
            "LAW" | "STATUTE" | "REGULATION" => EntityType::Law,
            "CASE_NUMBER" | "CASE" | "DOCKET" => EntityType::CaseNumber,
            _ => EntityType::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Person => "PERSON",
            EntityType::Organization => "ORGANIZATION",
            EntityType::Location => "LOCATION",
            EntityType::Date => "DATE",
            EntityType::Money => "MONEY",
            EntityType::Law => "LAW",
            EntityType::CaseNumber => "CASE_NUMBER",
            EntityType::Other => "OTHER",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One occurrence of a named entity inside a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMention {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chunk_id: Uuid,
    pub text: String,
    pub entity_type: EntityType,
    /// Character span in document coordinates.
    pub start_offset: usize,
    pub end_offset: usize,
    /// Always on the 0..=1 scale.
    pub confidence: f32,
    pub canonical_id: Option<Uuid>,
}

/// Entity as returned by the extraction service, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntity {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(rename = "type", alias = "label", alias = "entity_type")]
    pub entity_type: String,
    pub start: usize,
    pub end: usize,
    #[serde(default, alias = "score")]
    pub confidence: Option<f64>,
}

/// Bring a confidence reported on either a 0-1 or a 0-100 scale onto 0-1.
pub fn normalize_confidence(raw: Option<f64>) -> f32 {
    match raw {
        None => 0.0,
        Some(v) if !v.is_finite() || v <= 0.0 => 0.0,
        Some(v) if v > 1.0 => (v / 100.0).min(1.0) as f32,
        Some(v) => v as f32,
    }
}

/// Deduplicated representative of one or more mentions in a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: Uuid,
    pub document_id: Uuid,
    pub name: String,
    pub entity_type: EntityType,
    pub member_count: usize,
}

/// Mention-to-entity assignment produced by resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionAssignment {
    pub mention_id: Uuid,
    pub canonical_id: Uuid,
}

/// Edge type in the document graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    /// Structural edge from a canonical entity to its document.
    MentionedIn,
    /// Two distinct canonical entities appear in the same chunk.
    CoOccursWith,
}

impl RelationshipType {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationshipType::MentionedIn => "MENTIONED_IN",
            RelationshipType::CoOccursWith => "CO_OCCURS_WITH",
        }
    }
}

impl FromStr for RelationshipType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MENTIONED_IN" => Ok(RelationshipType::MentionedIn),
            "CO_OCCURS_WITH" => Ok(RelationshipType::CoOccursWith),
            other => Err(Error::Validation(format!("unknown relationship type: {other}"))),
        }
    }
}

/// Directed, typed edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: Uuid,
    pub document_id: Uuid,
    pub source_entity_id: Uuid,
    /// A canonical entity, or the document itself for structural edges.
    pub target_entity_id: Uuid,
    pub relationship_type: RelationshipType,
    pub weight: u32,
}

// =============================================================================
// PROCESSING TASKS (AUDIT)
// =============================================================================

/// Outcome of one recorded stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
    /// Refused by the circuit breaker; no work was attempted.
    Rejected,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "rejected" => Ok(TaskStatus::Rejected),
            other => Err(Error::Validation(format!("unknown task status: {other}"))),
        }
    }
}

/// Audit record of one stage execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTask {
    pub id: Uuid,
    pub document_id: Uuid,
    pub stage: Stage,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
    /// Output of a succeeded attempt, kept so pipeline state can be rebuilt.
    pub output: Option<StageOutput>,
}

/// How a task record is closed.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub error: Option<String>,
    pub retry_count: u32,
    pub output: Option<StageOutput>,
}

impl TaskOutcome {
    pub fn succeeded(output: StageOutput, retry_count: u32) -> Self {
        Self {
            status: TaskStatus::Succeeded,
            error: None,
            retry_count,
            output: Some(output),
        }
    }

    pub fn failed(error: impl Into<String>, retry_count: u32) -> Self {
        Self {
            status: TaskStatus::Failed,
            error: Some(error.into()),
            retry_count,
            output: None,
        }
    }

    /// Attempt refused because the document's circuit is open.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Rejected,
            error: Some(error.into()),
            retry_count: 0,
            output: None,
        }
    }
}

// =============================================================================
// STAGE RESULTS
// =============================================================================

/// How the extraction stage obtained the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ExtractionMode {
    /// Read into memory.
    InMemory,
    /// Streamed to local disk first.
    Streamed,
    /// Split along page boundaries into independently processed parts.
    Split { parts: usize },
}

/// Typed summary of what a stage produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage")]
pub enum StageOutput {
    Extraction {
        characters: usize,
        pages: u32,
        mode: ExtractionMode,
        confidence: Option<f32>,
        /// Hex SHA-256 of the source bytes.
        source_sha256: String,
    },
    Segmentation {
        chunks: usize,
    },
    EntityExtraction {
        chunks_processed: usize,
        mentions: usize,
    },
    EntityResolution {
        mentions: usize,
        canonical_entities: usize,
        malformed: usize,
        dedup_ratio: f64,
    },
    RelationshipBuilding {
        relationships: usize,
    },
    Finalization {
        chunks: usize,
        mentions: usize,
        canonical_entities: usize,
        relationships: usize,
    },
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Extraction { .. } => Stage::Extraction,
            StageOutput::Segmentation { .. } => Stage::Segmentation,
            StageOutput::EntityExtraction { .. } => Stage::EntityExtraction,
            StageOutput::EntityResolution { .. } => Stage::EntityResolution,
            StageOutput::RelationshipBuilding { .. } => Stage::RelationshipBuilding,
            StageOutput::Finalization { .. } => Stage::Finalization,
        }
    }
}

/// Success or failure of one stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failure,
}

/// Error detail carried on a failed stage result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for StageFailure {
    fn from(e: &Error) -> Self {
        StageFailure {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Result of `execute(document_id)` for one stage.
///
/// Exactly one of `output` / `error` is set, matching `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub document_id: Uuid,
    pub stage: Stage,
    pub status: StageStatus,
    pub output: Option<StageOutput>,
    pub error: Option<StageFailure>,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

impl StageResult {
    pub fn success(document_id: Uuid, output: StageOutput, attempts: u32) -> Self {
        Self {
            document_id,
            stage: output.stage(),
            status: StageStatus::Success,
            output: Some(output),
            error: None,
            attempts,
        }
    }

    pub fn failure(document_id: Uuid, stage: Stage, error: &Error, attempts: u32) -> Self {
        Self {
            document_id,
            stage,
            status: StageStatus::Failure,
            output: None,
            error: Some(StageFailure::from(error)),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Success
    }

    /// True when the breaker refused the attempt without doing work.
    pub fn is_circuit_open(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|e| e.kind == ErrorKind::CircuitOpen)
    }
}

// =============================================================================
// PIPELINE STATE
// =============================================================================

/// Completion record of one stage in the pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub completed_at: DateTime<Utc>,
    pub output: StageOutput,
}

/// Per-document state snapshot. Cached for speed, mirrored durably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub document_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub status: DocumentStatus,
    /// Completed stages in pipeline order.
    pub completed: Vec<StageRecord>,
    pub last_error: Option<StageFailure>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(document_id: Uuid, batch_id: Option<Uuid>) -> Self {
        Self {
            document_id,
            batch_id,
            status: DocumentStatus::Pending,
            completed: Vec::new(),
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        self.completed.iter().any(|r| r.stage == stage)
    }

    /// The next stage that has not completed, in pipeline order.
    pub fn next_stage(&self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| !self.is_complete(*s))
    }

    /// Record a successful stage, replacing any earlier record for it.
    pub fn record_success(&mut self, output: StageOutput) {
        let stage = output.stage();
        self.completed.retain(|r| r.stage != stage);
        self.completed.push(StageRecord {
            stage,
            completed_at: Utc::now(),
            output,
        });
        self.completed.sort_by_key(|r| r.stage.index());
        self.last_error = None;
        self.status = if stage == Stage::Finalization {
            DocumentStatus::Completed
        } else {
            DocumentStatus::Processing
        };
        self.updated_at = Utc::now();
    }

    pub fn record_failure(&mut self, failure: StageFailure, terminal: bool) {
        self.last_error = Some(failure);
        if terminal {
            self.status = DocumentStatus::Failed;
        }
        self.updated_at = Utc::now();
    }

    pub fn output(&self, stage: Stage) -> Option<&StageOutput> {
        self.completed
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.output)
    }
}

// =============================================================================
// BATCHES
// =============================================================================

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    /// Every member document reached a terminal status.
    Completed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
        }
    }
}

impl FromStr for BatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(BatchStatus::Running),
            "completed" => Ok(BatchStatus::Completed),
            other => Err(Error::Validation(format!("unknown batch status: {other}"))),
        }
    }
}

/// Aggregate counters of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: u64,
}

impl BatchProgress {
    /// Tally a progress snapshot from member document statuses.
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = DocumentStatus>,
    {
        let mut progress = BatchProgress::default();
        for status in statuses {
            progress.total += 1;
            match status {
                DocumentStatus::Completed => progress.completed += 1,
                DocumentStatus::Failed => progress.failed += 1,
                DocumentStatus::Pending | DocumentStatus::Processing => progress.in_flight += 1,
            }
        }
        progress
    }

    pub fn is_terminal(&self) -> bool {
        self.total > 0 && self.in_flight == 0
    }
}

/// Named collection of documents submitted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub name: String,
    pub priority: Priority,
    pub status: BatchStatus,
    pub progress: BatchProgress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a batch row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBatch {
    pub id: Uuid,
    pub name: String,
    pub priority: Priority,
}

// =============================================================================
// CIRCUIT BREAKER STATE
// =============================================================================

/// Persisted per-document breaker counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub document_id: Uuid,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub open_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BreakerRecord {
    pub fn closed(document_id: Uuid) -> Self {
        Self {
            document_id,
            consecutive_failures: 0,
            opened_at: None,
            open_until: None,
            updated_at: Utc::now(),
        }
    }
}

/// Shared health record of a cache namespace.
///
/// Every worker using the namespace reads it, so one worker tripping the
/// cache breaker (or an operator resetting it) is seen by all of them.
/// `generation` increases on every trip and reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheHealthRecord {
    pub scope: String,
    pub generation: u64,
    pub disabled_until: Option<DateTime<Utc>>,
    pub trips: u64,
    pub updated_at: DateTime<Utc>,
}

impl CacheHealthRecord {
    pub fn healthy(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            generation: 0,
            disabled_until: None,
            trips: 0,
            updated_at: Utc::now(),
        }
    }

    /// Whether the record disables the cache at `now`.
    pub fn is_disabled_at(&self, now: DateTime<Utc>) -> bool {
        self.disabled_until.is_some_and(|until| now < until)
    }
}

/// Observable breaker state for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum BreakerState {
    Closed { failures: u32 },
    Open { until: DateTime<Utc> },
    /// Cooldown elapsed; the next attempt is let through as a trial.
    HalfOpen { failures: u32 },
}

// =============================================================================
// QUEUE MESSAGES
// =============================================================================

/// Typed payload of a queued stage task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMessage {
    pub document_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub stage: Stage,
    pub tier: Priority,
    /// Times this stage has been (re)submitted for the document; 0 on first run.
    #[serde(default)]
    pub attempt: u32,
}

impl StageMessage {
    pub fn begin(document_id: Uuid, batch_id: Option<Uuid>, tier: Priority) -> Self {
        Self {
            document_id,
            batch_id,
            stage: Stage::first(),
            tier,
            attempt: 0,
        }
    }

    /// Message for the stage after this one, if any.
    pub fn advance(&self) -> Option<StageMessage> {
        self.stage.next().map(|stage| StageMessage {
            stage,
            attempt: 0,
            ..self.clone()
        })
    }

    /// Resubmission of the same stage after an operator retry.
    pub fn resubmit(&self) -> StageMessage {
        StageMessage {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// A claimed queue message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: Uuid,
    pub message: StageMessage,
    /// How many times this message has been handed to a worker, this one included.
    pub deliveries: u32,
    pub claimed_at: DateTime<Utc>,
}
