//! Structured logging field name constants for docket.
//!
//! All crates use these names so log aggregation can query by the same
//! fields across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events, stage and document completions |
//! | DEBUG | Decision points, cache hits/misses, config choices |
//! | TRACE | Per-item iteration (chunks, mentions) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "cache", "db", "queue", "services", "jobs", "batch"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "redis", "breaker", "runner", "worker", "resolver"
pub const COMPONENT: &str = "component";

/// Logical operation name.
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Document UUID being processed.
pub const DOCUMENT_ID: &str = "document_id";

/// Batch UUID the document belongs to.
pub const BATCH_ID: &str = "batch_id";

/// Pipeline stage name.
pub const STAGE: &str = "stage";

/// Priority tier of the queue.
pub const TIER: &str = "tier";

/// Queue message UUID.
pub const TASK_ID: &str = "task_id";

/// Cache key.
pub const CACHE_KEY: &str = "cache_key";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Attempt number within a stage (1-based).
pub const ATTEMPT: &str = "attempt";

/// Object size in bytes.
pub const SIZE_BYTES: &str = "size_bytes";

/// Number of chunks produced or read.
pub const CHUNK_COUNT: &str = "chunk_count";

/// Number of entity mentions.
pub const MENTION_COUNT: &str = "mention_count";

/// Number of canonical entities.
pub const ENTITY_COUNT: &str = "entity_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Error class (`transient`, `validation`, ...).
pub const ERROR_KIND: &str = "error_kind";
