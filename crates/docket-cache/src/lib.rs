//! Cache acceleration for the docket pipeline.
//!
//! The cache is never authoritative. Stages read through it and fall back to
//! the durable store on any miss, error or cooldown.

pub mod backend;
pub mod config;
pub mod health;
pub mod keys;
pub mod layer;

pub use backend::{CacheBackend, MemoryBackend, RedisBackend};
pub use config::CacheConfig;
pub use health::CacheHealth;
pub use keys::{Artifact, CacheKeys};
pub use layer::{CacheLayer, CacheStats, SetOutcome, SkipReason};
