//! Pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

use docket_core::{defaults, ResolverConfig};

use crate::breaker::BreakerConfig;
use crate::chunker::ChunkerConfig;
use crate::large_file::LargeFileConfig;
use crate::retry::RetryPolicy;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Settings shared by every stage execution.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    /// Ceiling for one stage attempt.
    pub stage_timeout: Duration,
    /// Ceiling for one entity-model call.
    pub ner_timeout: Duration,
    /// In-flight entity-model calls per document.
    pub ner_concurrency: usize,
    pub large_file: LargeFileConfig,
    pub chunking: ChunkerConfig,
    pub resolver: ResolverConfig,
    /// How often a worker renews the lease of the message it is handling.
    /// Must stay well below the queue's lease.
    pub lease_renew_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            stage_timeout: Duration::from_secs(defaults::STAGE_TIMEOUT_SECS),
            ner_timeout: Duration::from_secs(defaults::NER_TIMEOUT_SECS),
            ner_concurrency: defaults::NER_CONCURRENCY,
            large_file: LargeFileConfig::default(),
            chunking: ChunkerConfig::default(),
            resolver: ResolverConfig::default(),
            lease_renew_interval: Duration::from_secs(defaults::QUEUE_LEASE_RENEW_SECS),
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DOCKET_BREAKER_THRESHOLD` | `3` |
    /// | `DOCKET_BREAKER_COOLDOWN_SECS` | `300` |
    /// | `DOCKET_STAGE_MAX_RETRIES` | `3` |
    /// | `DOCKET_RETRY_INITIAL_BACKOFF_MS` | `500` |
    /// | `DOCKET_RETRY_MAX_BACKOFF_MS` | `30000` |
    /// | `DOCKET_STAGE_TIMEOUT_SECS` | `1800` |
    /// | `DOCKET_NER_TIMEOUT_SECS` | `60` |
    /// | `DOCKET_NER_CONCURRENCY` | `4` |
    /// | `DOCKET_WORKER_MEMORY_BUDGET_BYTES` | `400000000` |
    /// | `DOCKET_OCR_HARD_LIMIT_BYTES` | `500000000` |
    /// | `DOCKET_SPLIT_PART_BYTES` | memory budget |
    /// | `DOCKET_SCRATCH_DIR` | system temp dir |
    /// | `DOCKET_CHUNK_SIZE` | `1000` |
    /// | `DOCKET_CHUNK_MIN_SIZE` | `100` |
    /// | `DOCKET_RESOLVER_TOKEN_OVERLAP` | `0.75` |
    /// | `DOCKET_RESOLVER_MIN_CONTAINMENT_TOKENS` | `2` |
    /// | `DOCKET_QUEUE_LEASE_RENEW_SECS` | `300` |
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse("DOCKET_BREAKER_THRESHOLD") {
            config.breaker.threshold = n;
        }
        if let Some(secs) = env_parse("DOCKET_BREAKER_COOLDOWN_SECS") {
            config.breaker.cooldown = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse("DOCKET_STAGE_MAX_RETRIES") {
            config.retry.max_retries = n;
        }
        if let Some(ms) = env_parse("DOCKET_RETRY_INITIAL_BACKOFF_MS") {
            config.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("DOCKET_RETRY_MAX_BACKOFF_MS") {
            config.retry.max_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("DOCKET_STAGE_TIMEOUT_SECS") {
            config.stage_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("DOCKET_NER_TIMEOUT_SECS") {
            config.ner_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("DOCKET_NER_CONCURRENCY") {
            config.ner_concurrency = n.max(1);
        }
        if let Some(bytes) = env_parse("DOCKET_WORKER_MEMORY_BUDGET_BYTES") {
            config.large_file.memory_budget_bytes = bytes;
            config.large_file.part_target_bytes = bytes;
        }
        if let Some(bytes) = env_parse("DOCKET_OCR_HARD_LIMIT_BYTES") {
            config.large_file.hard_limit_bytes = bytes;
        }
        if let Some(bytes) = env_parse("DOCKET_SPLIT_PART_BYTES") {
            config.large_file.part_target_bytes = bytes;
        }
        if let Ok(dir) = std::env::var("DOCKET_SCRATCH_DIR") {
            if !dir.is_empty() {
                config.large_file.scratch_dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(n) = env_parse("DOCKET_CHUNK_SIZE") {
            config.chunking.target_size = n;
        }
        if let Some(n) = env_parse("DOCKET_CHUNK_MIN_SIZE") {
            config.chunking.min_size = n;
        }
        if let Some(ratio) = env_parse("DOCKET_RESOLVER_TOKEN_OVERLAP") {
            config.resolver = config.resolver.with_token_overlap(ratio);
        }
        if let Some(n) = env_parse("DOCKET_RESOLVER_MIN_CONTAINMENT_TOKENS") {
            config.resolver = config.resolver.with_min_containment_tokens(n);
        }
        if let Some(secs) = env_parse::<u64>("DOCKET_QUEUE_LEASE_RENEW_SECS") {
            config.lease_renew_interval = Duration::from_secs(secs.max(1));
        }
        config
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_lease_renew_interval(mut self, interval: Duration) -> Self {
        self.lease_renew_interval = interval;
        self
    }

    pub fn with_ner_concurrency(mut self, n: usize) -> Self {
        self.ner_concurrency = n.max(1);
        self
    }

    pub fn with_large_file(mut self, large_file: LargeFileConfig) -> Self {
        self.large_file = large_file;
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkerConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.breaker.threshold, 3);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(300));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.large_file.memory_budget_bytes, 400_000_000);
        assert_eq!(config.large_file.hard_limit_bytes, 500_000_000);
        assert_eq!(config.chunking.target_size, 1000);
    }

    #[test]
    fn test_builder_overrides() {
        let config = PipelineConfig::default()
            .with_stage_timeout(Duration::from_secs(5))
            .with_retry(RetryPolicy::none());
        assert_eq!(config.stage_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.max_retries, 0);
    }
}
