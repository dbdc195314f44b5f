//! Cache layer configuration.
//!
//! Environment variables:
//! - `REDIS_ENABLED`: set to "false" or "0" to run without a cache (default: true)
//! - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
//! - `DOCKET_CACHE_TTL_SECS`: default artifact TTL (default: 86400)
//! - `DOCKET_CACHE_MAX_VALUE_BYTES`: values above this are skipped (default: 4 MiB)
//! - `DOCKET_CACHE_FAILURE_THRESHOLD`: failures before self-disable (default: 5)
//! - `DOCKET_CACHE_COOLDOWN_SECS`: self-disable window (default: 300)
//! - `DOCKET_CACHE_OP_TIMEOUT_MS`: per-operation ceiling (default: 250)
//! - `DOCKET_CACHE_HEALTH_SYNC_MS`: shared health re-read interval (default: 5000)

use std::collections::HashMap;
use std::time::Duration;

use docket_core::defaults;

use crate::keys::Artifact;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub redis_url: String,
    pub key_prefix: String,
    pub default_ttl: Duration,
    /// Per-artifact TTL overrides.
    pub artifact_ttls: HashMap<Artifact, Duration>,
    pub max_value_bytes: usize,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub op_timeout: Duration,
    /// How often the shared health record is re-read.
    pub health_sync: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: defaults::REDIS_URL.to_string(),
            key_prefix: defaults::CACHE_KEY_PREFIX.to_string(),
            default_ttl: Duration::from_secs(defaults::CACHE_TTL_SECS),
            artifact_ttls: HashMap::new(),
            max_value_bytes: defaults::CACHE_MAX_VALUE_BYTES,
            failure_threshold: defaults::CACHE_FAILURE_THRESHOLD,
            cooldown: Duration::from_secs(defaults::CACHE_COOLDOWN_SECS),
            op_timeout: Duration::from_millis(defaults::CACHE_OP_TIMEOUT_MS),
            health_sync: Duration::from_millis(defaults::CACHE_HEALTH_SYNC_MS),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.enabled = std::env::var("REDIS_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(secs) = env_parse::<u64>("DOCKET_CACHE_TTL_SECS") {
            config.default_ttl = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_parse("DOCKET_CACHE_MAX_VALUE_BYTES") {
            config.max_value_bytes = bytes;
        }
        if let Some(n) = env_parse("DOCKET_CACHE_FAILURE_THRESHOLD") {
            config.failure_threshold = n;
        }
        if let Some(secs) = env_parse::<u64>("DOCKET_CACHE_COOLDOWN_SECS") {
            config.cooldown = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("DOCKET_CACHE_OP_TIMEOUT_MS") {
            config.op_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("DOCKET_CACHE_HEALTH_SYNC_MS") {
            config.health_sync = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_artifact_ttl(mut self, artifact: Artifact, ttl: Duration) -> Self {
        self.artifact_ttls.insert(artifact, ttl);
        self
    }

    pub fn with_max_value_bytes(mut self, bytes: usize) -> Self {
        self.max_value_bytes = bytes;
        self
    }

    pub fn with_failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn with_health_sync(mut self, interval: Duration) -> Self {
        self.health_sync = interval;
        self
    }

    /// TTL for an artifact: its override, else the default.
    pub fn ttl_for(&self, artifact: Artifact) -> Duration {
        self.artifact_ttls
            .get(&artifact)
            .copied()
            .unwrap_or(self.default_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl, Duration::from_secs(86_400));
        assert_eq!(config.max_value_bytes, 4 * 1024 * 1024);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown, Duration::from_secs(300));
    }

    #[test]
    fn test_artifact_ttl_override() {
        let config = CacheConfig::default()
            .with_artifact_ttl(Artifact::PipelineState, Duration::from_secs(60));
        assert_eq!(
            config.ttl_for(Artifact::PipelineState),
            Duration::from_secs(60)
        );
        assert_eq!(config.ttl_for(Artifact::Chunks), config.default_ttl);
    }
}
