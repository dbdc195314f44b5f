//! The cache layer: size-capped, time-bounded, never authoritative.
//!
//! Every read and write goes through the health breaker and an operation
//! timeout. A cache failure is logged and reported as a miss or a skip; it is
//! never returned to the caller.
//!
//! A key that cannot be overwritten or removed (the backend is failing or the
//! breaker is cooling down) is remembered as stale and removed before the
//! layer serves reads again. With a shared health store attached, trips,
//! resets and stale keys are visible to every worker on the namespace.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use docket_core::{CacheHealthRepository, Result};

use crate::backend::{CacheBackend, RedisBackend};
use crate::config::CacheConfig;
use crate::health::CacheHealth;
use crate::keys::{Artifact, CacheKeys};

/// Outcome of [`CacheLayer::set`]. A skip must be treated like a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Stored,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Serialized value is above the configured byte cap.
    TooLarge,
    /// Cache disabled by configuration or not connected.
    Disabled,
    /// Health breaker is in its cooldown window.
    Unhealthy,
    /// Backend failed or timed out.
    BackendError,
    /// Value could not be serialized.
    Serialization,
}

/// Counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
}

/// Cache acceleration layer.
#[derive(Clone)]
pub struct CacheLayer {
    inner: Arc<CacheLayerInner>,
}

struct CacheLayerInner {
    backend: Option<Arc<dyn CacheBackend>>,
    config: CacheConfig,
    keys: CacheKeys,
    health: CacheHealth,
    counters: Counters,
    health_store: OnceLock<Arc<dyn CacheHealthRepository>>,
    /// Keys whose removal has not reached the backend yet.
    stale: Mutex<HashSet<String>>,
    last_sync: Mutex<Option<Instant>>,
    was_healthy: AtomicBool,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        let backend = config.enabled.then_some(backend);
        Self::build(backend, config)
    }

    /// A cache that never stores anything; every read is a miss.
    pub fn disabled() -> Self {
        Self::build(None, CacheConfig::default().with_enabled(false))
    }

    /// Build from environment configuration, connecting to Redis if enabled.
    ///
    /// A failed initial connection yields a disabled cache; the pipeline runs
    /// on the durable store alone.
    pub async fn from_env() -> Self {
        Self::connect(CacheConfig::from_env()).await
    }

    pub async fn connect(config: CacheConfig) -> Self {
        if !config.enabled {
            info!(
                subsystem = "cache",
                component = "layer",
                "Cache disabled via REDIS_ENABLED=false"
            );
            return Self::build(None, config);
        }
        match RedisBackend::connect(&config.redis_url).await {
            Ok(backend) => {
                info!(
                    subsystem = "cache",
                    component = "layer",
                    ttl_secs = config.default_ttl.as_secs(),
                    max_value_bytes = config.max_value_bytes,
                    "Cache layer enabled"
                );
                Self::build(Some(Arc::new(backend)), config)
            }
            Err(e) => {
                warn!(
                    subsystem = "cache",
                    component = "layer",
                    error = %e,
                    "Failed to connect to Redis, cache disabled"
                );
                Self::build(None, config)
            }
        }
    }

    fn build(backend: Option<Arc<dyn CacheBackend>>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheLayerInner {
                backend,
                keys: CacheKeys::new(config.key_prefix.clone()),
                health: CacheHealth::new(config.failure_threshold, config.cooldown),
                counters: Counters::default(),
                health_store: OnceLock::new(),
                stale: Mutex::new(HashSet::new()),
                last_sync: Mutex::new(None),
                was_healthy: AtomicBool::new(true),
                config,
            }),
        }
    }

    /// Share breaker trips, resets and stale keys through `store`.
    pub fn with_health_store(self, store: Arc<dyn CacheHealthRepository>) -> Self {
        if self.inner.health_store.set(store).is_err() {
            warn!(
                subsystem = "cache",
                component = "layer",
                "Cache health store already attached, keeping the first"
            );
        }
        self
    }

    fn scope(&self) -> &str {
        &self.inner.config.key_prefix
    }

    pub fn keys(&self) -> &CacheKeys {
        &self.inner.keys
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn ttl_for(&self, artifact: Artifact) -> Duration {
        self.inner.config.ttl_for(artifact)
    }

    /// Whether a backend is configured at all.
    pub fn is_enabled(&self) -> bool {
        self.inner.backend.is_some()
    }

    /// False when disabled or inside the health cooldown window.
    pub fn is_healthy(&self) -> bool {
        self.inner.backend.is_some() && self.inner.health.is_healthy()
    }

    /// Clear the health breaker without waiting for the cooldown, for every
    /// worker sharing the health store.
    pub async fn reset_health(&self) {
        self.inner.health.reset();
        if let Some(store) = self.inner.health_store.get() {
            match store.reset_cache_health(self.scope()).await {
                Ok(record) => {
                    self.inner.health.adopt(&record);
                }
                Err(e) => warn!(
                    subsystem = "cache",
                    component = "layer",
                    error = %e,
                    "Failed to share cache health reset"
                ),
            }
        }
        info!(subsystem = "cache", component = "layer", "Cache health reset");
    }

    /// Keys waiting to be removed from the backend.
    pub fn stale_keys(&self) -> usize {
        self.inner.stale.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
        }
    }

    fn usable_backend(&self) -> Option<&Arc<dyn CacheBackend>> {
        let backend = self.inner.backend.as_ref()?;
        self.inner.health.is_healthy().then_some(backend)
    }

    /// Run one backend call under the op timeout and feed the health breaker.
    async fn guarded<T, F>(&self, op: &'static str, key: &str, call: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.inner.config.op_timeout, call).await {
            Ok(Ok(value)) => {
                self.inner.health.record_success();
                Some(value)
            }
            Ok(Err(e)) => {
                self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.on_failure().await;
                warn!(
                    subsystem = "cache",
                    component = "layer",
                    op,
                    cache_key = key,
                    error = %e,
                    "Cache operation failed"
                );
                None
            }
            Err(_) => {
                self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.on_failure().await;
                warn!(
                    subsystem = "cache",
                    component = "layer",
                    op,
                    cache_key = key,
                    timeout_ms = self.inner.config.op_timeout.as_millis() as u64,
                    "Cache operation timed out"
                );
                None
            }
        }
    }

    async fn on_failure(&self) {
        if !self.inner.health.record_failure() {
            return;
        }
        self.inner.was_healthy.store(false, Ordering::SeqCst);
        let Some(store) = self.inner.health_store.get() else {
            return;
        };
        let cooldown = chrono::Duration::from_std(self.inner.health.cooldown())
            .unwrap_or_else(|_| chrono::Duration::zero());
        match store.trip_cache_health(self.scope(), Utc::now() + cooldown).await {
            Ok(record) => {
                self.inner.health.adopt(&record);
            }
            Err(e) => warn!(
                subsystem = "cache",
                component = "layer",
                error = %e,
                "Failed to share cache health trip"
            ),
        }
    }

    /// Bring the health view up to date and drop stale keys once usable.
    ///
    /// The shared record is re-read every `health_sync`, and right away when
    /// this layer sees its own cooldown end.
    async fn prepare(&self) {
        if self.inner.backend.is_none() {
            return;
        }
        let healthy = self.inner.health.is_healthy();
        let recovered = healthy && !self.inner.was_healthy.swap(healthy, Ordering::SeqCst);

        let mut synced = false;
        if let Some(store) = self.inner.health_store.get() {
            if recovered || self.sync_due() {
                synced = true;
                match store.load_cache_health(self.scope()).await {
                    Ok(Some(record)) => {
                        if self.inner.health.adopt(&record) {
                            debug!(
                                subsystem = "cache",
                                component = "layer",
                                generation = record.generation,
                                "Adopted shared cache health"
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!(
                        subsystem = "cache",
                        component = "layer",
                        error = %e,
                        "Shared cache health unavailable"
                    ),
                }
            }
        }

        if !self.inner.health.is_healthy() {
            self.inner.was_healthy.store(false, Ordering::SeqCst);
            return;
        }
        self.flush_stale(synced).await;
    }

    fn sync_due(&self) -> bool {
        let Ok(mut last) = self.inner.last_sync.lock() else {
            return false;
        };
        let now = Instant::now();
        if last.is_some_and(|at| now.duration_since(at) < self.inner.config.health_sync) {
            return false;
        }
        *last = Some(now);
        true
    }

    fn is_stale(&self, key: &str) -> bool {
        self.inner.stale.lock().map_or(true, |s| s.contains(key))
    }

    fn forget_stale(&self, key: &str) {
        if let Ok(mut stale) = self.inner.stale.lock() {
            stale.remove(key);
        }
    }

    async fn mark_stale(&self, keys: Vec<String>) {
        if let Ok(mut stale) = self.inner.stale.lock() {
            stale.extend(keys.iter().cloned());
        }
        if let Some(store) = self.inner.health_store.get() {
            if let Err(e) = store.mark_cache_keys_stale(self.scope(), &keys).await {
                warn!(
                    subsystem = "cache",
                    component = "layer",
                    error = %e,
                    stale_keys = keys.len(),
                    "Failed to share stale cache keys"
                );
            }
        }
    }

    async fn flush_stale(&self, include_shared: bool) {
        let mut keys: Vec<String> = match self.inner.stale.lock() {
            Ok(mut stale) => stale.drain().collect(),
            Err(_) => Vec::new(),
        };
        if include_shared {
            if let Some(store) = self.inner.health_store.get() {
                match store.take_stale_cache_keys(self.scope()).await {
                    Ok(shared) => keys.extend(shared),
                    Err(e) => debug!(
                        subsystem = "cache",
                        component = "layer",
                        error = %e,
                        "Shared stale keys unavailable"
                    ),
                }
            }
        }
        if keys.is_empty() {
            return;
        }
        keys.sort();
        keys.dedup();

        let Some(backend) = self.inner.backend.as_ref() else {
            return;
        };
        let total = keys.len();
        let mut failed = Vec::new();
        for key in keys {
            if self.guarded("delete", &key, backend.delete(&key)).await.is_none() {
                failed.push(key);
            }
        }
        debug!(
            subsystem = "cache",
            component = "layer",
            removed = total - failed.len(),
            deferred = failed.len(),
            "Stale cache keys flushed"
        );
        if !failed.is_empty() {
            self.mark_stale(failed).await;
        }
    }

    /// Store a value. Oversized values and cache failures are skipped.
    ///
    /// A skipped write also removes the key (now or once the cache is usable
    /// again), so an older value is never read back in its place.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> SetOutcome {
        self.prepare().await;
        let outcome = self.set_inner(key, value, ttl).await;
        let SetOutcome::Skipped(reason) = outcome else {
            self.forget_stale(key);
            return outcome;
        };
        self.inner.counters.skipped.fetch_add(1, Ordering::Relaxed);
        debug!(
            subsystem = "cache",
            component = "layer",
            cache_key = key,
            reason = ?reason,
            "Cache SET skipped"
        );
        if reason != SkipReason::Disabled {
            self.delete(key).await;
        }
        outcome
    }

    async fn set_inner<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> SetOutcome {
        let Some(backend) = self.inner.backend.as_ref() else {
            return SetOutcome::Skipped(SkipReason::Disabled);
        };
        if !self.inner.health.is_healthy() {
            return SetOutcome::Skipped(SkipReason::Unhealthy);
        }
        let bytes = match serde_json::to_vec(value) {
            Ok(b) => b,
            Err(e) => {
                warn!(
                    subsystem = "cache",
                    component = "layer",
                    cache_key = key,
                    error = %e,
                    "Cache serialization error"
                );
                return SetOutcome::Skipped(SkipReason::Serialization);
            }
        };
        if bytes.len() > self.inner.config.max_value_bytes {
            debug!(
                subsystem = "cache",
                component = "layer",
                cache_key = key,
                size_bytes = bytes.len() as u64,
                max_value_bytes = self.inner.config.max_value_bytes as u64,
                "Value above cache size cap"
            );
            return SetOutcome::Skipped(SkipReason::TooLarge);
        }
        match self.guarded("set", key, backend.set(key, bytes, ttl)).await {
            Some(()) => SetOutcome::Stored,
            None => SetOutcome::Skipped(SkipReason::BackendError),
        }
    }

    /// Read a value. Any failure is a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.prepare().await;
        let Some(backend) = self.usable_backend().filter(|_| !self.is_stale(key)) else {
            self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let found = self.guarded("get", key, backend.get(key)).await.flatten();
        let Some(bytes) = found else {
            self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(subsystem = "cache", component = "layer", cache_key = key, "Cache MISS");
            return None;
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(subsystem = "cache", component = "layer", cache_key = key, "Cache HIT");
                Some(value)
            }
            Err(e) => {
                // A stale layout from an older writer; treat as a miss.
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subsystem = "cache",
                    component = "layer",
                    cache_key = key,
                    error = %e,
                    "Cache deserialization error"
                );
                None
            }
        }
    }

    /// Read through the cache, falling back to `fallback` on any miss.
    ///
    /// The fallback's result is written back with `ttl`. Only the fallback's
    /// own errors are returned.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, ttl: Duration, fallback: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.get::<T>(key).await {
            return Ok(hit);
        }
        let value = fallback().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    /// Remove a key. If the backend cannot be reached the key is marked
    /// stale and removed once the cache is usable again.
    pub async fn delete(&self, key: &str) {
        if self.inner.backend.is_none() {
            return;
        }
        self.prepare().await;
        let removed = match self.usable_backend() {
            Some(backend) => self.guarded("delete", key, backend.delete(key)).await.is_some(),
            None => false,
        };
        if removed {
            self.forget_stale(key);
        } else {
            debug!(
                subsystem = "cache",
                component = "layer",
                cache_key = key,
                "Cache DELETE deferred until the cache is usable"
            );
            self.mark_stale(vec![key.to_string()]).await;
        }
    }

    /// Remove every artifact cached for a document.
    pub async fn invalidate_document(&self, document_id: uuid::Uuid) {
        for key in self.inner.keys.all(document_id) {
            self.delete(&key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use docket_core::Error;

    fn layer_with(backend: Arc<MemoryBackend>, config: CacheConfig) -> CacheLayer {
        CacheLayer::new(backend, config)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = layer_with(backend, CacheConfig::default());
        let outcome = cache
            .set("k", &vec![1u32, 2, 3], Duration::from_secs(60))
            .await;
        assert_eq!(outcome, SetOutcome::Stored);
        assert_eq!(cache.get::<Vec<u32>>("k").await, Some(vec![1, 2, 3]));
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_oversized_value_is_skipped_not_error() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = layer_with(
            backend.clone(),
            CacheConfig::default().with_max_value_bytes(16),
        );
        let big = "x".repeat(64);
        let outcome = cache.set("big", &big, Duration::from_secs(60)).await;
        assert_eq!(outcome, SetOutcome::Skipped(SkipReason::TooLarge));
        assert!(cache.get::<String>("big").await.is_none());
        assert!(backend.is_empty());
        // A skip is not a connectivity failure
        assert!(cache.is_healthy());
    }

    #[tokio::test]
    async fn test_disabled_cache_always_misses() {
        let cache = CacheLayer::disabled();
        assert!(!cache.is_enabled());
        assert!(!cache.is_healthy());
        assert_eq!(
            cache.set("k", &1, Duration::from_secs(1)).await,
            SetOutcome::Skipped(SkipReason::Disabled)
        );
        assert_eq!(cache.get::<i32>("k").await, None);
    }

    #[tokio::test]
    async fn test_get_or_compute_falls_back_and_populates() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = layer_with(backend, CacheConfig::default());

        let v: String = cache
            .get_or_compute("t", Duration::from_secs(60), || async {
                Ok("from store".to_string())
            })
            .await
            .unwrap();
        assert_eq!(v, "from store");

        let v: String = cache
            .get_or_compute("t", Duration::from_secs(60), || async {
                Err(Error::Internal("fallback must not run on a hit".into()))
            })
            .await
            .unwrap();
        assert_eq!(v, "from store");
    }

    #[tokio::test]
    async fn test_get_or_compute_swallows_cache_errors() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_failing(true);
        let cache = layer_with(backend, CacheConfig::default());

        let v: u64 = cache
            .get_or_compute("n", Duration::from_secs(60), || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(v, 42);
        assert!(cache.stats().errors >= 1);
    }

    #[tokio::test]
    async fn test_get_or_compute_propagates_fallback_error() {
        let cache = layer_with(Arc::new(MemoryBackend::new()), CacheConfig::default());
        let err = cache
            .get_or_compute::<u64, _, _>("n", Duration::from_secs(60), || async {
                Err(Error::DocumentNotFound(uuid::Uuid::nil()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DocumentNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_trips_and_self_heals() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = layer_with(
            backend.clone(),
            CacheConfig::default()
                .with_failure_threshold(5)
                .with_cooldown(Duration::from_secs(300)),
        );

        backend.set_failing(true);
        for _ in 0..5 {
            assert!(cache.get::<u32>("k").await.is_none());
        }
        assert!(!cache.is_healthy());

        // Inside the cooldown the backend is not touched at all
        backend.set_failing(false);
        assert_eq!(
            cache.set("k", &1u32, Duration::from_secs(60)).await,
            SetOutcome::Skipped(SkipReason::Unhealthy)
        );

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.is_healthy());
        assert_eq!(
            cache.set("k", &1u32, Duration::from_secs(60)).await,
            SetOutcome::Stored
        );
        assert_eq!(cache.get::<u32>("k").await, Some(1));
    }

    #[tokio::test]
    async fn test_reset_health() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = layer_with(
            backend.clone(),
            CacheConfig::default().with_failure_threshold(1),
        );
        backend.set_failing(true);
        cache.get::<u32>("k").await;
        assert!(!cache.is_healthy());
        cache.reset_health().await;
        assert!(cache.is_healthy());
    }

    #[tokio::test]
    async fn test_invalidate_document() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = layer_with(backend.clone(), CacheConfig::default());
        let doc = uuid::Uuid::new_v4();
        let ttl = Duration::from_secs(60);
        cache.set(&cache.keys().text(doc), "hello", ttl).await;
        cache.set(&cache.keys().chunks(doc), &Vec::<u8>::new(), ttl).await;
        assert_eq!(backend.len(), 2);

        cache.invalidate_document(doc).await;
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_skipped_during_cooldown_never_serves_older_value() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = layer_with(
            backend.clone(),
            CacheConfig::default()
                .with_failure_threshold(1)
                .with_cooldown(Duration::from_secs(60)),
        );
        let ttl = Duration::from_secs(600);
        cache.set("text", "v1", ttl).await;

        backend.set_failing(true);
        assert!(cache.get::<String>("text").await.is_none());
        assert!(!cache.is_healthy());
        backend.set_failing(false);

        assert_eq!(
            cache.set("text", "v2", ttl).await,
            SetOutcome::Skipped(SkipReason::Unhealthy)
        );
        cache.delete("text").await;
        assert_eq!(cache.stale_keys(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get::<String>("text").await, None);
        assert_eq!(cache.stale_keys(), 0);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_is_retried_before_next_read() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = layer_with(backend.clone(), CacheConfig::default());
        let ttl = Duration::from_secs(600);
        cache.set("chunks", &vec![1u8], ttl).await;

        backend.set_failing(true);
        cache.delete("chunks").await;
        assert_eq!(cache.stale_keys(), 1);
        backend.set_failing(false);

        assert_eq!(cache.get::<Vec<u8>>("chunks").await, None);
        assert_eq!(cache.stale_keys(), 0);
        assert_eq!(
            cache.set("chunks", &vec![2u8], ttl).await,
            SetOutcome::Stored
        );
        assert_eq!(cache.get::<Vec<u8>>("chunks").await, Some(vec![2]));
    }
}
