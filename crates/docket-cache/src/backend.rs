//! Key/value backends behind the cache layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::Instant;
use tracing::info;

use docket_core::{Error, Result};

/// Raw byte store with per-key expiry.
///
/// Errors returned here are connectivity failures; the layer above counts
/// them toward its health breaker and never surfaces them to callers.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Redis backend over a multiplexed connection manager.
///
/// The manager reconnects on its own; every clone shares one connection.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
}

impl RedisBackend {
    /// Open a connection to `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Config(format!("invalid Redis URL: {e}")))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Cache(format!("Redis connect failed: {e}")))?;
        info!(
            subsystem = "cache",
            component = "redis",
            url = %redis_url.replace(|c: char| c.is_ascii_alphanumeric(), "*"),
            "Connected to Redis"
        );
        Ok(Self { connection })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| Error::Cache(format!("Redis GET failed: {e}")))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| Error::Cache(format!("Redis SET failed: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| Error::Cache(format!("Redis DEL failed: {e}")))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// In-process backend with expiry on read.
///
/// `set_failing(true)` makes every call fail like a dropped connection, which
/// is how tests drive the health breaker.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
    failing: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Drop every entry, as if the cache server restarted.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// Live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|(_, exp)| *exp > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Cache("connection refused".to_string()));
        }
        Ok(())
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (Vec<u8>, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Cache("memory backend lock poisoned".to_string()))
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        let mut entries = self.entries()?;
        match entries.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.check()?;
        self.entries()?
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.entries()?.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_backend_expires_entries() {
        let backend = MemoryBackend::new();
        backend
            .set("k", b"v".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_memory_backend_failing() {
        let backend = MemoryBackend::new();
        backend.set_failing(true);
        assert!(backend.get("k").await.is_err());
        backend.set_failing(false);
        assert!(backend.get("k").await.unwrap().is_none());
    }
}
