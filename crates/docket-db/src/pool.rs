//! Connection pool sizing and monitoring for the durable store.
//!
//! Every stage worker holds at most one connection while it runs, and the
//! claim loops, lease renewals and batch tracker need a few more. The pool is
//! sized from the worker counts so a fully busy worker never starves its own
//! queue acknowledgements.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use docket_core::{Error, Result};

/// Connections reserved on top of the stage workers.
pub const POOL_HEADROOM: u32 = 4;

/// Maximum connections when nothing else is known.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;

/// Seconds to wait for a free connection before a stage write fails.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from the environment.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `DOCKET_DB_MAX_CONNECTIONS` | 20 |
    /// | `DOCKET_DB_MIN_CONNECTIONS` | 1 |
    /// | `DOCKET_DB_ACQUIRE_TIMEOUT_SECS` | 30 |
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let var = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok());
        if let Some(n) = var("DOCKET_DB_MAX_CONNECTIONS") {
            config.max_connections = u32::try_from(n).unwrap_or(u32::MAX).max(1);
        }
        if let Some(n) = var("DOCKET_DB_MIN_CONNECTIONS") {
            config.min_connections = u32::try_from(n).unwrap_or(u32::MAX);
        }
        if let Some(secs) = var("DOCKET_DB_ACQUIRE_TIMEOUT_SECS") {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        config
    }

    /// Raise the ceiling so `workers` concurrent stages plus headroom fit.
    pub fn sized_for_workers(mut self, workers: usize) -> Self {
        let needed = u32::try_from(workers)
            .unwrap_or(u32::MAX)
            .saturating_add(POOL_HEADROOM);
        if needed > self.max_connections {
            debug!(
                subsystem = "db",
                component = "pool",
                configured = self.max_connections,
                needed,
                "Raising pool size to cover stage workers"
            );
            self.max_connections = needed;
        }
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }
}

/// Open a pool with `config`.
pub async fn connect_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        max_connections = config.max_connections,
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Durable store pool established"
    );
    Ok(pool)
}

/// Log pool occupancy. Returns true when every connection is busy.
pub fn log_pool_metrics(pool: &PgPool) -> bool {
    let size = pool.size();
    let idle = u32::try_from(pool.num_idle()).unwrap_or(u32::MAX);
    let saturated = size > 0 && idle == 0;

    debug!(
        subsystem = "db",
        component = "pool",
        pool_size = size,
        pool_idle = idle,
        "Pool occupancy"
    );
    if saturated {
        warn!(
            subsystem = "db",
            component = "pool",
            pool_size = size,
            "No idle connections, stage writes are queueing for the pool"
        );
    }
    saturated
}

/// Log pool occupancy every `every` until the handle is aborted.
pub fn spawn_pool_monitor(pool: PgPool, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if pool.is_closed() {
                break;
            }
            log_pool_metrics(&pool);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sized_for_workers_adds_headroom() {
        let config = PoolConfig::new().max_connections(5).sized_for_workers(14);
        assert_eq!(config.max_connections, 14 + POOL_HEADROOM);

        // A larger configured pool is left alone
        let config = PoolConfig::new().sized_for_workers(2);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn test_single_connection_pool_clamps_minimum() {
        let config = PoolConfig {
            min_connections: 8,
            ..PoolConfig::default()
        }
        .max_connections(1);
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.min_connections, 1);
    }
}
