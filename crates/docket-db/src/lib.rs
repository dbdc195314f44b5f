//! # docket-db
//!
//! Durable store and task queue for the docket pipeline.
//!
//! This crate provides:
//! - Connection pool sizing and occupancy logging
//! - `PgStore`, the PostgreSQL implementation of every repository trait
//! - `PgTaskQueue`, a tiered stage queue claimed with `FOR UPDATE SKIP LOCKED`
//! - `MemoryStore` / `MemoryTaskQueue` for tests and single-process runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use docket_db::Database;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/docket").await?;
//!     let progress = db.store.batch_progress(batch_id).await?;
//!     println!("{progress:?}");
//!     Ok(())
//! }
//! ```

pub mod batches;
pub mod breakers;
pub mod cache_health;
pub mod chunks;
pub mod documents;
pub mod entities;
pub mod memory;
pub mod pool;
pub mod queue;
pub mod relationships;
pub mod state;
pub mod tasks;
pub mod test_fixtures;

use std::sync::Arc;

use sqlx::{Pool, Postgres};
use tokio::sync::Notify;

// Re-export core types
pub use docket_core::*;

pub use memory::{MemoryStore, MemoryTaskQueue};
pub use pool::{connect_pool, log_pool_metrics, spawn_pool_monitor, PoolConfig};
pub use queue::PgTaskQueue;

/// PostgreSQL implementation of [`DurableStore`].
///
/// Each repository trait lives in its own module; they all share this pool.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

/// Combined database context: store plus queue over one pool.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: Pool<Postgres>,
    /// Durable store.
    pub store: PgStore,
    /// Stage task queue.
    pub queue: PgTaskQueue,
}

impl Database {
    /// Create a new Database from a connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self::with_notify(pool, Arc::new(Notify::new()))
    }

    /// Create a Database whose queue signals an existing notify handle.
    pub fn with_notify(pool: Pool<Postgres>, notify: Arc<Notify>) -> Self {
        Self {
            store: PgStore::new(pool.clone()),
            queue: PgTaskQueue::with_notify(pool.clone(), notify),
            pool,
        }
    }

    /// Connect with default pool settings.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with_config(database_url, PoolConfig::default()).await
    }

    /// Connect with custom pool settings.
    pub async fn connect_with_config(database_url: &str, config: PoolConfig) -> Result<Self> {
        let pool = connect_pool(database_url, &config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Store as a shareable trait object.
    pub fn durable_store(&self) -> Arc<dyn DurableStore> {
        Arc::new(self.store.clone())
    }

    /// Queue as a shareable trait object.
    pub fn task_queue(&self) -> Arc<dyn TaskQueue> {
        Arc::new(self.queue.clone())
    }
}

/// Convert a usize offset or count to its column type.
pub(crate) fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Convert a non-negative column value back to usize.
pub(crate) fn to_usize(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

pub(crate) fn to_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
