//! Self-healing health breaker for the cache layer.
//!
//! After `threshold` consecutive connectivity failures the cache is disabled
//! for `cooldown`. Once the cooldown elapses operations are attempted again;
//! one success resets the counter, one more failure disables it again.
//!
//! This is the in-process view. When the layer has a shared health store,
//! every trip and reset is written there and the layer feeds the shared
//! record back in through [`CacheHealth::adopt`], so all workers agree.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{info, warn};

use docket_core::CacheHealthRecord;

#[derive(Debug)]
pub struct CacheHealth {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    disabled_until: Mutex<Option<Instant>>,
    trips: AtomicU64,
    /// Generation of the last shared record applied.
    generation: AtomicU64,
}

impl CacheHealth {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: AtomicU32::new(0),
            disabled_until: Mutex::new(None),
            trips: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// False while the cooldown window is running.
    pub fn is_healthy(&self) -> bool {
        match self.disabled_until.lock() {
            Ok(guard) => guard.map_or(true, |until| Instant::now() >= until),
            Err(_) => false,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Times the breaker has tripped since start.
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if let Ok(mut guard) = self.disabled_until.lock() {
            if guard.take().is_some() {
                info!(
                    subsystem = "cache",
                    component = "health",
                    "Cache recovered, re-enabled"
                );
            }
        }
    }

    /// Count a failure. Returns true when this failure tripped the breaker.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < self.threshold {
            return false;
        }
        if let Ok(mut guard) = self.disabled_until.lock() {
            *guard = Some(Instant::now() + self.cooldown);
        }
        self.trips.fetch_add(1, Ordering::SeqCst);
        warn!(
            subsystem = "cache",
            component = "health",
            consecutive_failures = failures,
            cooldown_secs = self.cooldown.as_secs(),
            "Cache disabled after repeated failures, falling back to durable store"
        );
        true
    }

    /// Operator reset: clear the counter and re-enable immediately.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if let Ok(mut guard) = self.disabled_until.lock() {
            *guard = None;
        }
    }

    /// Apply a shared record newer than the last one seen.
    ///
    /// Returns false for a record of an older or equal generation, which
    /// leaves the local state untouched.
    pub fn adopt(&self, record: &CacheHealthRecord) -> bool {
        let seen = self.generation.fetch_max(record.generation, Ordering::SeqCst);
        if record.generation <= seen {
            return false;
        }

        let remaining = record
            .disabled_until
            .and_then(|until| (until - Utc::now()).to_std().ok())
            .filter(|left| !left.is_zero());
        if let Ok(mut guard) = self.disabled_until.lock() {
            *guard = remaining.map(|left| Instant::now() + left);
        }
        if remaining.is_none() {
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }
        true
    }
}
