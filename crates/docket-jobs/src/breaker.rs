//! Per-document circuit breaker.
//!
//! Counters live in the durable store so every worker sees the same state and
//! a restart does not forget an open circuit. Each failed attempt increments
//! the document's counter; at the threshold the circuit opens for the
//! cooldown. After the cooldown one trial attempt is let through (half-open);
//! success closes the circuit, failure reopens it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use docket_core::{defaults, BreakerRecord, BreakerState, DurableStore, Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: defaults::BREAKER_FAILURE_THRESHOLD,
            cooldown: Duration::from_secs(defaults::BREAKER_COOLDOWN_SECS),
        }
    }
}

impl BreakerConfig {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
        }
    }
}

#[derive(Clone)]
pub struct DocumentBreaker {
    store: Arc<dyn DurableStore>,
    config: BreakerConfig,
}

fn state_at(record: &BreakerRecord, now: DateTime<Utc>) -> BreakerState {
    match record.open_until {
        Some(until) if now < until => BreakerState::Open { until },
        Some(_) => BreakerState::HalfOpen {
            failures: record.consecutive_failures,
        },
        None => BreakerState::Closed {
            failures: record.consecutive_failures,
        },
    }
}

impl DocumentBreaker {
    pub fn new(store: Arc<dyn DurableStore>, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub async fn state(&self, document_id: Uuid) -> Result<BreakerState> {
        Ok(match self.store.load_breaker(document_id).await? {
            Some(record) => state_at(&record, Utc::now()),
            None => BreakerState::Closed { failures: 0 },
        })
    }

    /// Fail with [`Error::CircuitOpen`] while the circuit is open.
    pub async fn check(&self, document_id: Uuid) -> Result<()> {
        match self.state(document_id).await? {
            BreakerState::Open { .. } => Err(Error::CircuitOpen(document_id)),
            BreakerState::Closed { .. } | BreakerState::HalfOpen { .. } => Ok(()),
        }
    }

    /// A successful attempt closes the circuit and zeroes the counter.
    pub async fn record_success(&self, document_id: Uuid) -> Result<()> {
        if let Some(record) = self.store.load_breaker(document_id).await? {
            if record.open_until.is_some() {
                info!(
                    subsystem = "jobs",
                    component = "breaker",
                    document_id = %document_id,
                    "Document circuit closed after successful trial attempt"
                );
            }
            self.store.delete_breaker(document_id).await?;
        }
        Ok(())
    }

    /// Count a failed attempt and return the resulting state.
    pub async fn record_failure(&self, document_id: Uuid) -> Result<BreakerState> {
        let now = Utc::now();
        let mut record = self
            .store
            .load_breaker(document_id)
            .await?
            .unwrap_or_else(|| BreakerRecord::closed(document_id));

        record.consecutive_failures += 1;
        record.updated_at = now;
        if record.consecutive_failures >= self.config.threshold {
            let cooldown = chrono::Duration::from_std(self.config.cooldown)
                .map_err(|e| Error::Config(format!("invalid breaker cooldown: {e}")))?;
            record.opened_at = Some(now);
            record.open_until = Some(now + cooldown);
            warn!(
                subsystem = "jobs",
                component = "breaker",
                document_id = %document_id,
                failures = record.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Document circuit opened"
            );
        }
        self.store.save_breaker(&record).await?;
        Ok(state_at(&record, now))
    }

    /// Operator reset: close the circuit immediately.
    pub async fn reset(&self, document_id: Uuid) -> Result<()> {
        self.store.delete_breaker(document_id).await?;
        info!(
            subsystem = "jobs",
            component = "breaker",
            document_id = %document_id,
            "Document circuit reset by operator"
        );
        Ok(())
    }
}
