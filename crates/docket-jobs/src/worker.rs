//! Tiered worker pool consuming stage messages.

use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use docket_core::{defaults, Priority, QueuedTask, Result};

use crate::events::PipelineEvent;
use crate::runner::StageRunner;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent messages on the high tier.
    pub high_workers: usize,
    /// Concurrent messages on the normal tier.
    pub normal_workers: usize,
    /// Concurrent messages on the low tier.
    pub low_workers: usize,
    /// Safety-net poll interval when no enqueue notification arrives.
    pub poll_interval: Duration,
    /// Whether to process messages at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            high_workers: defaults::WORKERS_HIGH,
            normal_workers: defaults::WORKERS_NORMAL,
            low_workers: defaults::WORKERS_LOW,
            poll_interval: Duration::from_millis(defaults::QUEUE_POLL_INTERVAL_MS),
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DOCKET_WORKER_ENABLED` | `true` | Enable/disable message processing |
    /// | `DOCKET_WORKERS_HIGH` | `8` | Concurrency of the high tier |
    /// | `DOCKET_WORKERS_NORMAL` | `4` | Concurrency of the normal tier |
    /// | `DOCKET_WORKERS_LOW` | `2` | Concurrency of the low tier |
    /// | `DOCKET_QUEUE_POLL_INTERVAL_MS` | `5000` | Poll interval when idle |
    pub fn from_env() -> Self {
        let enabled = std::env::var("DOCKET_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let workers = |name: &str, default: usize| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(default)
        };

        let poll_interval_ms = std::env::var("DOCKET_QUEUE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::QUEUE_POLL_INTERVAL_MS);

        Self {
            high_workers: workers("DOCKET_WORKERS_HIGH", defaults::WORKERS_HIGH),
            normal_workers: workers("DOCKET_WORKERS_NORMAL", defaults::WORKERS_NORMAL),
            low_workers: workers("DOCKET_WORKERS_LOW", defaults::WORKERS_LOW),
            poll_interval: Duration::from_millis(poll_interval_ms),
            enabled,
        }
    }

    pub fn with_workers(mut self, tier: Priority, n: usize) -> Self {
        match tier {
            Priority::High => self.high_workers = n,
            Priority::Normal => self.normal_workers = n,
            Priority::Low => self.low_workers = n,
        }
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn workers_for(&self, tier: Priority) -> usize {
        match tier {
            Priority::High => self.high_workers,
            Priority::Normal => self.normal_workers,
            Priority::Low => self.low_workers,
        }
    }
}

/// Handle for controlling a running pool.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    event_rx: broadcast::Receiver<PipelineEvent>,
    tiers: JoinSet<()>,
}

impl WorkerHandle {
    /// Stop claiming, let in-flight messages finish, and wait for every tier.
    pub async fn shutdown(mut self) -> Result<()> {
        // Never fails, even when every tier already exited
        self.shutdown_tx.send_replace(true);
        while let Some(joined) = self.tiers.join_next().await {
            if let Err(e) = joined {
                error!(subsystem = "jobs", component = "worker", error = ?e, "Tier loop panicked");
            }
        }
        Ok(())
    }

    /// Get a receiver for pipeline events.
    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_rx.resubscribe()
    }
}

/// One claim loop per tier, each bounded by the tier's concurrency.
///
/// Tiers never share slots, so a flood of low-priority documents cannot
/// delay high-priority ones.
pub struct PipelineWorker {
    runner: StageRunner,
    config: WorkerConfig,
}

impl PipelineWorker {
    pub fn new(runner: StageRunner, config: WorkerConfig) -> Self {
        Self { runner, config }
    }

    /// Start every tier and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let event_rx = self.runner.context().events.subscribe();
        let mut tiers = JoinSet::new();

        if !self.config.enabled {
            info!(subsystem = "jobs", component = "worker", "Pipeline worker is disabled, not starting");
        } else {
            for tier in Priority::ALL {
                let slots = self.config.workers_for(tier);
                if slots == 0 {
                    continue;
                }
                let loop_ = TierLoop {
                    tier,
                    slots,
                    poll_interval: self.config.poll_interval,
                    runner: self.runner.clone(),
                };
                let shutdown = shutdown_rx.clone();
                tiers.spawn(async move { loop_.run(shutdown).await });
            }
        }

        WorkerHandle {
            shutdown_tx,
            event_rx,
            tiers,
        }
    }
}

struct TierLoop {
    tier: Priority,
    slots: usize,
    poll_interval: Duration,
    runner: StageRunner,
}

impl TierLoop {
    async fn claim(&self) -> Option<QueuedTask> {
        match self.runner.context().queue.claim(self.tier).await {
            Ok(task) => task,
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    tier = %self.tier,
                    error = %e,
                    "Failed to claim stage message"
                );
                None
            }
        }
    }

    #[instrument(skip_all, fields(tier = %self.tier))]
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let ctx = self.runner.context();
        let notify = ctx.queue.notifier();
        info!(
            subsystem = "jobs",
            component = "worker",
            slots = self.slots,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Tier worker started"
        );
        ctx.events.emit(PipelineEvent::WorkerStarted { tier: self.tier });

        let mut in_flight = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }

            // Register interest before claiming so an enqueue in between is not lost
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut claimed = 0;
            while in_flight.len() < self.slots {
                let Some(task) = self.claim().await else { break };
                claimed += 1;
                let runner = self.runner.clone();
                in_flight.spawn(async move { runner.handle(task).await });
            }
            if claimed > 0 {
                debug!(
                    subsystem = "jobs",
                    component = "worker",
                    claimed,
                    in_flight = in_flight.len(),
                    "Claimed stage messages"
                );
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped handle stops the pool as well
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(subsystem = "jobs", component = "worker", error = ?e, "Stage task panicked");
                    }
                }
                _ = &mut notified, if in_flight.len() < self.slots => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            in_flight = in_flight.len(),
            "Tier worker draining"
        );
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(subsystem = "jobs", component = "worker", error = ?e, "Stage task panicked");
            }
        }
        ctx.events.emit(PipelineEvent::WorkerStopped { tier: self.tier });
        info!(subsystem = "jobs", component = "worker", "Tier worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workers_per_tier() {
        let config = WorkerConfig::default()
            .with_workers(Priority::Low, 1)
            .with_poll_interval(Duration::from_millis(10));
        assert_eq!(config.workers_for(Priority::High), defaults::WORKERS_HIGH);
        assert_eq!(config.workers_for(Priority::Normal), defaults::WORKERS_NORMAL);
        assert_eq!(config.workers_for(Priority::Low), 1);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }
}
