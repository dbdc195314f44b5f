//! Waiting for OCR jobs to finish.
//!
//! The engine can report completion through a callback or be polled. The
//! waiter listens for both and takes whichever answer arrives first, bounded
//! by an overall deadline.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use docket_core::{defaults, Error, OcrPoll, OcrService, OcrStatus, Result};

/// Registry routing completion callbacks to the task waiting on that job.
///
/// A completion that arrives before anyone waits is kept until it is claimed,
/// for at most `early_ttl` and at most `early_cap` at a time. Callbacks for
/// jobs whose wait already ended are dropped.
#[derive(Clone)]
pub struct OcrCallbacks {
    inner: Arc<Mutex<CallbackSlots>>,
    early_cap: usize,
    early_ttl: Duration,
}

#[derive(Default)]
struct CallbackSlots {
    waiting: HashMap<String, oneshot::Sender<OcrPoll>>,
    early: HashMap<String, (OcrPoll, Instant)>,
    finished: HashSet<String>,
    finished_order: VecDeque<String>,
}

impl CallbackSlots {
    fn prune_early(&mut self, ttl: Duration, cap: usize) {
        let now = Instant::now();
        self.early
            .retain(|_, (_, received)| now.duration_since(*received) < ttl);
        while self.early.len() >= cap.max(1) {
            let oldest = self
                .early
                .iter()
                .min_by_key(|(_, (_, received))| *received)
                .map(|(job_id, _)| job_id.clone());
            match oldest {
                Some(job_id) => {
                    self.early.remove(&job_id);
                }
                None => break,
            }
        }
    }

    fn mark_finished(&mut self, job_id: &str) {
        if !self.finished.insert(job_id.to_string()) {
            return;
        }
        self.finished_order.push_back(job_id.to_string());
        while self.finished_order.len() > defaults::OCR_FINISHED_JOB_MEMORY {
            if let Some(evicted) = self.finished_order.pop_front() {
                self.finished.remove(&evicted);
            }
        }
    }
}

impl Default for OcrCallbacks {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            early_cap: defaults::OCR_EARLY_CALLBACK_CAP,
            early_ttl: Duration::from_secs(defaults::OCR_TIMEOUT_SECS),
        }
    }
}

impl OcrCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_early_limits(mut self, cap: usize, ttl: Duration) -> Self {
        self.early_cap = cap.max(1);
        self.early_ttl = ttl;
        self
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, CallbackSlots> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver a completion for `job_id`. Returns true if a waiter received it.
    pub fn complete(&self, job_id: &str, result: OcrPoll) -> bool {
        let mut slots = self.slots();
        if let Some(tx) = slots.waiting.remove(job_id) {
            return tx.send(result).is_ok();
        }
        if slots.finished.contains(job_id) {
            debug!(
                subsystem = "services",
                component = "ocr_wait",
                ocr_job_id = job_id,
                "Dropping callback for a finished OCR wait"
            );
            return false;
        }
        slots.prune_early(self.early_ttl, self.early_cap);
        slots
            .early
            .insert(job_id.to_string(), (result, Instant::now()));
        false
    }

    fn register(&self, job_id: &str) -> oneshot::Receiver<OcrPoll> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots();
        slots.finished.remove(job_id);
        match slots.early.remove(job_id) {
            Some((result, received)) if received.elapsed() < self.early_ttl => {
                let _ = tx.send(result);
            }
            _ => {
                slots.waiting.insert(job_id.to_string(), tx);
            }
        }
        rx
    }

    fn forget(&self, job_id: &str) {
        let mut slots = self.slots();
        slots.waiting.remove(job_id);
        slots.mark_finished(job_id);
    }

    /// Jobs currently being waited on.
    pub fn pending(&self) -> usize {
        self.slots().waiting.len()
    }

    /// Completions held for jobs nobody has waited on yet.
    pub fn unclaimed(&self) -> usize {
        self.slots().early.len()
    }
}

#[derive(Debug, Clone)]
pub struct OcrWaitConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for OcrWaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(defaults::OCR_POLL_INTERVAL_MS),
            timeout: Duration::from_secs(defaults::OCR_TIMEOUT_SECS),
        }
    }
}

impl OcrWaitConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = std::env::var("DOCKET_OCR_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = std::env::var("DOCKET_OCR_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.timeout = Duration::from_secs(secs);
        }
        config
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Finished OCR output.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutcome {
    pub text: String,
    pub pages: u32,
    pub confidence: Option<f64>,
}

#[derive(Clone)]
pub struct OcrWaiter {
    service: Arc<dyn OcrService>,
    callbacks: OcrCallbacks,
    config: OcrWaitConfig,
}

impl OcrWaiter {
    pub fn new(service: Arc<dyn OcrService>, callbacks: OcrCallbacks, config: OcrWaitConfig) -> Self {
        Self {
            service,
            callbacks,
            config,
        }
    }

    pub fn service(&self) -> &Arc<dyn OcrService> {
        &self.service
    }

    /// Wait for `job_id` to reach a terminal status.
    ///
    /// Exceeding the deadline is a transient timeout; an engine-reported
    /// failure is a service error.
    pub async fn wait(&self, job_id: &str) -> Result<OcrOutcome> {
        let rx = self.callbacks.register(job_id);
        let result = tokio::time::timeout(self.config.timeout, self.race(job_id, rx)).await;
        self.callbacks.forget(job_id);

        match result {
            Ok(poll) => Self::finish(job_id, poll?),
            Err(_) => {
                warn!(
                    subsystem = "services",
                    component = "ocr_wait",
                    ocr_job_id = job_id,
                    timeout_secs = self.config.timeout.as_secs(),
                    "OCR job did not finish in time"
                );
                Err(Error::Timeout(format!(
                    "OCR job {job_id} exceeded {}s",
                    self.config.timeout.as_secs()
                )))
            }
        }
    }

    async fn race(&self, job_id: &str, mut rx: oneshot::Receiver<OcrPoll>) -> Result<OcrPoll> {
        let mut callback_open = true;
        loop {
            if callback_open {
                tokio::select! {
                    delivered = &mut rx => match delivered {
                        Ok(poll) if poll.status != OcrStatus::InProgress => {
                            debug!(subsystem = "services", component = "ocr_wait", ocr_job_id = job_id, "OCR completion via callback");
                            return Ok(poll);
                        }
                        // Progress notices and dropped senders fall back to polling
                        _ => callback_open = false,
                    },
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            } else {
                tokio::time::sleep(self.config.poll_interval).await;
            }

            let poll = match self.service.poll(job_id).await {
                Ok(poll) => poll,
                // Transient poll failures are retried until the deadline
                Err(e) if e.kind().is_retryable() => {
                    warn!(
                        subsystem = "services",
                        component = "ocr_wait",
                        ocr_job_id = job_id,
                        error = %e,
                        "OCR poll failed, retrying"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            if poll.status != OcrStatus::InProgress {
                debug!(subsystem = "services", component = "ocr_wait", ocr_job_id = job_id, "OCR completion via polling");
                return Ok(poll);
            }
        }
    }

    fn finish(job_id: &str, poll: OcrPoll) -> Result<OcrOutcome> {
        match poll.status {
            OcrStatus::Succeeded => {
                let text = poll.text.unwrap_or_default();
                let pages = poll.pages.unwrap_or_else(|| {
                    text.split(defaults::PAGE_BREAK).count() as u32
                });
                Ok(OcrOutcome {
                    text,
                    pages,
                    confidence: poll.confidence,
                })
            }
            OcrStatus::Failed => Err(Error::Service(format!(
                "OCR job {job_id} failed: {}",
                poll.error.unwrap_or_else(|| "no detail".to_string())
            ))),
            OcrStatus::InProgress => Err(Error::Internal(format!(
                "OCR job {job_id} returned without finishing"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docket_core::{ErrorKind, SourceLocation};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports in-progress until `ready_after` polls have been made. The
    /// first `failing` polls return a transient error instead.
    struct CountingOcr {
        polls: AtomicU32,
        ready_after: u32,
        failing: u32,
    }

    #[async_trait]
    impl OcrService for CountingOcr {
        async fn submit(&self, _location: &SourceLocation) -> Result<String> {
            Ok("job".to_string())
        }

        async fn poll(&self, _job_id: &str) -> Result<OcrPoll> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failing {
                Err(Error::Transient("ocr engine restarting".into()))
            } else if n >= self.ready_after {
                Ok(OcrPoll::succeeded("polled text", 1, Some(0.9)))
            } else {
                Ok(OcrPoll::in_progress())
            }
        }
    }

    fn waiter(ready_after: u32, callbacks: OcrCallbacks) -> (OcrWaiter, Arc<CountingOcr>) {
        flaky_waiter(ready_after, 0, callbacks)
    }

    fn flaky_waiter(
        ready_after: u32,
        failing: u32,
        callbacks: OcrCallbacks,
    ) -> (OcrWaiter, Arc<CountingOcr>) {
        let service = Arc::new(CountingOcr {
            polls: AtomicU32::new(0),
            ready_after,
            failing,
        });
        let config = OcrWaitConfig::default()
            .with_poll_interval(Duration::from_secs(2))
            .with_timeout(Duration::from_secs(60));
        (OcrWaiter::new(service.clone(), callbacks, config), service)
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_until_done() {
        let (waiter, service) = waiter(3, OcrCallbacks::new());
        let out = waiter.wait("job").await.unwrap();
        assert_eq!(out.text, "polled text");
        assert_eq!(service.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_beats_polling() {
        let callbacks = OcrCallbacks::new();
        let (waiter, service) = waiter(u32::MAX, callbacks.clone());

        let cb = callbacks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cb.complete("job", OcrPoll::succeeded("callback text", 2, None));
        });

        let out = waiter.wait("job").await.unwrap();
        assert_eq!(out.text, "callback text");
        assert_eq!(out.pages, 2);
        assert!(service.polls.load(Ordering::SeqCst) <= 3);
        assert_eq!(callbacks.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_callback_is_kept() {
        let callbacks = OcrCallbacks::new();
        assert!(!callbacks.complete("job", OcrPoll::succeeded("early", 1, None)));
        let (waiter, service) = waiter(u32::MAX, callbacks);
        assert_eq!(waiter.wait("job").await.unwrap().text, "early");
        assert_eq!(service.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_transient_timeout() {
        let (waiter, _) = waiter(u32::MAX, OcrCallbacks::new());
        let err = waiter.wait("job").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_failure_is_service_error() {
        let callbacks = OcrCallbacks::new();
        callbacks.complete("job", OcrPoll::failed("unreadable scan"));
        let (waiter, _) = waiter(u32::MAX, callbacks);
        let err = waiter.wait("job").await.unwrap_err();
        assert!(err.to_string().contains("unreadable scan"));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_poll_errors_keep_waiting() {
        let (waiter, service) = flaky_waiter(4, 2, OcrCallbacks::new());
        let out = waiter.wait("job").await.unwrap();
        assert_eq!(out.text, "polled text");
        assert_eq!(service.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_until_deadline_time_out() {
        let (waiter, _) = flaky_waiter(u32::MAX, u32::MAX, OcrCallbacks::new());
        let err = waiter.wait("job").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_callbacks_are_not_retained() {
        let callbacks = OcrCallbacks::new();
        let (waiter, _) = waiter(1, callbacks.clone());

        for n in 0..50 {
            let job_id = format!("job-{n}");
            waiter.wait(&job_id).await.unwrap();
            // The engine's callback lands after polling already finished
            assert!(!callbacks.complete(&job_id, OcrPoll::succeeded("late", 1, None)));
        }
        assert_eq!(callbacks.unclaimed(), 0);
        assert_eq!(callbacks.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_callbacks_are_capped_and_expire() {
        let callbacks = OcrCallbacks::new().with_early_limits(3, Duration::from_secs(60));
        for n in 0..10 {
            callbacks.complete(&format!("orphan-{n}"), OcrPoll::succeeded("x", 1, None));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(callbacks.unclaimed(), 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        callbacks.complete("fresh", OcrPoll::succeeded("y", 1, None));
        assert_eq!(callbacks.unclaimed(), 1);
    }
}
