//! Deterministic stand-ins for the OCR engine and the entity model.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let ocr = MockOcrService::new(store.clone())
//!     .with_polls_before_ready(2)
//!     .with_max_object_bytes(1_000_000);
//! let ner = MockEntityService::new()
//!     .with_entity("Javier Hinojo", "PERSON")
//!     .with_entity("Wombat Acquisitions, LLC", "ORG");
//! ```
//!
//! The mock OCR engine "reads" an object by decoding it as UTF-8 and treating
//! form feeds as page breaks, so synthetic multi-page fixtures can be built
//! from plain strings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use docket_core::{
    defaults, EntityExtractionService, Error, ObjectStore, OcrPoll, OcrService, RawEntity,
    Result, SourceLocation,
};

use crate::ocr_wait::OcrCallbacks;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Text the mock engine produces for a document body.
///
/// Pages are trimmed and empty pages dropped, so splitting a file after any
/// page break does not change the joined result.
pub fn mock_ocr_text(bytes: &[u8]) -> (String, u32) {
    let decoded = String::from_utf8_lossy(bytes);
    let pages: Vec<&str> = decoded
        .split(defaults::PAGE_BREAK)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    (pages.join(&defaults::PAGE_BREAK.to_string()), pages.len() as u32)
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub operation: String,
    pub input: String,
}

struct MockJob {
    result: OcrPoll,
    remaining_polls: u32,
}

#[derive(Clone)]
pub struct MockOcrService {
    store: Arc<dyn ObjectStore>,
    config: Arc<OcrMockConfig>,
    jobs: Arc<Mutex<HashMap<String, MockJob>>>,
    call_log: Arc<Mutex<Vec<MockCall>>>,
    next_job: Arc<AtomicU64>,
}

#[derive(Clone, Default)]
struct OcrMockConfig {
    polls_before_ready: u32,
    confidence: Option<f64>,
    max_object_bytes: Option<u64>,
    failing_keys: Vec<String>,
    callbacks: Option<OcrCallbacks>,
}

impl MockOcrService {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            config: Arc::new(OcrMockConfig::default()),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            call_log: Arc::new(Mutex::new(Vec::new())),
            next_job: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Number of in-progress answers before a job reports its result.
    pub fn with_polls_before_ready(mut self, polls: u32) -> Self {
        Arc::make_mut(&mut self.config).polls_before_ready = polls;
        self
    }

    /// Confidence reported on success (0-100 scale is passed through as is).
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        Arc::make_mut(&mut self.config).confidence = Some(confidence);
        self
    }

    /// Reject objects above this size on submit, like the real engine's limit.
    pub fn with_max_object_bytes(mut self, bytes: u64) -> Self {
        Arc::make_mut(&mut self.config).max_object_bytes = Some(bytes);
        self
    }

    /// Jobs for keys containing `pattern` finish with a failure.
    pub fn failing_on(mut self, pattern: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).failing_keys.push(pattern.into());
        self
    }

    /// Deliver results through completion callbacks as soon as they are ready.
    pub fn with_callbacks(mut self, callbacks: OcrCallbacks) -> Self {
        Arc::make_mut(&mut self.config).callbacks = Some(callbacks);
        self
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        lock(&self.call_log).clone()
    }

    /// Keys submitted so far, in order.
    pub fn submitted(&self) -> Vec<String> {
        lock(&self.call_log)
            .iter()
            .filter(|c| c.operation == "submit")
            .map(|c| c.input.clone())
            .collect()
    }

    fn log_call(&self, operation: &str, input: &str) {
        lock(&self.call_log).push(MockCall {
            operation: operation.to_string(),
            input: input.to_string(),
        });
    }
}

#[async_trait]
impl OcrService for MockOcrService {
    async fn submit(&self, location: &SourceLocation) -> Result<String> {
        self.log_call("submit", &location.to_string());

        if let Some(limit) = self.config.max_object_bytes {
            let size = self.store.size(location).await?;
            if size > limit {
                return Err(Error::Validation(format!(
                    "object {location} is {size} bytes, above the OCR limit of {limit}"
                )));
            }
        }

        let result = if self
            .config
            .failing_keys
            .iter()
            .any(|p| location.key.contains(p.as_str()))
        {
            OcrPoll::failed(format!("unreadable document {location}"))
        } else {
            let bytes = self.store.read(location).await?;
            let (text, pages) = mock_ocr_text(&bytes);
            OcrPoll::succeeded(text, pages, self.config.confidence)
        };

        let job_id = format!("mock-ocr-{}", self.next_job.fetch_add(1, Ordering::SeqCst));
        if let Some(callbacks) = &self.config.callbacks {
            callbacks.complete(&job_id, result.clone());
        }
        lock(&self.jobs).insert(
            job_id.clone(),
            MockJob {
                result,
                remaining_polls: self.config.polls_before_ready,
            },
        );
        Ok(job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<OcrPoll> {
        self.log_call("poll", job_id);
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("OCR job {job_id}")))?;
        if job.remaining_polls > 0 {
            job.remaining_polls -= 1;
            return Ok(OcrPoll::in_progress());
        }
        Ok(job.result.clone())
    }
}

/// Entity model that finds configured phrases verbatim.
#[derive(Clone)]
pub struct MockEntityService {
    config: Arc<EntityMockConfig>,
    call_log: Arc<Mutex<Vec<MockCall>>>,
    calls: Arc<AtomicUsize>,
}

#[derive(Clone, Default)]
struct EntityMockConfig {
    phrases: Vec<(String, String)>,
    confidence: Option<f64>,
    /// Phrases reported with a null text field.
    malformed: Vec<String>,
    transient_failures: usize,
    failing_on: Vec<String>,
}

impl Default for MockEntityService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEntityService {
    pub fn new() -> Self {
        Self {
            config: Arc::new(EntityMockConfig {
                confidence: Some(90.0),
                ..Default::default()
            }),
            call_log: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Report every occurrence of `phrase` with the given label.
    pub fn with_entity(mut self, phrase: impl Into<String>, label: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config)
            .phrases
            .push((phrase.into(), label.into()));
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        Arc::make_mut(&mut self.config).confidence = Some(confidence);
        self
    }

    /// Occurrences of `phrase` come back with no text.
    pub fn with_malformed(mut self, phrase: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).malformed.push(phrase.into());
        self
    }

    /// The first `n` calls fail with a transient error.
    pub fn with_transient_failures(mut self, n: usize) -> Self {
        Arc::make_mut(&mut self.config).transient_failures = n;
        self
    }

    /// Calls on text containing `pattern` always fail transiently.
    pub fn failing_on(mut self, pattern: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).failing_on.push(pattern.into());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        lock(&self.call_log).clone()
    }
}

fn char_offset(text: &str, byte_index: usize) -> usize {
    text[..byte_index].chars().count()
}

#[async_trait]
impl EntityExtractionService for MockEntityService {
    async fn extract(&self, text: &str) -> Result<Vec<RawEntity>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.call_log).push(MockCall {
            operation: "extract".to_string(),
            input: text.to_string(),
        });

        if n < self.config.transient_failures {
            return Err(Error::Transient("entity model unavailable".to_string()));
        }
        if self.config.failing_on.iter().any(|p| text.contains(p.as_str())) {
            return Err(Error::Transient("entity model timed out".to_string()));
        }

        let mut found = Vec::new();
        for (phrase, label) in &self.config.phrases {
            for (byte_start, matched) in text.match_indices(phrase.as_str()) {
                let start = char_offset(text, byte_start);
                let malformed = self.config.malformed.iter().any(|m| m == phrase);
                found.push(RawEntity {
                    text: (!malformed).then(|| matched.to_string()),
                    entity_type: label.clone(),
                    start,
                    end: start + matched.chars().count(),
                    confidence: self.config.confidence,
                });
            }
        }
        found.sort_by_key(|e| (e.start, e.end));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::FilesystemObjectStore;
    use docket_core::OcrStatus;

    #[test]
    fn test_mock_ocr_text_ignores_split_points() {
        let whole = "one\u{000C}two\u{000C}three";
        let (text, pages) = mock_ocr_text(whole.as_bytes());
        assert_eq!(pages, 3);

        let parts = ["one\u{000C}", "two\u{000C}", "three"];
        let joined: Vec<String> = parts
            .iter()
            .map(|p| mock_ocr_text(p.as_bytes()).0)
            .collect();
        assert_eq!(joined.join("\u{000C}"), text);
    }

    #[tokio::test]
    async fn test_mock_ocr_polls_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FilesystemObjectStore::new(dir.path()));
        let loc = SourceLocation::new("b", "doc.pdf");
        store.put(&loc, b"page a\x0cpage b").await.unwrap();

        let ocr = MockOcrService::new(store).with_polls_before_ready(1);
        let job = ocr.submit(&loc).await.unwrap();
        assert_eq!(ocr.poll(&job).await.unwrap().status, OcrStatus::InProgress);
        let done = ocr.poll(&job).await.unwrap();
        assert_eq!(done.status, OcrStatus::Succeeded);
        assert_eq!(done.pages, Some(2));
        assert_eq!(ocr.submitted(), vec!["b/doc.pdf".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_ocr_enforces_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FilesystemObjectStore::new(dir.path()));
        let loc = SourceLocation::new("b", "huge.pdf");
        store.put(&loc, &[b'x'; 64]).await.unwrap();

        let ocr = MockOcrService::new(store).with_max_object_bytes(32);
        assert!(matches!(ocr.submit(&loc).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_mock_entities_offsets_are_chars() {
        let ner = MockEntityService::new().with_entity("Ott", "PERSON");
        let found = ner.extract("Señor Ott and Ott").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!((found[0].start, found[0].end), (6, 9));
        assert_eq!((found[1].start, found[1].end), (14, 17));
    }

    #[tokio::test]
    async fn test_mock_entities_transient_then_ok() {
        let ner = MockEntityService::new()
            .with_entity("Wombat", "ORG")
            .with_transient_failures(1);
        assert!(ner.extract("Wombat").await.unwrap_err().is_transient());
        assert_eq!(ner.extract("Wombat").await.unwrap().len(), 1);
        assert_eq!(ner.call_count(), 2);
    }
}
