//! External collaborators of the docket pipeline.
//!
//! HTTP clients for the OCR engine and the entity model, a filesystem object
//! store, and the OCR completion waiter. Deterministic mocks are available
//! with the `mock` feature.

mod http;

pub mod entities;
pub mod object_store;
pub mod ocr;
pub mod ocr_wait;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use entities::{EntityClientConfig, HttpEntityClient};
pub use object_store::FilesystemObjectStore;
pub use ocr::{HttpOcrClient, OcrClientConfig};
pub use ocr_wait::{OcrCallbacks, OcrOutcome, OcrWaitConfig, OcrWaiter};

#[cfg(any(test, feature = "mock"))]
pub use mock::{mock_ocr_text, MockCall, MockEntityService, MockOcrService};
