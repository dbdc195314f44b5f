//! # docket-jobs
//!
//! Orchestration core of the docket document pipeline.
//!
//! This crate provides:
//! - The six stage executors and the runner that applies the uniform
//!   breaker → execute → persist → advance algorithm to each of them
//! - A per-document circuit breaker backed by the durable store
//! - Large-file planning, streaming and page splitting for extraction
//! - A tiered worker pool draining the stage queue
//! - The batch manager: submission, progress and failed-document recovery
//!
//! ## Example
//!
//! ```ignore
//! use docket_jobs::{BatchManager, PipelineContext, PipelineWorker, StageRegistry, StageRunner, WorkerConfig};
//!
//! let ctx = PipelineContext::new(store, queue, cache, objects, ocr, ner, PipelineConfig::from_env());
//! let batches = BatchManager::new(&ctx);
//! let runner = StageRunner::new(ctx, StageRegistry::standard());
//!
//! let handle = PipelineWorker::new(runner, WorkerConfig::from_env()).start();
//! let tracker = batches.track(handle.events());
//!
//! let submitted = batches
//!     .submit("discovery-2024-03", [(SourceLocation::new("intake", "a.pdf"), Priority::High)], None)
//!     .await?;
//! println!("{:?}", batches.get_batch_status(submitted.batch_id).await?);
//!
//! handle.shutdown().await?;
//! ```

pub mod batch;
pub mod breaker;
pub mod chunker;
pub mod config;
pub mod context;
pub mod events;
pub mod large_file;
pub mod retry;
pub mod runner;
pub mod stages;
pub mod state;
pub mod worker;

// Re-export core types
pub use docket_core::*;

pub use batch::{BatchManager, BatchSubmission, DocumentRef};
pub use breaker::{BreakerConfig, DocumentBreaker};
pub use chunker::{ChunkerConfig, TextChunker};
pub use config::PipelineConfig;
pub use context::PipelineContext;
pub use events::{EventBus, PipelineEvent};
pub use large_file::{LargeFileConfig, LoadStrategy, PageSplitter};
pub use retry::RetryPolicy;
pub use runner::StageRunner;
pub use stages::{StageExecutor, StageRegistry};
pub use worker::{PipelineWorker, WorkerConfig, WorkerHandle};
