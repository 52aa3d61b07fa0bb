//! # edgequake-dispatch
//!
//! Convert PDF documents to text through one shared, expensive parsing
//! model, with bounded concurrency and per-job deadlines.
//!
//! ## Why this crate?
//!
//! Binding pdfium and preparing an OCR engine is slow and memory hungry, so
//! a process does it once and then serves many conversions from the same
//! model. Doing that safely needs more than a `spawn` per request: the
//! model must load exactly once under a burst, the number of concurrent
//! conversions must stay under what memory allows, and a stuck document
//! must not hold a slot forever.
//!
//! ## Architecture
//!
//! ```text
//! ConversionJob
//!  │
//!  ├─ Dispatcher      one outcome per job, lifecycle + logging
//!  ├─ ResourceGate    at most C jobs hold the model (fair FIFO admission)
//!  ├─ DeadlineGuard   deadline / cancel, bounded cleanup, panic isolation
//!  ├─ ModelHandle     single lazy-or-eager load, shared read-only
//!  └─ Pipeline        text layer per page, OCR fallback, source order
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_dispatch::{ConversionJob, Dispatcher, DispatcherConfig, PdfiumLoader};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DispatcherConfig::builder().max_concurrent_conversions(2).build()?;
//!     let loader = Arc::new(PdfiumLoader::new(config.model_path.clone(), config.ocr.clone()));
//!     let dispatcher = Dispatcher::start(config, loader).await?;
//!
//!     let bytes = std::fs::read("document.pdf")?;
//!     let outcome = dispatcher.submit(ConversionJob::new(bytes)).await;
//!     if let Some(result) = outcome.result() {
//!         print!("{}", result.to_markdown(&dispatcher.config().page_separator));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2md-dispatch` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod deadline;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod input;
pub mod job;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    concurrency_bound, DispatcherConfig, DispatcherConfigBuilder, InitMode, OcrBackend, OcrSettings,
    OcrTrigger, PageSeparator,
};
pub use deadline::{DeadlineGuard, Guarded};
pub use dispatcher::{BlockingDispatcher, Dispatcher};
pub use error::{DispatchError, ErrorKind, GateError, ModelError, PageError};
pub use gate::{GateSnapshot, GateToken, ResourceGate};
pub use job::{ConversionJob, JobId, JobState};
pub use model::pdfium::PdfiumLoader;
pub use model::vision::VisionOcr;
pub use model::{DocumentSession, InitState, LayoutModel, LoadedModels, ModelHandle, ModelLoader, OcrEngine};
pub use output::{
    ConversionOutcome, ConversionResponse, ConversionStats, ExtractionResult, PageContent, PageResult,
    ResponseStatus,
};
pub use pipeline::ConversionPipeline;
pub use progress::{DispatchObserver, NoopObserver, Observer};
