//! Error types for the edgequake-dispatch library.
//!
//! Three layers of failure, three types:
//!
//! * [`DispatchError`]: **Fatal** for one job: the document cannot be
//!   converted at all (model never loaded, bytes are not a PDF, no gate slot
//!   before the deadline). Surfaced to the caller as
//!   [`crate::output::ConversionOutcome::Failure`].
//!
//! * [`PageError`]: **Non-fatal**: a single page could not be extracted but
//!   the rest of the document is fine. Embedded in the result as
//!   [`crate::output::PageContent::Failed`] so one bad page never costs the
//!   whole document.
//!
//! * [`ModelError`]: raised by the model backends (pdfium, OCR engine).
//!   The pipeline translates it into one of the two above depending on
//!   whether page boundaries could still be established.
//!
//! [`ErrorKind`] is the flat taxonomy shared by all of them; it is what an
//! HTTP layer puts on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Flat classification of every failure the dispatcher can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The parsing model failed to load. Permanent until an operator acts.
    ModelUnavailable,
    /// The input could not be parsed far enough to count its pages.
    MalformedDocument,
    /// A single page failed; recorded in the result, never fatal.
    PageExtractionFailed,
    /// The per-job deadline expired while the job was running.
    TimedOut,
    /// The caller (or the host) aborted the job.
    Cancelled,
    /// No gate slot became free before the job's deadline.
    ResourceExhausted,
    /// The request itself was unusable (missing file, bad URL, bad config).
    InvalidInput,
    /// A bug or an unexpected runtime failure (e.g. a panicking extraction).
    Internal,
}

impl ErrorKind {
    /// Whether resubmitting the *same* job could reasonably succeed later.
    ///
    /// The dispatcher itself never retries; this is advice for the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TimedOut | ErrorKind::ResourceExhausted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::MalformedDocument => "malformed_document",
            ErrorKind::PageExtractionFailed => "page_extraction_failed",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All job-level errors returned by the edgequake-dispatch library.
///
/// Page-level failures use [`PageError`] and are stored in the result
/// rather than propagated here.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    // ── Model errors ──────────────────────────────────────────────────────
    /// The model handle is not `Ready` (load failed, or invoked too early).
    #[error("Parsing model unavailable: {reason}\nCheck the model path and available memory, then restart the process.")]
    ModelUnavailable { reason: String },

    // ── Document errors ───────────────────────────────────────────────────
    /// Page boundaries could not be established for the document.
    #[error("Malformed document: {detail}")]
    MalformedDocument { detail: String },

    // ── Scheduling errors ─────────────────────────────────────────────────
    /// The gate stayed full until the job's deadline.
    #[error("No conversion slot became free within {waited_ms}ms")]
    ResourceExhausted { waited_ms: u64 },

    /// The job's deadline expired while it was running.
    #[error("Conversion exceeded its {deadline_ms}ms deadline")]
    TimedOut { deadline_ms: u64 },

    /// The job was aborted before it finished.
    #[error("Conversion cancelled")]
    Cancelled,

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Map this error onto the flat [`ErrorKind`] taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            DispatchError::MalformedDocument { .. } => ErrorKind::MalformedDocument,
            DispatchError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            DispatchError::TimedOut { .. } => ErrorKind::TimedOut,
            DispatchError::Cancelled => ErrorKind::Cancelled,
            DispatchError::FileNotFound { .. }
            | DispatchError::PermissionDenied { .. }
            | DispatchError::InvalidInput { .. }
            | DispatchError::DownloadFailed { .. }
            | DispatchError::DownloadTimeout { .. }
            | DispatchError::InvalidConfig(_) => ErrorKind::InvalidInput,
            DispatchError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// A non-fatal error for a single page.
///
/// Stored as [`crate::output::PageContent::Failed`]; the conversion carries
/// on with the remaining pages.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PageError {
    /// The layout model could not read the page's text layer.
    #[error("Page {page}: text extraction failed: {detail}")]
    ExtractionFailed { page: usize, detail: String },

    /// The page needed OCR but could not be rasterised.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// The OCR engine rejected the page image.
    #[error("Page {page}: OCR failed: {detail}")]
    OcrFailed { page: usize, detail: String },

    /// The OCR engine did not answer within its per-call timeout.
    #[error("Page {page}: OCR timed out after {secs}s")]
    OcrTimeout { page: usize, secs: u64 },
}

impl PageError {
    /// 1-indexed page number this error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::ExtractionFailed { page, .. }
            | PageError::RenderFailed { page, .. }
            | PageError::OcrFailed { page, .. }
            | PageError::OcrTimeout { page, .. } => *page,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PageExtractionFailed
    }
}

/// Errors raised by model backends.
///
/// `Clone` because a failed load is stored once and replayed to every job
/// that asks for the model afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// Loading the model or binding its native library failed.
    #[error("model load failed: {0}")]
    Load(String),

    /// The document could not be opened; page count is unknown.
    #[error("document could not be opened: {0}")]
    Document(String),

    /// One page could not be read or rendered.
    #[error("page {page}: {detail}")]
    Page { page: usize, detail: String },

    /// The OCR engine failed.
    #[error("OCR engine error: {0}")]
    Ocr(String),

    /// The OCR engine exceeded its per-call timeout.
    #[error("OCR call timed out after {secs}s")]
    OcrTimeout { secs: u64 },
}

impl From<ModelError> for DispatchError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::Document(detail) => DispatchError::MalformedDocument { detail },
            ModelError::Load(reason) => DispatchError::ModelUnavailable { reason },
            other => DispatchError::Internal(other.to_string()),
        }
    }
}

/// Errors from [`crate::gate::ResourceGate::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// The caller's deadline passed while every slot was taken.
    #[error("gate wait timed out after {waited_ms}ms")]
    TimedOutWaiting { waited_ms: u64 },

    /// The gate was closed; no further admissions.
    #[error("gate is closed")]
    Closed,
}

impl From<GateError> for DispatchError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::TimedOutWaiting { waited_ms } => DispatchError::ResourceExhausted { waited_ms },
            GateError::Closed => DispatchError::Cancelled,
        }
    }
}
