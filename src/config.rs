//! Configuration types for the conversion dispatcher.
//!
//! All dispatcher behaviour is controlled through [`DispatcherConfig`], built
//! via its [`DispatcherConfigBuilder`]. Three knobs are easy to confuse:
//!
//! | Knob | Bounds |
//! |------|--------|
//! | `worker_count` | threads accepting and driving jobs (tokio worker threads) |
//! | `max_concurrent_conversions` | conversions running at once (the gate size `C`) |
//! | `ocr_concurrency` | OCR calls in flight *within one* conversion |
//!
//! `C` is derived from memory, not from threads: every running conversion
//! holds a parsed document plus rendered page images, so the gate is sized
//! with [`concurrency_bound`] from the host's memory budget.

use crate::error::DispatchError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Non-whitespace characters a text layer needs before it is trusted
/// without OCR. Pages below it are treated as scanned.
pub const DEFAULT_MIN_TEXT_CHARS: usize = 50;

/// Configuration for a [`crate::Dispatcher`].
///
/// # Example
/// ```rust
/// use edgequake_dispatch::DispatcherConfig;
/// use std::time::Duration;
///
/// let config = DispatcherConfig::builder()
///     .max_concurrent_conversions(2)
///     .per_job_deadline(Duration::from_secs(120))
///     .worker_count(8)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_concurrent_conversions, 2);
/// ```
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Gate size `C`: conversions allowed to run at once. Default: 2.
    pub max_concurrent_conversions: usize,

    /// Wall-clock ceiling per job, measured from submission. Default: 120 s.
    ///
    /// Time spent queueing at the gate and waiting for the model to load
    /// counts against it.
    pub per_job_deadline: Duration,

    /// Tokio worker threads accepting jobs. Default: 4.
    pub worker_count: usize,

    /// When the model is loaded. Default: [`InitMode::Eager`].
    pub init_mode: InitMode,

    /// How long a timed-out or cancelled job waits for its work to stop
    /// cooperatively before the work is abandoned. Default: 5 s.
    pub cancel_grace: Duration,

    /// Directory containing the pdfium shared library.
    /// `None` binds the system library.
    pub model_path: Option<PathBuf>,

    /// When a page falls back to OCR. Default: `MinChars(50)`.
    pub ocr_trigger: OcrTrigger,

    /// OCR calls in flight within one conversion. Default: 4.
    pub ocr_concurrency: usize,

    /// Longest edge, in pixels, of a page rasterised for OCR. Default: 2000.
    ///
    /// Caps memory per rendered page regardless of physical page size.
    pub max_rendered_pixels: u32,

    /// Separator used by [`crate::ExtractionResult::to_markdown`] callers.
    pub page_separator: PageSeparator,

    /// OCR engine settings.
    pub ocr: OcrSettings,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_conversions: 2,
            per_job_deadline: Duration::from_secs(120),
            worker_count: 4,
            init_mode: InitMode::default(),
            cancel_grace: Duration::from_secs(5),
            model_path: None,
            ocr_trigger: OcrTrigger::default(),
            ocr_concurrency: 4,
            max_rendered_pixels: 2000,
            page_separator: PageSeparator::default(),
            ocr: OcrSettings::default(),
        }
    }
}

impl DispatcherConfig {
    /// Create a new builder for `DispatcherConfig`.
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder {
            config: Self::default(),
        }
    }

    /// Build the multi-thread runtime that accepts jobs.
    ///
    /// `worker_count` sizes the async workers only. Blocking extraction runs
    /// on tokio's separate blocking pool, so an abandoned pdfium call never
    /// occupies a worker.
    pub fn build_runtime(&self) -> Result<tokio::runtime::Runtime, DispatchError> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.worker_count)
            .thread_name("pdf2md-worker")
            .enable_all()
            .build()
            .map_err(|e| DispatchError::Internal(format!("Failed to create tokio runtime: {e}")))
    }
}

/// Builder for [`DispatcherConfig`].
#[derive(Debug)]
pub struct DispatcherConfigBuilder {
    config: DispatcherConfig,
}

impl DispatcherConfigBuilder {
    pub fn max_concurrent_conversions(mut self, n: usize) -> Self {
        self.config.max_concurrent_conversions = n;
        self
    }

    pub fn per_job_deadline(mut self, deadline: Duration) -> Self {
        self.config.per_job_deadline = deadline;
        self
    }

    pub fn worker_count(mut self, n: usize) -> Self {
        self.config.worker_count = n;
        self
    }

    pub fn init_mode(mut self, mode: InitMode) -> Self {
        self.config.init_mode = mode;
        self
    }

    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.config.cancel_grace = grace;
        self
    }

    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.model_path = Some(path.into());
        self
    }

    pub fn ocr_trigger(mut self, trigger: OcrTrigger) -> Self {
        self.config.ocr_trigger = trigger;
        self
    }

    pub fn ocr_concurrency(mut self, n: usize) -> Self {
        self.config.ocr_concurrency = n.max(1);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn ocr(mut self, settings: OcrSettings) -> Self {
        self.config.ocr = settings;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<DispatcherConfig, DispatchError> {
        let c = &self.config;
        if c.max_concurrent_conversions == 0 {
            return Err(DispatchError::InvalidConfig(
                "max_concurrent_conversions must be ≥ 1".into(),
            ));
        }
        if c.worker_count == 0 {
            return Err(DispatchError::InvalidConfig("worker_count must be ≥ 1".into()));
        }
        if c.per_job_deadline.is_zero() {
            return Err(DispatchError::InvalidConfig(
                "per_job_deadline must be greater than zero".into(),
            ));
        }
        if !(0.0..=2.0).contains(&c.ocr.temperature) {
            return Err(DispatchError::InvalidConfig(format!(
                "OCR temperature must be 0.0–2.0, got {}",
                c.ocr.temperature
            )));
        }
        Ok(self.config)
    }
}

/// Derive the gate size `C` from a memory budget.
///
/// `memory_budget_bytes` is what the process may use in total;
/// `model_footprint_bytes` is committed once by the loaded model;
/// `per_conversion_bytes` is the peak of one running conversion. Never
/// returns less than 1, so a tight budget still admits one job at a time.
pub fn concurrency_bound(
    memory_budget_bytes: u64,
    model_footprint_bytes: u64,
    per_conversion_bytes: u64,
) -> usize {
    let spare = memory_budget_bytes.saturating_sub(model_footprint_bytes);
    let per = per_conversion_bytes.max(1);
    ((spare / per) as usize).max(1)
}

// ── Enums ────────────────────────────────────────────────────────────────

/// When the model handle pays its load cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitMode {
    /// Load during [`crate::Dispatcher::start`]; a failed load fails startup.
    #[default]
    Eager,
    /// Load on the first submitted job; that job pays the cold start.
    Lazy,
}

/// Policy deciding when a page's text layer is unusable and OCR takes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrTrigger {
    /// OCR only pages whose text layer is completely empty.
    NoTextLayer,
    /// OCR pages with fewer than `n` non-whitespace characters.
    MinChars(usize),
    /// Never OCR; pages with an empty text layer become rendered-image markers.
    Never,
}

impl Default for OcrTrigger {
    fn default() -> Self {
        OcrTrigger::MinChars(DEFAULT_MIN_TEXT_CHARS)
    }
}

impl OcrTrigger {
    /// Whether a page with this text layer should go to the fallback path.
    pub fn wants_fallback(&self, text: &str) -> bool {
        let chars = text_chars(text);
        match self {
            OcrTrigger::NoTextLayer => chars == 0,
            OcrTrigger::MinChars(n) => chars < *n,
            OcrTrigger::Never => chars == 0,
        }
    }

    /// Whether the fallback path may actually run OCR.
    pub fn allows_ocr(&self) -> bool {
        !matches!(self, OcrTrigger::Never)
    }
}

/// Non-whitespace character count of a text layer.
pub fn text_chars(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

/// Which OCR engine the loader builds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrBackend {
    /// No OCR engine; scanned pages stay as rendered-image markers.
    Disabled,
    /// Use a vision LLM if one can be resolved from the environment,
    /// otherwise load without OCR.
    #[default]
    Auto,
    /// Use a vision LLM; failing to build it fails the model load.
    Vision,
}

/// Settings for the vision-LLM OCR engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrSettings {
    pub backend: OcrBackend,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Model identifier, e.g. "gpt-4.1-nano". If None, uses provider default.
    pub model: Option<String>,

    /// Sampling temperature. Default: 0.0 so repeated runs agree.
    pub temperature: f32,

    /// Maximum tokens generated per page. Default: 4096.
    pub max_tokens: usize,

    /// Per-page OCR call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Custom system prompt. If None, uses the built-in OCR prompt.
    pub system_prompt: Option<String>,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            backend: OcrBackend::default(),
            provider_name: None,
            model: None,
            temperature: 0.0,
            max_tokens: 4096,
            api_timeout_secs: 60,
            system_prompt: None,
        }
    }
}

/// How to separate pages in assembled Markdown output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSeparator {
    /// No separator; pages joined with "\n\n". (default)
    #[default]
    None,
    /// Horizontal rule: "\n\n---\n\n"
    HorizontalRule,
    /// HTML comment with page number: "<!-- page N -->"
    Comment,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator string for the given page number (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {} -->\n\n", page_num),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = DispatcherConfig::builder().build().expect("defaults are valid");
        assert_eq!(config.max_concurrent_conversions, 2);
        assert_eq!(config.per_job_deadline, Duration::from_secs(120));
        assert_eq!(config.init_mode, InitMode::Eager);
        assert_eq!(config.ocr_trigger, OcrTrigger::MinChars(50));
    }

    #[test]
    fn zero_gate_size_rejected() {
        let err = DispatcherConfig::builder()
            .max_concurrent_conversions(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_concurrent_conversions"));
    }

    #[test]
    fn zero_deadline_rejected() {
        assert!(DispatcherConfig::builder()
            .per_job_deadline(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn worker_count_is_independent_of_gate() {
        let config = DispatcherConfig::builder()
            .worker_count(16)
            .max_concurrent_conversions(1)
            .build()
            .unwrap();
        assert_eq!(config.worker_count, 16);
        assert_eq!(config.max_concurrent_conversions, 1);
    }

    #[test]
    fn concurrency_bound_from_memory() {
        const GIB: u64 = 1024 * 1024 * 1024;
        // 16 GiB host, 6 GiB model, 2 GiB per conversion → 5 slots
        assert_eq!(concurrency_bound(16 * GIB, 6 * GIB, 2 * GIB), 5);
        // Model alone exceeds the budget: still one slot
        assert_eq!(concurrency_bound(4 * GIB, 6 * GIB, 2 * GIB), 1);
        assert_eq!(concurrency_bound(8 * GIB, 0, 0), (8 * GIB) as usize);
    }

    #[test]
    fn ocr_trigger_thresholds() {
        let short = "Fig. 3";
        let empty = "  \n\t ";
        let long = "a".repeat(60);

        assert!(OcrTrigger::MinChars(50).wants_fallback(short));
        assert!(!OcrTrigger::MinChars(50).wants_fallback(&long));
        assert!(!OcrTrigger::NoTextLayer.wants_fallback(short));
        assert!(OcrTrigger::NoTextLayer.wants_fallback(empty));
        assert!(OcrTrigger::Never.wants_fallback(empty));
        assert!(!OcrTrigger::Never.allows_ocr());
    }

    #[test]
    fn separator_render() {
        assert_eq!(PageSeparator::None.render(2), "\n\n");
        assert_eq!(PageSeparator::Comment.render(3), "\n\n<!-- page 3 -->\n\n");
        assert_eq!(
            PageSeparator::Custom("***".into()).render(1),
            "\n\n***\n\n"
        );
    }
}
