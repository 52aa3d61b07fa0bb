//! The shared parsing model and its one-time initialisation.
//!
//! ## Backends
//!
//! The dispatcher consumes two opaque capabilities:
//!
//! * a [`LayoutModel`]: opens a document and, per page, reads the native
//!   text layer or rasterises the page ([`pdfium::PdfiumLayout`]);
//! * an optional [`OcrEngine`]: turns a rendered page into text
//!   ([`vision::VisionOcr`]).
//!
//! Both are produced together by a [`ModelLoader`], which is the slow,
//! memory-hungry step.
//!
//! ## Single initialisation
//!
//! [`ModelHandle`] guarantees the loader runs at most once per handle:
//!
//! ```text
//! Uninitialized ──initialize()──▶ Loading ──▶ Ready
//!                                        └──▶ Failed (permanent)
//! ```
//!
//! The first caller spawns the load on the blocking pool and publishes it as
//! a shared future; every concurrent caller awaits that same future. The
//! load itself is detached from its callers, so a caller that times out
//! while waiting never causes a second load.

pub mod pdfium;
pub mod vision;

use crate::config::OcrTrigger;
use crate::error::{DispatchError, ModelError, PageError};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ── Backend traits ───────────────────────────────────────────────────────

/// The primary, layout-based extractor.
///
/// Implementations must be stateless per call: a conversion may be
/// abandoned mid-document and must leave nothing behind in the model.
pub trait LayoutModel: Send + Sync {
    /// Version string recorded in every result this model produces.
    fn version(&self) -> &str;

    /// Open a document. An error here means page boundaries are unknown.
    fn open<'a>(&'a self, bytes: &'a [u8]) -> Result<Box<dyn DocumentSession + 'a>, ModelError>;
}

/// An opened document. Used from a single blocking thread.
pub trait DocumentSession {
    fn page_count(&self) -> usize;

    /// Native text layer of the page at 0-based `index`.
    fn extract_text(&self, index: usize) -> Result<String, ModelError>;

    /// Rasterise the page with its longest edge capped at `max_pixels`.
    fn render(&self, index: usize, max_pixels: u32) -> Result<DynamicImage, ModelError>;
}

/// The fallback extractor for pages without a usable text layer.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Recognise the text on a rendered page (`page_num` is 1-indexed).
    async fn recognize(&self, page_num: usize, image: &DynamicImage) -> Result<String, ModelError>;
}

/// Performs the expensive load. Called at most once per [`ModelHandle`].
pub trait ModelLoader: Send + Sync {
    /// Blocking; runs on tokio's blocking pool.
    fn load(&self) -> Result<LoadedModels, ModelError>;
}

/// Everything a successful load produces.
#[derive(Clone)]
pub struct LoadedModels {
    pub layout: Arc<dyn LayoutModel>,
    pub ocr: Option<Arc<dyn OcrEngine>>,
}

impl LoadedModels {
    pub fn new(layout: Arc<dyn LayoutModel>, ocr: Option<Arc<dyn OcrEngine>>) -> Self {
        Self { layout, ocr }
    }
}

impl fmt::Debug for LoadedModels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModels")
            .field("layout", &self.layout.version())
            .field("ocr", &self.ocr.as_ref().map(|o| o.name().to_string()))
            .finish()
    }
}

// ── Raw model output ─────────────────────────────────────────────────────

/// Options for one primary pass over a document.
#[derive(Debug, Clone)]
pub struct PrimaryPass {
    pub trigger: OcrTrigger,
    /// Rasterise fallback pages (only worth it when an OCR engine will read them).
    pub render_fallback: bool,
    pub max_rendered_pixels: u32,
}

/// What the primary pass produced for one page.
#[derive(Debug)]
pub enum RawPage {
    /// Usable text layer.
    Text(String),
    /// Text layer below the OCR threshold, rendered for OCR. `text_layer`
    /// is kept so a failed OCR call can fall back to it.
    Image { image: DynamicImage, text_layer: String },
    /// Empty text layer, not rendered.
    ImageOnly { text_chars: usize },
    Failed(PageError),
}

// ── Handle ───────────────────────────────────────────────────────────────

/// Initialisation state of a [`ModelHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    Uninitialized,
    Loading,
    Ready,
    Failed,
}

type LoadResult = Result<Arc<LoadedModels>, ModelError>;

/// Owns the loaded models; shared by every conversion through an `Arc`.
pub struct ModelHandle {
    loader: Arc<dyn ModelLoader>,
    /// The in-progress (or finished) load, created once under the lock.
    loading: Mutex<Option<Shared<BoxFuture<'static, LoadResult>>>>,
    /// Final load result; immutable once set.
    outcome: Arc<OnceLock<LoadResult>>,
    loads_started: AtomicUsize,
}

impl ModelHandle {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            loading: Mutex::new(None),
            outcome: Arc::new(OnceLock::new()),
            loads_started: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> InitState {
        match self.outcome.get() {
            Some(Ok(_)) => InitState::Ready,
            Some(Err(_)) => InitState::Failed,
            None => {
                let loading = self.loading.lock().unwrap_or_else(|e| e.into_inner());
                if loading.is_some() {
                    InitState::Loading
                } else {
                    InitState::Uninitialized
                }
            }
        }
    }

    /// Number of load sequences ever started (0 or 1).
    pub fn loads_started(&self) -> usize {
        self.loads_started.load(Ordering::SeqCst)
    }

    /// Load the models if nobody has yet, then wait until `Ready` or `Failed`.
    ///
    /// Idempotent. A `Failed` load is never retried; every later call
    /// returns `ModelUnavailable` immediately.
    pub async fn initialize(&self) -> Result<Arc<LoadedModels>, DispatchError> {
        if let Some(done) = self.outcome.get() {
            return done.clone().map_err(unavailable);
        }

        let load = {
            let mut slot = self.loading.lock().unwrap_or_else(|e| e.into_inner());
            slot.get_or_insert_with(|| self.start_load()).clone()
        };

        load.await.map_err(unavailable)
    }

    /// The loaded models, without waiting. `ModelUnavailable` unless `Ready`.
    pub fn models(&self) -> Result<Arc<LoadedModels>, DispatchError> {
        match self.outcome.get() {
            Some(done) => done.clone().map_err(unavailable),
            None => Err(DispatchError::ModelUnavailable {
                reason: format!("model is {:?}", self.state()).to_lowercase(),
            }),
        }
    }

    /// The OCR engine, if the model is ready and one was loaded.
    pub fn ocr(&self) -> Option<Arc<dyn OcrEngine>> {
        self.models().ok().and_then(|m| m.ocr.clone())
    }

    /// Run the primary, layout-based pass over a document.
    ///
    /// Blocking. Observes `cancel` at every page boundary. Only usable when
    /// the handle is `Ready`. A page that panics the layout model is
    /// recorded as that page's `ExtractionFailed`.
    pub fn invoke(
        &self,
        bytes: &[u8],
        pass: &PrimaryPass,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawPage>, DispatchError> {
        let models = self.models()?;
        let session = models.layout.open(bytes).map_err(|e| match e {
            ModelError::Document(detail) => DispatchError::MalformedDocument { detail },
            other => DispatchError::MalformedDocument {
                detail: other.to_string(),
            },
        })?;

        let total = session.page_count();
        debug!(pages = total, "document opened");
        let mut pages = Vec::with_capacity(total);

        for index in 0..total {
            if cancel.is_cancelled() {
                debug!(page = index + 1, "primary pass stopped by cancellation");
                return Err(DispatchError::Cancelled);
            }
            let read = AssertUnwindSafe(|| primary_page(session.as_ref(), index, pass));
            let raw = panic::catch_unwind(read).unwrap_or_else(|payload| {
                let detail = format!("layout model panicked: {}", panic_message(payload.as_ref()));
                error!(page = index + 1, "{detail}");
                RawPage::Failed(PageError::ExtractionFailed {
                    page: index + 1,
                    detail,
                })
            });
            pages.push(raw);
        }

        Ok(pages)
    }

    fn start_load(&self) -> Shared<BoxFuture<'static, LoadResult>> {
        self.loads_started.fetch_add(1, Ordering::SeqCst);
        info!("Loading parsing model (one-time)...");

        let loader = Arc::clone(&self.loader);
        let outcome = Arc::clone(&self.outcome);
        let started = Instant::now();

        let task = tokio::task::spawn_blocking(move || {
            let result = loader.load().map(Arc::new);
            let _ = outcome.set(result.clone());
            result
        });

        let outcome = Arc::clone(&self.outcome);
        async move {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    let failed = Err(ModelError::Load(format!("model loader panicked: {e}")));
                    let _ = outcome.set(failed.clone());
                    failed
                }
            };
            match &result {
                Ok(models) => info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Parsing model loaded: {:?}",
                    models
                ),
                Err(e) => error!("Parsing model failed to load: {e}"),
            }
            result
        }
        .boxed()
        .shared()
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("state", &self.state())
            .field("loads_started", &self.loads_started())
            .finish()
    }
}

fn unavailable(e: ModelError) -> DispatchError {
    DispatchError::ModelUnavailable {
        reason: e.to_string(),
    }
}

fn primary_page(session: &dyn DocumentSession, index: usize, pass: &PrimaryPass) -> RawPage {
    let page = index + 1;
    let text = match session.extract_text(index) {
        Ok(text) => text,
        Err(e) => {
            return RawPage::Failed(PageError::ExtractionFailed {
                page,
                detail: e.to_string(),
            })
        }
    };

    if !pass.trigger.wants_fallback(&text) {
        return RawPage::Text(text);
    }

    // No OCR will run: keep whatever text the layer has.
    let text_chars = crate::config::text_chars(&text);
    if !pass.render_fallback {
        return if text_chars > 0 {
            RawPage::Text(text)
        } else {
            RawPage::ImageOnly { text_chars }
        };
    }

    match session.render(index, pass.max_rendered_pixels) {
        Ok(image) => {
            debug!(page, width = image.width(), height = image.height(), "page rendered for OCR");
            RawPage::Image { image, text_layer: text }
        }
        Err(e) if text_chars > 0 => {
            warn!(page, "rasterisation failed, keeping text layer: {e}");
            RawPage::Text(text)
        }
        Err(e) => RawPage::Failed(PageError::RenderFailed {
            page,
            detail: e.to_string(),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
