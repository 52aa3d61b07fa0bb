//! Deterministic fakes for the model backends.
//!
//! A fake document is `%PDF-fake\n` followed by one line per page:
//!
//! | line              | page behaviour                                   |
//! |-------------------|--------------------------------------------------|
//! | `text:<content>`  | text layer is `<content>`                        |
//! | `image`           | empty text layer, renders for OCR                |
//! | `corrupt`         | text extraction fails                            |
//! | `panic`           | text extraction panics                           |
//! | `slow:<ms>:<txt>` | sleeps `<ms>` on the blocking thread, then text  |
//!
//! A first line of `%PDF-panic` makes opening the document panic; any
//! other first line makes it unopenable.

#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_dispatch::{
    DispatcherConfig, DocumentSession, InitMode, LayoutModel, LoadedModels, ModelError, ModelLoader, OcrEngine,
    OcrTrigger,
};
use image::DynamicImage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const FAKE_HEADER: &str = "%PDF-fake";
pub const FAKE_VERSION: &str = "fake-layout/1";
pub const PANIC_HEADER: &str = "%PDF-panic";

/// Build a fake document from page lines.
pub fn doc(pages: &[&str]) -> Vec<u8> {
    let mut s = String::from(FAKE_HEADER);
    for p in pages {
        s.push('\n');
        s.push_str(p);
    }
    s.into_bytes()
}

/// Config with short timings suitable for tests.
pub fn config(capacity: usize, deadline: Duration) -> DispatcherConfig {
    DispatcherConfig::builder()
        .max_concurrent_conversions(capacity)
        .per_job_deadline(deadline)
        .cancel_grace(Duration::from_millis(100))
        .ocr_trigger(OcrTrigger::NoTextLayer)
        .build()
        .expect("test config is valid")
}

/// Route dispatcher logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn lazy(mut config: DispatcherConfig) -> DispatcherConfig {
    config.init_mode = InitMode::Lazy;
    config
}

// ── Layout ─────────────────────────────────────────────────────────────────

/// Counts open documents so tests can check how many conversions overlap.
#[derive(Debug, Default)]
pub struct LayoutCounters {
    pub opened: AtomicUsize,
    pub active: AtomicUsize,
    pub peak_active: AtomicUsize,
}

pub struct FakeLayout {
    counters: Arc<LayoutCounters>,
}

struct FakeSession<'a> {
    pages: Vec<&'a str>,
    counters: Arc<LayoutCounters>,
}

impl LayoutModel for FakeLayout {
    fn version(&self) -> &str {
        FAKE_VERSION
    }

    fn open<'a>(&'a self, bytes: &'a [u8]) -> Result<Box<dyn DocumentSession + 'a>, ModelError> {
        let text = std::str::from_utf8(bytes).map_err(|e| ModelError::Document(e.to_string()))?;
        let mut lines = text.split('\n');
        let header = lines.next();
        if header == Some(PANIC_HEADER) {
            panic!("xref parser crashed");
        }
        if header != Some(FAKE_HEADER) {
            return Err(ModelError::Document("xref table unreadable".into()));
        }

        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_active.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(FakeSession {
            pages: lines.collect(),
            counters: Arc::clone(&self.counters),
        }))
    }
}

impl Drop for FakeSession<'_> {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DocumentSession for FakeSession<'_> {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn extract_text(&self, index: usize) -> Result<String, ModelError> {
        let line = self.pages[index];
        if let Some(text) = line.strip_prefix("text:") {
            return Ok(text.to_string());
        }
        if let Some(rest) = line.strip_prefix("slow:") {
            let (ms, text) = rest.split_once(':').unwrap_or((rest, ""));
            std::thread::sleep(Duration::from_millis(ms.parse().unwrap_or(0)));
            return Ok(text.to_string());
        }
        match line {
            "image" => Ok(String::new()),
            "panic" => panic!("layout model crashed on page {}", index + 1),
            _ => Err(ModelError::Page {
                page: index + 1,
                detail: format!("unreadable content stream: {line:?}"),
            }),
        }
    }

    fn render(&self, _index: usize, _max_pixels: u32) -> Result<DynamicImage, ModelError> {
        Ok(DynamicImage::new_rgb8(4, 4))
    }
}

// ── OCR ────────────────────────────────────────────────────────────────────

/// Returns `"ocr page N"`. `delay(N)` controls completion order.
pub struct FakeOcr {
    pub calls: AtomicUsize,
    delay: Box<dyn Fn(usize) -> Duration + Send + Sync>,
    fail: bool,
}

impl FakeOcr {
    pub fn instant() -> Arc<Self> {
        Self::with_delay(|_| Duration::ZERO)
    }

    pub fn with_delay(delay: impl Fn(usize) -> Duration + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Box::new(delay),
            fail: false,
        })
    }

    /// Rejects every page.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Box::new(|_| Duration::ZERO),
            fail: true,
        })
    }
}

#[async_trait]
impl OcrEngine for FakeOcr {
    fn name(&self) -> &str {
        "fake-ocr"
    }

    async fn recognize(&self, page_num: usize, _image: &DynamicImage) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep((self.delay)(page_num)).await;
        if self.fail {
            return Err(ModelError::Ocr("vision model returned an empty response".into()));
        }
        Ok(format!("ocr page {page_num}"))
    }
}

// ── Loader ─────────────────────────────────────────────────────────────────

pub struct FakeLoader {
    pub calls: AtomicUsize,
    pub counters: Arc<LayoutCounters>,
    load_time: Duration,
    fail: bool,
    ocr: Option<Arc<FakeOcr>>,
}

impl FakeLoader {
    pub fn new() -> Arc<Self> {
        Self::build(Duration::ZERO, false, Some(FakeOcr::instant()))
    }

    pub fn with_ocr(ocr: Arc<FakeOcr>) -> Arc<Self> {
        Self::build(Duration::ZERO, false, Some(ocr))
    }

    pub fn without_ocr() -> Arc<Self> {
        Self::build(Duration::ZERO, false, None)
    }

    pub fn slow(load_time: Duration) -> Arc<Self> {
        Self::build(load_time, false, Some(FakeOcr::instant()))
    }

    pub fn failing(load_time: Duration) -> Arc<Self> {
        Self::build(load_time, true, None)
    }

    fn build(load_time: Duration, fail: bool, ocr: Option<Arc<FakeOcr>>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            counters: Arc::new(LayoutCounters::default()),
            load_time,
            fail,
            ocr,
        })
    }

    pub fn load_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelLoader for FakeLoader {
    fn load(&self) -> Result<LoadedModels, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.load_time);
        if self.fail {
            return Err(ModelError::Load("weights file truncated".into()));
        }
        let layout = Arc::new(FakeLayout {
            counters: Arc::clone(&self.counters),
        });
        let ocr = self.ocr.clone().map(|o| o as Arc<dyn OcrEngine>);
        Ok(LoadedModels::new(layout, ocr))
    }
}
