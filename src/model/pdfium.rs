//! pdfium-backed layout model.
//!
//! Binding the pdfium shared library is the expensive, do-once step; it is
//! done by [`PdfiumLoader`] inside [`super::ModelHandle`]'s one-time load.
//! After that, every conversion opens its own `PdfDocument` from the job's
//! byte slice. Nothing is written to disk and no state outlives a session,
//! which is what lets an abandoned conversion be dropped safely.
//!
//! pdfium is not async-safe; sessions are only ever driven from tokio's
//! blocking pool (see [`crate::pipeline`]).

use super::vision::VisionOcr;
use super::{DocumentSession, LayoutModel, LoadedModels, ModelLoader, OcrEngine};
use crate::config::{OcrBackend, OcrSettings};
use crate::error::ModelError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Version tag written into every [`crate::ExtractionResult`].
pub const PDFIUM_MODEL_VERSION: &str = "pdfium-render/0.8";

/// Loads pdfium (and the optional OCR engine) once per process.
#[derive(Debug, Clone)]
pub struct PdfiumLoader {
    /// Directory holding `libpdfium.{so,dylib}` / `pdfium.dll`.
    /// `None` binds the system library.
    pub library_dir: Option<PathBuf>,
    pub ocr: OcrSettings,
}

impl PdfiumLoader {
    pub fn new(library_dir: Option<PathBuf>, ocr: OcrSettings) -> Self {
        Self { library_dir, ocr }
    }

    fn bind(&self) -> Result<Pdfium, ModelError> {
        let bindings = match &self.library_dir {
            Some(dir) => {
                let lib = Pdfium::pdfium_platform_library_name_at_path(dir);
                let shown = format!("{:?}", lib);
                info!("Binding pdfium from {}", shown);
                Pdfium::bind_to_library(lib).map_err(|e| {
                    ModelError::Load(format!("cannot bind pdfium at {}: {:?}", shown, e))
                })?
            }
            None => {
                info!("Binding system pdfium library");
                Pdfium::bind_to_system_library()
                    .map_err(|e| ModelError::Load(format!("cannot bind system pdfium: {:?}", e)))?
            }
        };
        Ok(Pdfium::new(bindings))
    }

    fn build_ocr(&self) -> Result<Option<Arc<dyn OcrEngine>>, ModelError> {
        match self.ocr.backend {
            OcrBackend::Disabled => Ok(None),
            OcrBackend::Vision => {
                let engine = VisionOcr::from_settings(&self.ocr)?;
                Ok(Some(Arc::new(engine) as Arc<dyn OcrEngine>))
            }
            OcrBackend::Auto => match VisionOcr::from_settings(&self.ocr) {
                Ok(engine) => Ok(Some(Arc::new(engine) as Arc<dyn OcrEngine>)),
                Err(e) => {
                    warn!("No OCR engine available, scanned pages will be reported as images: {e}");
                    Ok(None)
                }
            },
        }
    }
}

impl ModelLoader for PdfiumLoader {
    fn load(&self) -> Result<LoadedModels, ModelError> {
        let pdfium = self.bind()?;
        let ocr = self.build_ocr()?;
        Ok(LoadedModels::new(
            Arc::new(PdfiumLayout::new(pdfium)),
            ocr,
        ))
    }
}

/// Layout model over a bound pdfium library.
pub struct PdfiumLayout {
    pdfium: Pdfium,
}

impl PdfiumLayout {
    pub fn new(pdfium: Pdfium) -> Self {
        Self { pdfium }
    }
}

impl LayoutModel for PdfiumLayout {
    fn version(&self) -> &str {
        PDFIUM_MODEL_VERSION
    }

    fn open<'a>(&'a self, bytes: &'a [u8]) -> Result<Box<dyn DocumentSession + 'a>, ModelError> {
        let document = self
            .pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| ModelError::Document(format!("{:?}", e)))?;
        Ok(Box::new(PdfiumSession { document }))
    }
}

struct PdfiumSession<'a> {
    document: PdfDocument<'a>,
}

impl<'a> PdfiumSession<'a> {
    fn page(&self, index: usize) -> Result<PdfPage<'a>, ModelError> {
        self.document
            .pages()
            .get(index as u16)
            .map_err(|e| ModelError::Page {
                page: index + 1,
                detail: format!("{:?}", e),
            })
    }
}

impl DocumentSession for PdfiumSession<'_> {
    fn page_count(&self) -> usize {
        self.document.pages().len() as usize
    }

    fn extract_text(&self, index: usize) -> Result<String, ModelError> {
        let page = self.page(index)?;
        let text = page.text().map_err(|e| ModelError::Page {
            page: index + 1,
            detail: format!("text layer unreadable: {:?}", e),
        })?;
        Ok(text.all())
    }

    fn render(&self, index: usize, max_pixels: u32) -> Result<DynamicImage, ModelError> {
        let page = self.page(index)?;
        let render_config = PdfRenderConfig::new()
            .set_target_width(max_pixels as i32)
            .set_maximum_height(max_pixels as i32);

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| ModelError::Page {
                page: index + 1,
                detail: format!("rasterisation failed: {:?}", e),
            })?;

        Ok(bitmap.as_image())
    }
}
