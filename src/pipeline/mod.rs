//! The conversion pipeline: document bytes + loaded model → [`ExtractionResult`].
//!
//! ## Data Flow
//!
//! ```text
//! bytes ──▶ extract ──────────────▶ fallback ──────────▶ ExtractionResult
//!          (%PDF- check,            (OCR for rendered
//!           pdfium text/render)      pages, reordered)
//! ```
//!
//! 1. [`extract`] : header sniff, then the layout-model pass on the
//!    blocking pool
//! 2. [`fallback`]: concurrent OCR for pages without a usable text layer,
//!    results slotted back into source order
//! 3. [`postprocess`]: deterministic cleanup applied to every page's text
//!
//! The pipeline holds no per-job state; one instance serves every job.

pub mod extract;
pub mod fallback;
pub mod postprocess;

use crate::config::{DispatcherConfig, OcrTrigger};
use crate::error::DispatchError;
use crate::model::{ModelHandle, PrimaryPass};
use crate::output::ExtractionResult;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Stateless page-by-page extraction strategy.
#[derive(Debug, Clone)]
pub struct ConversionPipeline {
    trigger: OcrTrigger,
    max_rendered_pixels: u32,
    ocr_concurrency: usize,
}

impl ConversionPipeline {
    pub fn new(trigger: OcrTrigger, max_rendered_pixels: u32, ocr_concurrency: usize) -> Self {
        Self {
            trigger,
            max_rendered_pixels,
            ocr_concurrency,
        }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(
            config.ocr_trigger,
            config.max_rendered_pixels,
            config.ocr_concurrency,
        )
    }

    /// Convert one document. The model must already be `Ready`.
    ///
    /// Returns `MalformedDocument` when the page structure cannot be
    /// determined; individual page failures are embedded in the result.
    pub async fn execute(
        &self,
        models: &Arc<ModelHandle>,
        source: Arc<[u8]>,
        cancel: CancellationToken,
    ) -> Result<ExtractionResult, DispatchError> {
        extract::check_header(&source)?;

        let loaded = models.models()?;
        let ocr = if self.trigger.allows_ocr() {
            loaded.ocr.clone()
        } else {
            None
        };
        let pass = PrimaryPass {
            trigger: self.trigger,
            render_fallback: ocr.is_some(),
            max_rendered_pixels: self.max_rendered_pixels,
        };

        let raw = extract::primary_pass(Arc::clone(models), source, pass, cancel.clone()).await?;
        let pages = fallback::resolve_pages(raw, ocr, self.ocr_concurrency, &cancel).await?;
        debug!(pages = pages.len(), "pipeline complete");

        Ok(ExtractionResult {
            model_version: loaded.layout.version().to_string(),
            pages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_bytes_rejected_before_model_use() {
        struct NeverLoads;
        impl crate::model::ModelLoader for NeverLoads {
            fn load(&self) -> Result<crate::model::LoadedModels, crate::error::ModelError> {
                Err(crate::error::ModelError::Load("unused".into()))
            }
        }

        let handle = Arc::new(ModelHandle::new(Arc::new(NeverLoads)));
        let pipeline = ConversionPipeline::from_config(&DispatcherConfig::default());
        let err = pipeline
            .execute(&handle, Arc::from(&b"%PD"[..]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MalformedDocument { .. }));
        assert_eq!(handle.loads_started(), 0);
    }
}
