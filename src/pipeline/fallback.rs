//! Fallback extraction: OCR for pages the primary pass rendered.
//!
//! OCR calls run concurrently (`buffer_unordered`), so they finish in any
//! order. Every page owns a slot indexed by its position in the document,
//! which puts the results back in source order no matter which call
//! returned first.

use super::postprocess::{clean_ocr, clean_text};
use crate::config::text_chars;
use crate::error::{DispatchError, ModelError, PageError};
use crate::model::{OcrEngine, RawPage};
use crate::output::{PageContent, PageResult};
use futures::stream::{self, StreamExt, TryStreamExt};
use image::DynamicImage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Turn primary-pass output into final page results, running OCR where needed.
pub async fn resolve_pages(
    raw: Vec<RawPage>,
    ocr: Option<Arc<dyn OcrEngine>>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Vec<PageResult>, DispatchError> {
    let mut slots: Vec<Option<PageContent>> = Vec::with_capacity(raw.len());
    let mut pending: Vec<(usize, DynamicImage, String)> = Vec::new();

    for (index, page) in raw.into_iter().enumerate() {
        let content = match page {
            RawPage::Text(text) => Some(PageContent::TextLayer {
                text: clean_text(&text),
            }),
            RawPage::ImageOnly { text_chars } => Some(PageContent::RenderedImage { text_chars }),
            RawPage::Failed(error) => {
                warn!(page = error.page(), "{}", error);
                Some(PageContent::Failed { error })
            }
            RawPage::Image { image, text_layer } => {
                if ocr.is_some() {
                    pending.push((index, image, text_layer));
                    None
                } else {
                    keep_text_layer(&text_layer).or(Some(PageContent::RenderedImage { text_chars: 0 }))
                }
            }
        };
        slots.push(content);
    }

    if let (Some(engine), false) = (ocr, pending.is_empty()) {
        debug!(pages = pending.len(), engine = engine.name(), "running OCR fallback");
        let recognised: Vec<(usize, PageContent)> = stream::iter(pending)
            .map(|(index, image, text_layer)| {
                let engine = Arc::clone(&engine);
                let cancel = cancel.clone();
                async move { ocr_page(engine.as_ref(), index, image, text_layer, &cancel).await }
            })
            .buffer_unordered(concurrency.max(1))
            .try_collect()
            .await?;

        for (index, content) in recognised {
            slots[index] = Some(content);
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.map(|content| PageResult {
                page_num: index + 1,
                content,
            })
            .ok_or_else(|| DispatchError::Internal(format!("page {} produced no result", index + 1)))
        })
        .collect()
}

async fn ocr_page(
    engine: &dyn OcrEngine,
    index: usize,
    image: DynamicImage,
    text_layer: String,
    cancel: &CancellationToken,
) -> Result<(usize, PageContent), DispatchError> {
    let page = index + 1;
    let recognised = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
        r = engine.recognize(page, &image) => r,
    };

    let error = match recognised {
        Ok(text) => {
            let content = PageContent::OcrText {
                text: clean_ocr(&text),
            };
            return Ok((index, content));
        }
        Err(ModelError::OcrTimeout { secs }) => PageError::OcrTimeout { page, secs },
        Err(e) => PageError::OcrFailed {
            page,
            detail: e.to_string(),
        },
    };

    let content = match keep_text_layer(&text_layer) {
        Some(content) => {
            warn!(page, "{error}; keeping the text layer");
            content
        }
        None => {
            warn!(page, "{error}");
            PageContent::Failed { error }
        }
    };
    Ok((index, content))
}

/// The page's own text, if it has any.
fn keep_text_layer(text_layer: &str) -> Option<PageContent> {
    (text_chars(text_layer) > 0).then(|| PageContent::TextLayer {
        text: clean_text(text_layer),
    })
}
