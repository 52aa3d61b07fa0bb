//! Primary extraction: header check and the layout-model pass.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with internal thread-local state and CPU-bound
//! rendering. The pass runs on tokio's blocking pool so async workers never
//! stall on it. A blocking closure cannot be aborted, so the pass polls the
//! job's cancellation token at each page boundary instead; an abandoned job
//! stops within one page.

use crate::error::DispatchError;
use crate::model::{ModelHandle, PrimaryPass, RawPage};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Every PDF starts with this marker.
pub const PDF_MAGIC: &[u8] = b"%PDF-";

/// Reject byte streams that cannot be a PDF before touching the model.
pub fn check_header(bytes: &[u8]) -> Result<(), DispatchError> {
    if bytes.starts_with(PDF_MAGIC) {
        return Ok(());
    }
    let detail = if bytes.len() < PDF_MAGIC.len() {
        format!("truncated input: {} bytes, no PDF header", bytes.len())
    } else {
        let head = String::from_utf8_lossy(&bytes[..PDF_MAGIC.len()]);
        format!("missing %PDF- header (starts with {:?})", head)
    };
    Err(DispatchError::MalformedDocument { detail })
}

/// Run the layout model over every page on the blocking pool.
///
/// Page panics are contained by [`ModelHandle::invoke`]; a panic while
/// opening the document surfaces here as `Internal`.
pub async fn primary_pass(
    models: Arc<ModelHandle>,
    source: Arc<[u8]>,
    pass: PrimaryPass,
    cancel: CancellationToken,
) -> Result<Vec<RawPage>, DispatchError> {
    let bytes = source.len();
    let pages = tokio::task::spawn_blocking(move || models.invoke(&source, &pass, &cancel))
        .await
        .map_err(|e| DispatchError::Internal(format!("primary extraction panicked: {e}")))??;
    debug!(bytes, pages = pages.len(), "primary pass complete");
    Ok(pages)
}
