//! Result types: what a conversion produces and how it is reported.
//!
//! [`ExtractionResult`] is deliberately free of timing data so that the same
//! document run through the same model version serialises byte-identically.
//! Timing and counters live in [`ConversionStats`], next to the result in
//! [`ConversionOutcome::Success`].

use crate::config::PageSeparator;
use crate::error::{ErrorKind, PageError};
use crate::job::{JobId, JobState};
use serde::{Deserialize, Serialize};

/// What one page turned into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageContent {
    /// Text read from the page's native text layer.
    TextLayer { text: String },
    /// The page has no text layer and no OCR text for it.
    /// `text_chars` counts the non-whitespace characters the layer had.
    RenderedImage { text_chars: usize },
    /// Text recognised by the OCR engine from the rendered page.
    OcrText { text: String },
    /// The page failed; the rest of the document is unaffected.
    Failed { error: PageError },
}

impl PageContent {
    /// Text carried by this page, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            PageContent::TextLayer { text } | PageContent::OcrText { text } => Some(text),
            PageContent::RenderedImage { .. } | PageContent::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PageContent::Failed { .. })
    }
}

/// Result for a single page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-indexed page number in source order.
    pub page_num: usize,
    pub content: PageContent,
}

/// Every page of the source document, exactly once, in source order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Version string of the layout model that produced this result.
    pub model_version: String,
    pub pages: Vec<PageResult>,
}

impl ExtractionResult {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn text_layer_pages(&self) -> usize {
        self.count(|c| matches!(c, PageContent::TextLayer { .. }))
    }

    pub fn ocr_pages(&self) -> usize {
        self.count(|c| matches!(c, PageContent::OcrText { .. }))
    }

    pub fn image_only_pages(&self) -> usize {
        self.count(|c| matches!(c, PageContent::RenderedImage { .. }))
    }

    pub fn failed_pages(&self) -> usize {
        self.count(PageContent::is_failed)
    }

    /// Page-level errors, in page order.
    pub fn page_errors(&self) -> impl Iterator<Item = &PageError> {
        self.pages.iter().filter_map(|p| match &p.content {
            PageContent::Failed { error } => Some(error),
            _ => None,
        })
    }

    /// Assemble the text-bearing pages into one Markdown document.
    ///
    /// Image-only and failed pages contribute nothing; the separator is
    /// rendered with the page number of the page that follows it.
    pub fn to_markdown(&self, separator: &PageSeparator) -> String {
        let mut parts: Vec<String> = Vec::new();
        let text_pages = self
            .pages
            .iter()
            .filter_map(|p| p.content.text().map(|t| (p.page_num, t)));

        for (i, (page_num, text)) in text_pages.enumerate() {
            if i > 0 {
                parts.push(separator.render(page_num));
            }
            parts.push(text.trim_end().to_string());
        }

        let mut out = parts.join("");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    fn count(&self, pred: impl Fn(&PageContent) -> bool) -> usize {
        self.pages.iter().filter(|p| pred(&p.content)).count()
    }
}

/// Timing and counters for one finished job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionStats {
    pub total_pages: usize,
    pub text_layer_pages: usize,
    pub ocr_pages: usize,
    pub image_only_pages: usize,
    pub failed_pages: usize,
    /// Time between submission and gate admission.
    pub queue_wait_ms: u64,
    /// Time between admission and the pipeline finishing.
    pub run_ms: u64,
    pub total_duration_ms: u64,
}

impl ConversionStats {
    pub fn for_result(result: &ExtractionResult, queue_wait_ms: u64, run_ms: u64) -> Self {
        Self {
            total_pages: result.page_count(),
            text_layer_pages: result.text_layer_pages(),
            ocr_pages: result.ocr_pages(),
            image_only_pages: result.image_only_pages(),
            failed_pages: result.failed_pages(),
            queue_wait_ms,
            run_ms,
            total_duration_ms: queue_wait_ms + run_ms,
        }
    }
}

/// The single terminal outcome of a submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConversionOutcome {
    Success {
        result: ExtractionResult,
        stats: ConversionStats,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
    /// The deadline expired; no partial result is ever returned.
    TimedOut { deadline_ms: u64 },
    Cancelled,
}

impl ConversionOutcome {
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        ConversionOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ConversionOutcome::Success { .. })
    }

    /// The extraction result, if the job succeeded.
    pub fn result(&self) -> Option<&ExtractionResult> {
        match self {
            ConversionOutcome::Success { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Error kind for any non-successful outcome.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ConversionOutcome::Success { .. } => None,
            ConversionOutcome::Failure { kind, .. } => Some(*kind),
            ConversionOutcome::TimedOut { .. } => Some(ErrorKind::TimedOut),
            ConversionOutcome::Cancelled => Some(ErrorKind::Cancelled),
        }
    }

    /// The terminal job state this outcome corresponds to.
    pub fn terminal_state(&self) -> JobState {
        match self {
            ConversionOutcome::Success { .. } => JobState::Succeeded,
            ConversionOutcome::Failure { .. } => JobState::Failed,
            ConversionOutcome::TimedOut { .. } => JobState::TimedOut,
            ConversionOutcome::Cancelled => JobState::Cancelled,
        }
    }

    /// Translate into the payload an HTTP layer sends back.
    pub fn into_response(self, job_id: JobId) -> ConversionResponse {
        match self {
            ConversionOutcome::Success { result, stats } => ConversionResponse {
                job_id,
                status: ResponseStatus::Ok,
                http_status: 200,
                result: Some(result),
                stats: Some(stats),
                error: None,
            },
            ConversionOutcome::Failure { kind, message } => ConversionResponse {
                job_id,
                status: ResponseStatus::Error,
                http_status: failure_http_status(kind),
                result: None,
                stats: None,
                error: Some(ResponseError { kind, message }),
            },
            ConversionOutcome::TimedOut { deadline_ms } => ConversionResponse {
                job_id,
                status: ResponseStatus::DeadlineExceeded,
                http_status: 504,
                result: None,
                stats: None,
                error: Some(ResponseError {
                    kind: ErrorKind::TimedOut,
                    message: format!("conversion exceeded its {deadline_ms}ms deadline"),
                }),
            },
            ConversionOutcome::Cancelled => ConversionResponse {
                job_id,
                status: ResponseStatus::Cancelled,
                http_status: 499,
                result: None,
                stats: None,
                error: Some(ResponseError {
                    kind: ErrorKind::Cancelled,
                    message: "conversion cancelled".to_string(),
                }),
            },
        }
    }
}

fn failure_http_status(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::MalformedDocument | ErrorKind::InvalidInput => 400,
        ErrorKind::ModelUnavailable | ErrorKind::ResourceExhausted => 503,
        ErrorKind::TimedOut => 504,
        ErrorKind::Cancelled => 499,
        ErrorKind::PageExtractionFailed | ErrorKind::Internal => 500,
    }
}

/// Wire-level status of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
    DeadlineExceeded,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Serialisable response for a request/response front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResponse {
    pub job_id: JobId,
    pub status: ResponseStatus,
    pub http_status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExtractionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ConversionStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExtractionResult {
        ExtractionResult {
            model_version: "test/1".into(),
            pages: vec![
                PageResult {
                    page_num: 1,
                    content: PageContent::TextLayer {
                        text: "# Intro\n".into(),
                    },
                },
                PageResult {
                    page_num: 2,
                    content: PageContent::RenderedImage { text_chars: 0 },
                },
                PageResult {
                    page_num: 3,
                    content: PageContent::OcrText {
                        text: "Scanned body".into(),
                    },
                },
                PageResult {
                    page_num: 4,
                    content: PageContent::Failed {
                        error: PageError::ExtractionFailed {
                            page: 4,
                            detail: "bad stream".into(),
                        },
                    },
                },
            ],
        }
    }

    #[test]
    fn counts_by_kind() {
        let r = sample();
        assert_eq!(r.page_count(), 4);
        assert_eq!(r.text_layer_pages(), 1);
        assert_eq!(r.image_only_pages(), 1);
        assert_eq!(r.ocr_pages(), 1);
        assert_eq!(r.failed_pages(), 1);
        assert_eq!(r.page_errors().map(PageError::page).collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn markdown_skips_pages_without_text() {
        let md = sample().to_markdown(&PageSeparator::Comment);
        assert_eq!(md, "# Intro\n\n<!-- page 3 -->\n\nScanned body\n");
    }

    #[test]
    fn empty_result_renders_empty_markdown() {
        let r = ExtractionResult {
            model_version: "test/1".into(),
            pages: vec![],
        };
        assert_eq!(r.to_markdown(&PageSeparator::None), "");
    }

    #[test]
    fn page_content_serialises_with_kind_tag() {
        let json = serde_json::to_string(&PageContent::RenderedImage { text_chars: 3 }).unwrap();
        assert_eq!(json, r#"{"kind":"rendered_image","text_chars":3}"#);
    }

    #[test]
    fn responses_are_distinguishable() {
        let id = JobId::new();
        let timed_out = ConversionOutcome::TimedOut { deadline_ms: 100 }.into_response(id);
        assert_eq!(timed_out.status, ResponseStatus::DeadlineExceeded);
        assert_eq!(timed_out.http_status, 504);

        let cancelled = ConversionOutcome::Cancelled.into_response(id);
        assert_eq!(cancelled.status, ResponseStatus::Cancelled);
        assert_eq!(cancelled.http_status, 499);

        let malformed =
            ConversionOutcome::failure(ErrorKind::MalformedDocument, "truncated").into_response(id);
        assert_eq!(malformed.http_status, 400);
        assert_eq!(malformed.error.unwrap().kind, ErrorKind::MalformedDocument);

        let unavailable =
            ConversionOutcome::failure(ErrorKind::ModelUnavailable, "no lib").into_response(id);
        assert_eq!(unavailable.http_status, 503);
    }

    #[test]
    fn success_response_carries_result() {
        let r = sample();
        let stats = ConversionStats::for_result(&r, 5, 20);
        assert_eq!(stats.total_duration_ms, 25);
        assert_eq!(stats.failed_pages, 1);
        let resp = ConversionOutcome::Success { result: r.clone(), stats }.into_response(JobId::new());
        assert_eq!(resp.status, ResponseStatus::Ok);
        assert_eq!(resp.result, Some(r));
        assert!(resp.error.is_none());
    }

    #[test]
    fn outcome_terminal_states() {
        assert_eq!(ConversionOutcome::Cancelled.terminal_state(), JobState::Cancelled);
        assert_eq!(
            ConversionOutcome::TimedOut { deadline_ms: 1 }.terminal_state(),
            JobState::TimedOut
        );
        assert_eq!(
            ConversionOutcome::failure(ErrorKind::Internal, "x").error_kind(),
            Some(ErrorKind::Internal)
        );
    }
}
