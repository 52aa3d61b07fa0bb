//! Deterministic text cleanup.
//!
//! Both extraction paths hand back text with artefacts that vary by source:
//! pdfium text layers carry `\r\n` and soft hyphens, OCR output is sometimes
//! wrapped in a ```markdown fence despite the prompt. These passes are pure
//! `&str → String` functions, so the same input always cleans to the same
//! output.
//!
//! Order matters: line endings are normalised before trimming, and fences
//! are stripped before anything looks at line structure.

use once_cell::sync::Lazy;
use regex::Regex;

/// Cleanup applied to native text-layer output.
pub fn clean_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    collapse_blank_lines(&s).trim_matches('\n').to_string()
}

/// Cleanup applied to OCR output: everything [`clean_text`] does, after
/// stripping an outer code fence.
pub fn clean_ocr(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_outer_fence(&s);
    clean_text(&s)
}

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md|text)?\n(.*)\n```\s*$").unwrap());

fn strip_outer_fence(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// At most one blank line between paragraphs.
fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").into_owned()
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{0000}',
        ],
        "",
    )
}
