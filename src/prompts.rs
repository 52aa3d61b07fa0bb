//! Prompts for the vision-LLM OCR engine.
//!
//! Callers can override the default via [`crate::config::OcrSettings::system_prompt`];
//! the constant here is used only when no override is provided.

/// Default system prompt for transcribing one rendered page.
///
/// The engine only replaces a missing text layer, so the prompt asks for a
/// faithful transcription rather than a restyled document.
pub const DEFAULT_OCR_PROMPT: &str = r#"You are an OCR engine. The image is one page of a scanned document.

Transcribe the text on the page exactly as written:

- Keep the reading order a human would use, column by column.
- Keep paragraph breaks as blank lines and headings on their own line.
- Render tables as GFM pipe tables and lists with - or 1. markers.
- Do not translate, summarise, correct or explain anything.
- Do not describe images; skip purely decorative elements.
- If the page holds no legible text, output nothing.

Output only the transcribed text, with no code fence around it."#;

/// The prompt to send: the override when set and non-blank, else the default.
pub fn ocr_prompt(custom: Option<&str>) -> &str {
    match custom {
        Some(p) if !p.trim().is_empty() => p,
        _ => DEFAULT_OCR_PROMPT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_forbids_rewriting() {
        assert!(DEFAULT_OCR_PROMPT.contains("exactly as written"));
        assert!(DEFAULT_OCR_PROMPT.contains("Do not translate"));
    }

    #[test]
    fn blank_override_falls_back_to_default() {
        assert_eq!(ocr_prompt(None), DEFAULT_OCR_PROMPT);
        assert_eq!(ocr_prompt(Some("   ")), DEFAULT_OCR_PROMPT);
        assert_eq!(ocr_prompt(Some("read it")), "read it");
    }
}
