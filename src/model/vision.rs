//! Vision-LLM OCR engine.
//!
//! A page that reached the fallback path is encoded as a lossless PNG and
//! sent to a vision model with a transcription prompt. One call per page,
//! bounded by `api_timeout_secs`, never retried: a retry could outlive the
//! job's deadline, and a failed page is already reported in place.
//!
//! ## Provider resolution
//!
//! From most to least specific:
//!
//! 1. `OcrSettings::provider_name` (+ `model`, default `gpt-4.1-nano`)
//! 2. `EDGEQUAKE_LLM_PROVIDER` and `EDGEQUAKE_MODEL`, both non-empty
//! 3. `OPENAI_API_KEY` present → OpenAI
//! 4. [`ProviderFactory::from_env`] auto-detection

use super::OcrEngine;
use crate::config::OcrSettings;
use crate::error::ModelError;
use crate::prompts::ocr_prompt;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use image::DynamicImage;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_VISION_MODEL: &str = "gpt-4.1-nano";

/// OCR through an edgequake-llm vision provider.
pub struct VisionOcr {
    provider: Arc<dyn LLMProvider>,
    label: String,
    settings: OcrSettings,
}

impl VisionOcr {
    /// Wrap an already configured provider. `label` names it in logs.
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>, settings: OcrSettings) -> Self {
        Self {
            provider,
            label: label.into(),
            settings,
        }
    }

    /// Resolve a provider from `settings` and the environment.
    pub fn from_settings(settings: &OcrSettings) -> Result<Self, ModelError> {
        let (provider, label) = resolve_provider(settings)?;
        info!("OCR engine: {}", label);
        Ok(Self::new(provider, label, settings.clone()))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.settings.temperature),
            max_tokens: Some(self.settings.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl OcrEngine for VisionOcr {
    fn name(&self) -> &str {
        &self.label
    }

    async fn recognize(&self, page_num: usize, image: &DynamicImage) -> Result<String, ModelError> {
        let start = Instant::now();
        let data = encode_page(image).map_err(|e| ModelError::Ocr(format!("PNG encoding: {e}")))?;

        let messages = vec![
            ChatMessage::system(ocr_prompt(self.settings.system_prompt.as_deref())),
            ChatMessage::user_with_images("", vec![data]),
        ];
        let options = self.options();
        let secs = self.settings.api_timeout_secs;

        let response = tokio::time::timeout(
            Duration::from_secs(secs),
            self.provider.chat(&messages, Some(&options)),
        )
        .await
        .map_err(|_| {
            warn!("Page {}: OCR call exceeded {}s", page_num, secs);
            ModelError::OcrTimeout { secs }
        })?
        .map_err(|e| ModelError::Ocr(e.to_string()))?;

        debug!(
            "Page {}: OCR {} input tokens, {} output tokens, {:?}",
            page_num,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(response.content)
    }
}

/// Encode a rendered page as a base64 PNG image attachment.
///
/// PNG keeps glyph edges intact; `detail: "high"` lets the model see small print.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    let b64 = STANDARD.encode(&buf);
    debug!("Encoded page image: {} bytes base64", b64.len());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

type Resolved = (Arc<dyn LLMProvider>, String);

fn create_provider(name: &str, model: &str) -> Result<Resolved, ModelError> {
    let provider = ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        ModelError::Load(format!("OCR provider '{name}' not configured: {e}"))
    })?;
    Ok((provider, format!("{name}/{model}")))
}

fn resolve_provider(settings: &OcrSettings) -> Result<Resolved, ModelError> {
    let model = settings.model.as_deref().unwrap_or(DEFAULT_VISION_MODEL);

    if let Some(ref name) = settings.provider_name {
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_provider("openai", model);
    }

    let (provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
        ModelError::Load(format!(
            "no OCR provider could be detected from the environment \
             (set OPENAI_API_KEY, ANTHROPIC_API_KEY, or EDGEQUAKE_LLM_PROVIDER): {e}"
        ))
    })?;
    Ok((provider, "auto".to_string()))
}
