use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pixelrelay_contracts::config::{api_base_from_env, non_empty_env, PollConfig};
use pixelrelay_contracts::providers::ProviderKind;
use pixelrelay_contracts::request::GenerationRequest;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

use super::{nearest_aspect_ratio, ImageProvider, COMMON_ASPECT_RATIOS};
use crate::error::RelayError;
use crate::http::{response_json_or_error, send_with_transport_retries};

pub const DEFAULT_NANO_BANANA_MODEL: &str = "gemini-2.5-flash-image";
const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const RETRY_BACKOFF: Duration = Duration::from_millis(1200);
const PROVIDER: &str = "Gemini";

/// Gemini image generation ("Nano Banana"). Output images come back inline
/// and are returned as `data:` URLs.
pub struct NanoBananaProvider {
    api_base: String,
    api_key: Option<String>,
    model: String,
    config: PollConfig,
    http: HttpClient,
}

impl NanoBananaProvider {
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        config: PollConfig,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            config,
            http: HttpClient::new(),
        }
    }

    pub fn from_env(config: PollConfig) -> Self {
        Self::new(
            api_base_from_env("GEMINI_API_BASE", DEFAULT_API_BASE),
            non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY")),
            non_empty_env("NANO_BANANA_MODEL")
                .unwrap_or_else(|| DEFAULT_NANO_BANANA_MODEL.to_string()),
            config,
        )
    }

    fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// Each reference image is followed by its own guidance text; the prompt
    /// comes last.
    fn build_payload(request: &GenerationRequest) -> Value {
        let mut parts = Vec::new();
        for (idx, image) in request.images.iter().enumerate() {
            parts.push(json!({
                "inlineData": {
                    "mimeType": image.asset.content_type,
                    "data": BASE64.encode(&image.asset.bytes),
                }
            }));
            if let Some(guidance) = image.guidance.as_deref() {
                parts.push(json!({ "text": format!("Image {}: {}", idx + 1, guidance) }));
            }
        }
        let mut prompt = request.prompt.trim().to_string();
        if let Some(negative) = request.negative_prompt() {
            prompt.push_str(&format!("\nAvoid: {negative}"));
        }
        parts.push(json!({ "text": prompt }));

        let mut generation_config = json!({ "responseModalities": ["IMAGE", "TEXT"] });
        let ratio = request
            .size
            .aspect_ratio
            .as_deref()
            .or(request.size.size.as_deref())
            .and_then(|raw| nearest_aspect_ratio(raw, &COMMON_ASPECT_RATIOS));
        if let Some(ratio) = ratio {
            generation_config["imageConfig"] = json!({ "aspectRatio": ratio });
        }

        json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": generation_config,
        })
    }

    fn extract_image_urls(body: &Value) -> Vec<String> {
        let mut out = Vec::new();
        let candidates = body
            .get("candidates")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for candidate in candidates {
            let parts = candidate
                .pointer("/content/parts")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for part in parts {
                let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
                    continue;
                };
                let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let mime = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                out.push(format!("data:{mime};base64,{data}"));
            }
        }
        out
    }

    fn empty_reason(body: &Value) -> String {
        if let Some(reason) = body.pointer("/promptFeedback/blockReason").and_then(Value::as_str) {
            return format!("prompt blocked ({reason})");
        }
        if let Some(reason) = body
            .pointer("/candidates/0/finishReason")
            .and_then(Value::as_str)
        {
            return format!("no image returned (finish reason {reason})");
        }
        "no image returned".to_string()
    }
}

#[async_trait]
impl ImageProvider for NanoBananaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::NanoBanana
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<String>, RelayError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(RelayError::MissingCredential {
                env: "GEMINI_API_KEY",
            });
        };
        let endpoint = self.endpoint();
        let payload = Self::build_payload(request);
        tracing::info!(model = %self.model, images = request.images.len(), "gemini request");

        let response = send_with_transport_retries(
            PROVIDER,
            &endpoint,
            self.config.transient_retries,
            RETRY_BACKOFF,
            || {
                self.http
                    .post(&endpoint)
                    .query(&[("key", api_key)])
                    .timeout(self.config.request_timeout)
                    .json(&payload)
            },
        )
        .await?;
        let body = response_json_or_error(PROVIDER, response).await?;
        let urls = Self::extract_image_urls(&body);
        if urls.is_empty() {
            return Err(RelayError::invalid_response(PROVIDER, Self::empty_reason(&body)));
        }
        Ok(urls)
    }
}
