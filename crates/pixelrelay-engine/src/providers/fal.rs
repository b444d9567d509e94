use std::time::Duration;

use async_trait::async_trait;
use pixelrelay_contracts::config::{api_base_from_env, non_empty_env, PollConfig};
use pixelrelay_contracts::output::flatten_output_urls;
use pixelrelay_contracts::providers::ProviderKind;
use pixelrelay_contracts::request::GenerationRequest;
use reqwest::header::AUTHORIZATION;
use reqwest::Client as HttpClient;
use serde_json::{json, Map, Value};

use super::{nearest_aspect_ratio, ImageProvider};
use crate::error::RelayError;
use crate::http::{data_url, parse_dims, response_json_or_error, send_with_transport_retries};

pub const DEFAULT_FAL_MODEL: &str = "fal-ai/bytedance/seedream/v4/text-to-image";
pub const DEFAULT_FAL_EDIT_MODEL: &str = "fal-ai/bytedance/seedream/v4/edit";
const DEFAULT_API_BASE: &str = "https://fal.run";
const RETRY_BACKOFF: Duration = Duration::from_millis(1200);

const FAL_IMAGE_SIZES: [(&str, f64); 5] = [
    ("square_hd", 1.0),
    ("portrait_4_3", 3.0 / 4.0),
    ("portrait_16_9", 9.0 / 16.0),
    ("landscape_4_3", 4.0 / 3.0),
    ("landscape_16_9", 16.0 / 9.0),
];

/// fal.ai synchronous endpoints: one POST, outputs in the response body.
pub struct FalProvider {
    api_base: String,
    api_key: Option<String>,
    model: String,
    edit_model: String,
    config: PollConfig,
    http: HttpClient,
}

impl FalProvider {
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        edit_model: impl Into<String>,
        config: PollConfig,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            edit_model: edit_model.into(),
            config,
            http: HttpClient::new(),
        }
    }

    pub fn from_env(config: PollConfig) -> Self {
        Self::new(
            api_base_from_env("FAL_API_BASE", DEFAULT_API_BASE),
            non_empty_env("FAL_KEY").or_else(|| non_empty_env("FAL_API_KEY")),
            non_empty_env("FAL_MODEL").unwrap_or_else(|| DEFAULT_FAL_MODEL.to_string()),
            non_empty_env("FAL_EDIT_MODEL").unwrap_or_else(|| DEFAULT_FAL_EDIT_MODEL.to_string()),
            config,
        )
    }

    /// Edit endpoint when reference images are attached, text-to-image otherwise.
    fn endpoint(&self, request: &GenerationRequest) -> String {
        let model = if request.images.is_empty() {
            &self.model
        } else {
            &self.edit_model
        };
        let model = model.trim();
        if model.starts_with("http://") || model.starts_with("https://") {
            return model.to_string();
        }
        format!("{}/{}", self.api_base, model.trim_start_matches('/'))
    }

    fn build_payload(request: &GenerationRequest) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert(
            "prompt".to_string(),
            Value::String(request.prompt_with_guidance()),
        );
        if let Some(negative) = request.negative_prompt() {
            payload.insert("negative_prompt".to_string(), json!(negative));
        }
        if !request.images.is_empty() {
            let urls: Vec<Value> = request
                .images
                .iter()
                .map(|image| Value::String(data_url(&image.asset)))
                .collect();
            payload.insert("image_urls".to_string(), Value::Array(urls));
        }
        let explicit = request.size.size.as_deref().and_then(parse_dims);
        if let Some((width, height)) = explicit {
            payload.insert(
                "image_size".to_string(),
                json!({"width": width, "height": height}),
            );
        } else if let Some(preset) = request
            .size
            .aspect_ratio
            .as_deref()
            .and_then(|raw| nearest_aspect_ratio(raw, &FAL_IMAGE_SIZES))
        {
            payload.insert("image_size".to_string(), json!(preset));
        }
        payload
    }
}

#[async_trait]
impl ImageProvider for FalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Fal
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<String>, RelayError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(RelayError::MissingCredential { env: "FAL_KEY" });
        };
        let endpoint = self.endpoint(request);
        let payload = Value::Object(Self::build_payload(request));
        tracing::info!(endpoint = %endpoint, images = request.images.len(), "fal request");

        let response = send_with_transport_retries(
            "Fal",
            &endpoint,
            self.config.transient_retries,
            RETRY_BACKOFF,
            || {
                self.http
                    .post(&endpoint)
                    .header(AUTHORIZATION, format!("Key {api_key}"))
                    .timeout(self.config.request_timeout)
                    .json(&payload)
            },
        )
        .await?;
        let body = response_json_or_error("Fal", response).await?;
        let urls = flatten_output_urls(&body);
        if urls.is_empty() {
            return Err(RelayError::invalid_response("Fal", "response returned no image URLs"));
        }
        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;
    use pixelrelay_contracts::config::PollConfig;
    use pixelrelay_contracts::request::{GenerationRequest, ImageAsset, ReferenceImage};
    use serde_json::json;

    use super::FalProvider;
    use crate::error::RelayError;
    use crate::providers::ImageProvider;

    fn provider(base: &str, key: Option<&str>) -> FalProvider {
        FalProvider::new(
            base,
            key.map(str::to_string),
            "fal-ai/seedream/text",
            "fal-ai/seedream/edit",
            PollConfig::default(),
        )
    }

    #[test]
    fn payload_maps_size_hints_to_fal_presets() {
        let mut request = GenerationRequest::new("desert");
        request.size.aspect_ratio = Some("16:9".to_string());
        let payload = FalProvider::build_payload(&request);
        assert_eq!(payload["image_size"], "landscape_16_9");

        request.size.size = Some("1024x768".to_string());
        let payload = FalProvider::build_payload(&request);
        assert_eq!(payload["image_size"], json!({"width": 1024, "height": 768}));
    }

    #[test]
    fn reference_images_switch_to_edit_endpoint() {
        let provider = provider("https://fal.test/", Some("k"));
        let mut request = GenerationRequest::new("desert");
        assert_eq!(provider.endpoint(&request), "https://fal.test/fal-ai/seedream/text");
        request.images = vec![ReferenceImage::new(ImageAsset::unprobed(vec![9], "image/jpeg"))];
        assert_eq!(provider.endpoint(&request), "https://fal.test/fal-ai/seedream/edit");
    }

    #[tokio::test]
    async fn generate_posts_with_key_header_and_flattens_images() -> anyhow::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/fal-ai/seedream/edit")
            .match_header("authorization", "Key fal-secret")
            .match_body(Matcher::PartialJson(json!({
                "prompt": "restyle\nImage 1: keep the pose",
                "image_urls": ["data:image/jpeg;base64,CQ=="]
            })))
            .with_status(200)
            .with_body(
                json!({
                    "images": [
                        {"url": "https://v3.fal.media/files/a.png", "width": 1024},
                        {"url": "https://v3.fal.media/files/b.png"}
                    ],
                    "seed": 7
                })
                .to_string(),
            )
            .create_async()
            .await;

        let provider = provider(&server.url(), Some("fal-secret"));
        let mut request = GenerationRequest::new("restyle");
        request.images = vec![ReferenceImage::new(ImageAsset::unprobed(vec![9], "image/jpeg"))
            .with_guidance("keep the pose")];
        let urls = provider.generate(&request).await?;

        mock.assert_async().await;
        assert_eq!(
            urls,
            vec![
                "https://v3.fal.media/files/a.png",
                "https://v3.fal.media/files/b.png"
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/fal-ai/seedream/text")
            .with_status(401)
            .with_body("Unauthorized")
            .expect(1)
            .create_async()
            .await;
        let provider = provider(&server.url(), Some("bad"));
        let err = provider
            .generate(&GenerationRequest::new("desert"))
            .await
            .expect_err("unauthorized");
        mock.assert_async().await;
        assert!(matches!(err, RelayError::ProviderRejected { status: 401, .. }));
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let provider = provider("http://127.0.0.1:9", None);
        let err = provider
            .generate(&GenerationRequest::new("desert"))
            .await
            .expect_err("no key");
        assert!(matches!(err, RelayError::MissingCredential { env: "FAL_KEY" }));
    }
}
