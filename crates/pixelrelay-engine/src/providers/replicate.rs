use std::sync::Arc;

use async_trait::async_trait;
use pixelrelay_contracts::cache::ModelVersionCache;
use pixelrelay_contracts::config::{api_base_from_env, non_empty_env, PollConfig};
use pixelrelay_contracts::providers::ProviderKind;
use pixelrelay_contracts::request::GenerationRequest;
use serde_json::{json, Map, Value};

use super::{nearest_aspect_ratio, ImageProvider, COMMON_ASPECT_RATIOS};
use crate::error::RelayError;
use crate::http::{data_url, parse_dims};
use crate::poller::{JobPoller, ReplicateTransport};

pub const DEFAULT_REPLICATE_MODEL: &str = "bytedance/seedream-4";
const DEFAULT_API_BASE: &str = "https://api.replicate.com/v1";

/// Seedream on Replicate, driven through the prediction submit/poll API.
pub struct ReplicateProvider {
    poller: JobPoller<ReplicateTransport>,
    model: String,
    versions: Arc<ModelVersionCache>,
}

impl ReplicateProvider {
    pub fn new(
        transport: ReplicateTransport,
        model: impl Into<String>,
        versions: Arc<ModelVersionCache>,
        poll: PollConfig,
    ) -> Self {
        Self {
            poller: JobPoller::new(transport, poll),
            model: model.into().trim().to_string(),
            versions,
        }
    }

    pub fn from_env(versions: Arc<ModelVersionCache>, poll: PollConfig) -> Self {
        let api_base = api_base_from_env("REPLICATE_API_BASE", DEFAULT_API_BASE);
        let token = non_empty_env("REPLICATE_API_TOKEN").or_else(|| non_empty_env("REPLICATE_API_KEY"));
        let model = non_empty_env("REPLICATE_MODEL").unwrap_or_else(|| DEFAULT_REPLICATE_MODEL.to_string());
        let transport = ReplicateTransport::new(api_base, token, poll.clone());
        Self::new(transport, model, versions, poll)
    }

    /// Version id for the configured model. `owner/name:version` is used
    /// as-is; bare `owner/name` is looked up once and memoized.
    pub async fn resolve_version(&self) -> Result<String, RelayError> {
        if let Some((_, version)) = self.model.split_once(':') {
            let version = version.trim();
            if !version.is_empty() {
                return Ok(version.to_string());
            }
        }
        let model = self.model.trim_end_matches(':').to_string();
        self.versions
            .resolve_or_fill(&model, || self.fetch_latest_version(&model))
            .await
    }

    async fn fetch_latest_version(&self, model: &str) -> Result<String, RelayError> {
        let url = format!("{}/models/{}", self.poller.transport().api_base(), model);
        let body = self.poller.transport().get_json(&url).await?;
        body.get("latest_version")
            .and_then(|version| version.get("id"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                RelayError::invalid_response("Replicate", format!("model {model} has no latest version"))
            })
    }

    fn build_input(request: &GenerationRequest) -> Map<String, Value> {
        let mut input = Map::new();
        input.insert(
            "prompt".to_string(),
            Value::String(request.prompt_with_guidance()),
        );
        if let Some(negative) = request.negative_prompt() {
            input.insert("negative_prompt".to_string(), json!(negative));
        }
        if !request.images.is_empty() {
            let images: Vec<Value> = request
                .images
                .iter()
                .map(|image| Value::String(data_url(&image.asset)))
                .collect();
            input.insert("image_input".to_string(), Value::Array(images));
        }
        if let Some(size) = request.size.size.as_deref().map(str::trim) {
            if let Some((width, height)) = parse_dims(size) {
                input.insert("size".to_string(), json!("custom"));
                input.insert("width".to_string(), json!(width));
                input.insert("height".to_string(), json!(height));
            } else if matches!(size.to_ascii_uppercase().as_str(), "1K" | "2K" | "4K") {
                input.insert("size".to_string(), json!(size.to_ascii_uppercase()));
            }
        }
        if let Some(ratio) = request
            .size
            .aspect_ratio
            .as_deref()
            .and_then(|raw| nearest_aspect_ratio(raw, &COMMON_ASPECT_RATIOS))
        {
            input.insert("aspect_ratio".to_string(), json!(ratio));
        }
        input
    }
}

#[async_trait]
impl ImageProvider for ReplicateProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Replicate
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<String>, RelayError> {
        let version = self.resolve_version().await?;
        let payload = json!({
            "version": version,
            "input": Self::build_input(request),
        });
        let endpoint = self.poller.transport().predictions_endpoint();
        let urls = self.poller.submit_and_await(&endpoint, &payload).await?;
        if urls.is_empty() {
            return Err(RelayError::invalid_response(
                "Replicate",
                "prediction returned no image URLs",
            ));
        }
        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use mockito::Matcher;
    use pixelrelay_contracts::cache::ModelVersionCache;
    use pixelrelay_contracts::config::PollConfig;
    use pixelrelay_contracts::request::{GenerationRequest, ImageAsset, ReferenceImage, SizeHints};
    use serde_json::json;

    use super::ReplicateProvider;
    use crate::error::RelayError;
    use crate::poller::ReplicateTransport;
    use crate::providers::ImageProvider;

    fn provider(base: &str, model: &str, versions: Arc<ModelVersionCache>) -> ReplicateProvider {
        let poll = PollConfig {
            interval: Duration::from_millis(5),
            ..PollConfig::default()
        };
        let transport = ReplicateTransport::new(base, Some("r8-test".to_string()), poll.clone());
        ReplicateProvider::new(transport, model, versions, poll)
    }

    #[test]
    fn input_carries_guidance_images_and_size_hints() {
        let mut request = GenerationRequest::new("a lighthouse");
        request.negative_prompt = Some("fog".to_string());
        request.images = vec![ReferenceImage::new(ImageAsset::unprobed(vec![1, 2, 3], "image/jpeg"))
            .with_guidance("keep the stripes")];
        request.size = SizeHints {
            size: Some("2048x1536".to_string()),
            aspect_ratio: Some("4:3".to_string()),
        };
        let input = ReplicateProvider::build_input(&request);
        assert_eq!(input["prompt"], "a lighthouse\nImage 1: keep the stripes");
        assert_eq!(input["negative_prompt"], "fog");
        assert_eq!(input["image_input"], json!(["data:image/jpeg;base64,AQID"]));
        assert_eq!(input["size"], "custom");
        assert_eq!(input["width"], 2048);
        assert_eq!(input["height"], 1536);
        assert_eq!(input["aspect_ratio"], "4:3");
    }

    #[test]
    fn tier_sizes_pass_through_and_text_only_requests_omit_images() {
        let mut request = GenerationRequest::new("boat");
        request.size.size = Some("2k".to_string());
        let input = ReplicateProvider::build_input(&request);
        assert_eq!(input["size"], "2K");
        assert!(input.get("image_input").is_none());
        assert!(input.get("negative_prompt").is_none());
    }

    #[tokio::test]
    async fn pinned_version_skips_lookup() -> anyhow::Result<()> {
        let versions = Arc::new(ModelVersionCache::new());
        let provider = provider("http://127.0.0.1:9", "owner/model:abc123", versions.clone());
        assert_eq!(provider.resolve_version().await?, "abc123");
        assert!(versions.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn generate_resolves_version_once_and_returns_outputs() -> anyhow::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let lookup = server
            .mock("GET", "/models/bytedance/seedream-4")
            .with_status(200)
            .with_body(json!({"latest_version": {"id": "ver-42"}}).to_string())
            .expect(1)
            .create_async()
            .await;
        let submit = server
            .mock("POST", "/predictions")
            .match_body(Matcher::PartialJson(json!({
                "version": "ver-42",
                "input": {"prompt": "boat"}
            })))
            .with_status(201)
            .with_body(
                json!({
                    "id": "job-1",
                    "status": "starting",
                    "urls": {"get": format!("{base}/predictions/job-1")}
                })
                .to_string(),
            )
            .expect(2)
            .create_async()
            .await;
        let poll = server
            .mock("GET", "/predictions/job-1")
            .with_status(200)
            .with_body(
                json!({
                    "id": "job-1",
                    "status": "succeeded",
                    "output": [{"url": "https://replicate.delivery/job-1/0.jpg"}]
                })
                .to_string(),
            )
            .expect(2)
            .create_async()
            .await;

        let versions = Arc::new(ModelVersionCache::new());
        let provider = provider(&base, "bytedance/seedream-4", versions.clone());
        for _ in 0..2 {
            let urls = provider.generate(&GenerationRequest::new("boat")).await?;
            assert_eq!(urls, vec!["https://replicate.delivery/job-1/0.jpg"]);
        }

        lookup.assert_async().await;
        submit.assert_async().await;
        poll.assert_async().await;
        assert_eq!(versions.get("bytedance/seedream-4").as_deref(), Some("ver-42"));
        Ok(())
    }

    #[tokio::test]
    async fn succeeded_without_outputs_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        let _submit = server
            .mock("POST", "/predictions")
            .with_status(201)
            .with_body(json!({"id": "job-2", "status": "succeeded", "output": null}).to_string())
            .create_async()
            .await;
        let provider = provider(&server.url(), "owner/model:v1", Arc::new(ModelVersionCache::new()));
        let err = provider
            .generate(&GenerationRequest::new("boat"))
            .await
            .expect_err("no outputs");
        assert!(matches!(err, RelayError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn missing_latest_version_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _lookup = server
            .mock("GET", "/models/owner/private")
            .with_status(200)
            .with_body(json!({"latest_version": null}).to_string())
            .create_async()
            .await;
        let versions = Arc::new(ModelVersionCache::new());
        let provider = provider(&server.url(), "owner/private", versions.clone());
        let err = provider.resolve_version().await.expect_err("no version");
        assert!(err.to_string().contains("owner/private"));
        assert!(versions.is_empty());
    }
}
