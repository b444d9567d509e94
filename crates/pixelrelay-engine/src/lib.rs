use std::sync::Arc;

use pixelrelay_contracts::cache::ModelVersionCache;
use pixelrelay_contracts::config::{NormalizeConfig, PollConfig};
use pixelrelay_contracts::providers::ProviderKind;
use pixelrelay_contracts::request::{GenerationRequest, ImageAsset, NormalizationResult};

pub mod error;
mod http;
pub mod normalize;
pub mod poller;
pub mod providers;

pub use error::{EncodeAttempt, RelayError};
pub use normalize::{ImageCodec, JpegCodec, Normalizer};
pub use poller::{JobPoller, PredictionTransport, ReplicateTransport};
pub use providers::{ImageProvider, ProviderRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub provider: ProviderKind,
    pub urls: Vec<String>,
}

/// Normalizes request images, then hands the request to the selected provider.
#[derive(Clone)]
pub struct RelayEngine {
    normalizer: Arc<Normalizer>,
    providers: ProviderRegistry,
}

impl RelayEngine {
    pub fn new(normalizer: Normalizer, providers: ProviderRegistry) -> Self {
        Self {
            normalizer: Arc::new(normalizer),
            providers,
        }
    }

    /// Engine with every built-in provider and budgets read from the
    /// environment. The model-version cache lives as long as the engine.
    pub fn from_env() -> Self {
        let versions = Arc::new(ModelVersionCache::new());
        Self::new(
            Normalizer::new(NormalizeConfig::from_env()),
            ProviderRegistry::from_env(versions, PollConfig::from_env()),
        )
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub async fn normalize(&self, asset: ImageAsset) -> Result<NormalizationResult, RelayError> {
        self.normalizer.normalize_offloaded(asset).await
    }

    /// Replaces every reference image with its normalized encoding. Guidance
    /// text and order are preserved; the first failure aborts the request.
    pub async fn prepare(&self, request: GenerationRequest) -> Result<GenerationRequest, RelayError> {
        self.prepare_observed(request, |_, _, _| {}).await
    }

    /// [`RelayEngine::prepare`], calling `observe(index, source_bytes, result)`
    /// after each image is normalized.
    pub async fn prepare_observed<F>(
        &self,
        mut request: GenerationRequest,
        mut observe: F,
    ) -> Result<GenerationRequest, RelayError>
    where
        F: FnMut(usize, usize, &NormalizationResult),
    {
        for (index, image) in request.images.iter_mut().enumerate() {
            let source = std::mem::replace(&mut image.asset, ImageAsset::unprobed(Vec::new(), ""));
            let source_bytes = source.byte_len();
            let normalized = self.normalize(source).await?;
            tracing::debug!(
                index,
                source_bytes,
                bytes = normalized.size,
                width = normalized.width,
                height = normalized.height,
                "reference image normalized"
            );
            observe(index, source_bytes, &normalized);
            image.asset = normalized.into_asset();
        }
        Ok(request)
    }

    /// Sends an already prepared request to `kind`.
    pub async fn dispatch(
        &self,
        kind: ProviderKind,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, RelayError> {
        let provider = self
            .providers
            .get(kind)
            .ok_or(RelayError::ProviderUnavailable(kind))?;
        let urls = provider.generate(request).await?;
        if urls.is_empty() {
            return Err(RelayError::invalid_response(
                kind.name(),
                "provider returned no outputs",
            ));
        }
        tracing::info!(provider = %kind, outputs = urls.len(), "generation finished");
        Ok(GenerationOutput {
            provider: kind,
            urls,
        })
    }

    pub async fn generate(
        &self,
        kind: ProviderKind,
        request: GenerationRequest,
    ) -> Result<GenerationOutput, RelayError> {
        if self.providers.get(kind).is_none() {
            return Err(RelayError::ProviderUnavailable(kind));
        }
        let prepared = self.prepare(request).await?;
        self.dispatch(kind, &prepared).await
    }
}
