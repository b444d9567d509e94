use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use pixelrelay_contracts::cache::ModelVersionCache;
use pixelrelay_contracts::config::PollConfig;
use pixelrelay_contracts::providers::ProviderKind;
use pixelrelay_contracts::request::GenerationRequest;

use crate::error::RelayError;

mod fal;
mod nano_banana;
mod replicate;

pub use fal::FalProvider;
pub use nano_banana::NanoBananaProvider;
pub use replicate::ReplicateProvider;

/// A generative-image backend. `request` images are already normalized.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<String>, RelayError>;
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderKind, Arc<dyn ImageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in providers configured from the environment. Missing
    /// credentials only surface when a provider is used.
    pub fn from_env(versions: Arc<ModelVersionCache>, poll: PollConfig) -> Self {
        let mut registry = Self::new();
        registry.register(ReplicateProvider::from_env(versions, poll.clone()));
        registry.register(FalProvider::from_env(poll.clone()));
        registry.register(NanoBananaProvider::from_env(poll));
        registry
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers.insert(provider.kind(), Arc::new(provider));
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ImageProvider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.providers.keys().copied().collect()
    }
}

/// Nearest supported aspect ratio for a `WxH` size or `W:H` ratio hint.
pub(crate) fn nearest_aspect_ratio(raw: &str, candidates: &[(&'static str, f64)]) -> Option<&'static str> {
    let normalized = raw.trim().to_ascii_lowercase();
    if let Some(exact) = candidates.iter().find(|(name, _)| *name == normalized) {
        return Some(exact.0);
    }
    let target = if let Some((left, right)) = normalized.split_once(':') {
        let left = left.trim().parse::<f64>().ok()?;
        let right = right.trim().parse::<f64>().ok()?;
        if left <= 0.0 || right <= 0.0 {
            return None;
        }
        left / right
    } else {
        let (width, height) = crate::http::parse_dims(&normalized)?;
        f64::from(width) / f64::from(height)
    };
    candidates
        .iter()
        .min_by(|a, b| {
            (a.1 - target)
                .abs()
                .partial_cmp(&(b.1 - target).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(name, _)| *name)
}

pub(crate) const COMMON_ASPECT_RATIOS: [(&str, f64); 10] = [
    ("1:1", 1.0),
    ("2:3", 2.0 / 3.0),
    ("3:2", 3.0 / 2.0),
    ("3:4", 3.0 / 4.0),
    ("4:3", 4.0 / 3.0),
    ("4:5", 4.0 / 5.0),
    ("5:4", 5.0 / 4.0),
    ("9:16", 9.0 / 16.0),
    ("16:9", 16.0 / 9.0),
    ("21:9", 21.0 / 9.0),
];
