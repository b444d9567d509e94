use serde::{Deserialize, Serialize};

/// Fixed content type every normalized upload is re-encoded to.
pub const NORMALIZED_CONTENT_TYPE: &str = "image/jpeg";

/// A source image as it arrived with a request, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub width: u32,
    pub height: u32,
}

impl ImageAsset {
    /// Wraps raw bytes whose dimensions are not known yet.
    pub fn unprobed(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
            width: 0,
            height: 0,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationResult {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub size: usize,
    pub width: u32,
    pub height: u32,
}

impl NormalizationResult {
    pub fn long_edge(&self) -> u32 {
        self.width.max(self.height)
    }

    pub fn into_asset(self) -> ImageAsset {
        ImageAsset {
            bytes: self.bytes,
            content_type: self.content_type,
            width: self.width,
            height: self.height,
        }
    }
}

/// A reference image plus the optional per-image instruction that came with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub asset: ImageAsset,
    pub guidance: Option<String>,
}

impl ReferenceImage {
    pub fn new(asset: ImageAsset) -> Self {
        Self {
            asset,
            guidance: None,
        }
    }

    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        let text = guidance.into();
        let trimmed = text.trim();
        self.guidance = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SizeHints {
    /// Explicit pixel size such as `2048x2048`, or a provider tier like `2K`.
    pub size: Option<String>,
    /// Aspect ratio such as `16:9`.
    pub aspect_ratio: Option<String>,
}

impl SizeHints {
    pub fn is_empty(&self) -> bool {
        self.size.is_none() && self.aspect_ratio.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub images: Vec<ReferenceImage>,
    pub size: SizeHints,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn negative_prompt(&self) -> Option<&str> {
        self.negative_prompt
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Prompt text with per-image guidance folded in as numbered lines.
    pub fn prompt_with_guidance(&self) -> String {
        let mut lines = vec![self.prompt.trim().to_string()];
        for (idx, image) in self.images.iter().enumerate() {
            if let Some(guidance) = image.guidance.as_deref() {
                lines.push(format!("Image {}: {}", idx + 1, guidance));
            }
        }
        lines.join("\n")
    }
}
