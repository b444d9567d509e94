use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The generative-image backends a request can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Replicate,
    Fal,
    NanoBanana,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::Replicate, Self::Fal, Self::NanoBanana];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Replicate => "replicate",
            Self::Fal => "fal",
            Self::NanoBanana => "nano-banana",
        }
    }

    /// Whether the backend uses the submit-then-poll protocol.
    pub fn is_async_job(&self) -> bool {
        matches!(self, Self::Replicate)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "replicate" | "seedream" => Ok(Self::Replicate),
            "fal" | "fal-ai" | "falai" => Ok(Self::Fal),
            "nano-banana" | "nanobanana" | "gemini" => Ok(Self::NanoBanana),
            _ => Err(format!(
                "Unknown provider '{}'. Expected one of: {}.",
                raw.trim(),
                Self::ALL
                    .iter()
                    .map(ProviderKind::name)
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }
}
