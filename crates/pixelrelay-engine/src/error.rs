use std::time::Duration;

use pixelrelay_contracts::providers::ProviderKind;
use thiserror::Error;

/// One rung of the normalizer's quality/size ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeAttempt {
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub bytes: usize,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unsupported image ({declared_type}, {byte_len} bytes): {reason}")]
    UnsupportedImage {
        declared_type: String,
        byte_len: usize,
        reason: String,
    },

    #[error(
        "image {original_width}x{original_height} does not fit in {max_bytes} bytes after {} encode attempts",
        .attempts.len()
    )]
    SizeBudgetExceeded {
        original_width: u32,
        original_height: u32,
        max_bytes: usize,
        attempts: Vec<EncodeAttempt>,
    },

    #[error("image encode failed at {width}x{height} q{quality}: {reason}")]
    Encode {
        width: u32,
        height: u32,
        quality: u8,
        reason: String,
    },

    #[error("{provider} rejected the request ({status}): {body}")]
    ProviderRejected {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("job {id} {status}: {detail}")]
    JobFailed {
        id: String,
        status: String,
        detail: String,
    },

    #[error("job {id} still {status} after {:.1}s", .elapsed.as_secs_f64())]
    JobTimeout {
        id: String,
        status: String,
        elapsed: Duration,
    },

    #[error("{provider} request failed ({url})")]
    Transport {
        provider: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} returned an unusable response: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("{env} not set")]
    MissingCredential { env: &'static str },

    #[error("no provider registered for '{0}'")]
    ProviderUnavailable(ProviderKind),

    #[error("image worker stopped: {0}")]
    Worker(String),
}

impl RelayError {
    pub(crate) fn invalid_response(provider: &str, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    /// Faults caused by what the caller sent rather than by a provider.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedImage { .. }
                | Self::SizeBudgetExceeded { .. }
                | Self::ProviderUnavailable(_)
        )
    }

    /// Status-code hint for the request layer that maps errors to responses.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::UnsupportedImage { .. } | Self::ProviderUnavailable(_) => 400,
            Self::SizeBudgetExceeded { .. } => 413,
            Self::ProviderRejected { .. }
            | Self::JobFailed { .. }
            | Self::Transport { .. }
            | Self::InvalidResponse { .. } => 502,
            Self::JobTimeout { .. } => 504,
            Self::Encode { .. } | Self::MissingCredential { .. } | Self::Worker(_) => 500,
        }
    }

    /// Connection-level failures and throttled or 5xx replies, which a poll
    /// loop may retry before giving up.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            Self::ProviderRejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
