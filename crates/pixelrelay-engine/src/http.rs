use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pixelrelay_contracts::request::ImageAsset;
use reqwest::{RequestBuilder, Response};
use serde_json::Value;

use crate::error::RelayError;

const ERROR_BODY_MAX_CHARS: usize = 512;

pub(crate) async fn response_json_or_error(
    provider: &str,
    response: Response,
) -> Result<Value, RelayError> {
    let status = response.status();
    let url = response.url().to_string();
    let body = response
        .text()
        .await
        .map_err(|source| transport_error(provider, &url, source))?;
    if !status.is_success() {
        return Err(RelayError::ProviderRejected {
            provider: provider.to_string(),
            status: status.as_u16(),
            body: truncate_text(&body, ERROR_BODY_MAX_CHARS),
        });
    }
    serde_json::from_str(&body).map_err(|err| {
        RelayError::invalid_response(provider, format!("invalid JSON payload: {err}"))
    })
}

pub(crate) fn transport_error(provider: &str, url: &str, source: reqwest::Error) -> RelayError {
    RelayError::Transport {
        provider: provider.to_string(),
        url: url.to_string(),
        source,
    }
}

/// Sends a request, retrying connection-level failures with linear backoff.
/// HTTP error statuses are returned to the caller untouched.
pub(crate) async fn send_with_transport_retries<F>(
    provider: &str,
    url: &str,
    max_retries: usize,
    backoff: Duration,
    build: F,
) -> Result<Response, RelayError>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0;
    loop {
        match build().send().await {
            Ok(response) => return Ok(response),
            Err(source) => {
                let err = transport_error(provider, url, source);
                if !err.is_transient() || attempt >= max_retries {
                    return Err(err);
                }
                attempt += 1;
                tracing::warn!(
                    provider,
                    attempt,
                    max_retries,
                    error = %err,
                    "transient request failure, retrying"
                );
                tokio::time::sleep(backoff * attempt as u32).await;
            }
        }
    }
}

pub(crate) fn data_url(asset: &ImageAsset) -> String {
    let mime = if asset.content_type.trim().is_empty() {
        "image/jpeg"
    } else {
        asset.content_type.trim()
    };
    format!("data:{mime};base64,{}", BASE64.encode(&asset.bytes))
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Parses `WIDTHxHEIGHT` (also `WIDTH*HEIGHT`), ignoring case and spaces.
pub(crate) fn parse_dims(raw: &str) -> Option<(u32, u32)> {
    let normalized = raw.trim().to_ascii_lowercase().replace(' ', "");
    let (left, right) = normalized.split_once(['x', '*'])?;
    let width = left.parse::<u32>().ok().filter(|value| *value > 0)?;
    let height = right.parse::<u32>().ok().filter(|value| *value > 0)?;
    Some((width, height))
}
