use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_IMAGE_DIMENSION: u32 = 2048;
pub const DEFAULT_MIN_IMAGE_DIMENSION: u32 = 256;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1500);
pub const DEFAULT_POLL_DEADLINE: Duration = Duration::from_secs(300);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TRANSIENT_RETRIES: usize = 2;

/// Budgets and retry ladder for the image normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeConfig {
    pub max_bytes: usize,
    pub max_dimension: u32,
    pub min_dimension: u32,
    pub initial_quality: u8,
    pub quality_floor: u8,
    pub quality_step: u8,
    pub shrink_ratio: f64,
    pub max_attempts: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_IMAGE_BYTES,
            max_dimension: DEFAULT_MAX_IMAGE_DIMENSION,
            min_dimension: DEFAULT_MIN_IMAGE_DIMENSION,
            initial_quality: 90,
            quality_floor: 50,
            quality_step: 10,
            shrink_ratio: 0.85,
            max_attempts: 8,
        }
    }
}

impl NormalizeConfig {
    /// Defaults overridden by `PIXELRELAY_MAX_IMAGE_BYTES`,
    /// `PIXELRELAY_MAX_IMAGE_DIMENSION` and `PIXELRELAY_MIN_IMAGE_DIMENSION`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_dimension = env_parsed("PIXELRELAY_MAX_IMAGE_DIMENSION")
            .filter(|value: &u32| *value > 0)
            .unwrap_or(defaults.max_dimension);
        let min_dimension = env_parsed("PIXELRELAY_MIN_IMAGE_DIMENSION")
            .filter(|value: &u32| *value > 0)
            .unwrap_or(defaults.min_dimension)
            .min(max_dimension);
        Self {
            max_bytes: env_parsed("PIXELRELAY_MAX_IMAGE_BYTES")
                .filter(|value: &usize| *value > 0)
                .unwrap_or(defaults.max_bytes),
            max_dimension,
            min_dimension,
            ..defaults
        }
    }
}

/// How long the poller may wait for a job to reach a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDeadline {
    Unbounded,
    After(Duration),
}

impl PollDeadline {
    /// `0` means unbounded.
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::Unbounded
        } else {
            Self::After(Duration::from_secs(secs))
        }
    }

    pub fn is_exceeded(&self, elapsed: Duration) -> bool {
        match self {
            Self::Unbounded => false,
            Self::After(limit) => elapsed >= *limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub interval: Duration,
    pub deadline: PollDeadline,
    /// Bound on each individual request/response call.
    pub request_timeout: Duration,
    /// Consecutive transient poll failures tolerated before escalating.
    pub transient_retries: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            deadline: PollDeadline::After(DEFAULT_POLL_DEADLINE),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            transient_retries: DEFAULT_TRANSIENT_RETRIES,
        }
    }
}

impl PollConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: env_parsed("PIXELRELAY_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.interval),
            deadline: env_parsed("PIXELRELAY_POLL_DEADLINE_SECS")
                .map(PollDeadline::from_secs)
                .unwrap_or(defaults.deadline),
            request_timeout: env_parsed("PIXELRELAY_REQUEST_TIMEOUT_SECS")
                .filter(|value: &u64| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            transient_retries: env_parsed("PIXELRELAY_TRANSIENT_RETRIES")
                .unwrap_or(defaults.transient_retries),
        }
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Base URL from `key`, trailing slashes removed, or `default`.
pub fn api_base_from_env(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = non_empty_env(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{NormalizeConfig, PollConfig, PollDeadline};

    #[test]
    fn normalize_defaults_match_retry_ladder() {
        let config = NormalizeConfig::default();
        assert_eq!(config.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_dimension, 2048);
        assert_eq!(config.initial_quality, 90);
        assert_eq!(config.quality_floor, 50);
        assert_eq!(config.quality_step, 10);
        assert!((config.shrink_ratio - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 8);
    }

    #[test]
    fn poll_defaults_are_bounded() {
        let config = PollConfig::default();
        assert_eq!(config.interval, Duration::from_millis(1500));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.deadline, PollDeadline::After(Duration::from_secs(300)));
    }

    #[test]
    fn zero_deadline_means_unbounded() {
        assert_eq!(PollDeadline::from_secs(0), PollDeadline::Unbounded);
        assert!(!PollDeadline::Unbounded.is_exceeded(Duration::from_secs(86_400)));
        let bounded = PollDeadline::from_secs(5);
        assert!(!bounded.is_exceeded(Duration::from_secs(4)));
        assert!(bounded.is_exceeded(Duration::from_secs(5)));
    }
}
