use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of an asynchronous prediction.
///
/// `Starting` and `Processing` are treated identically by the poller. Any
/// status string outside the known vocabulary lands in `Unknown` and is
/// non-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Submitted,
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    Unknown(String),
}

impl JobStatus {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" | "submitted" => Self::Submitted,
            "starting" => Self::Starting,
            "processing" => Self::Processing,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Unknown(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Submitted => "submitted",
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Unknown(raw) => raw.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::Starting => 1,
            Self::Processing | Self::Unknown(_) => 2,
            Self::Succeeded | Self::Failed | Self::Canceled => 3,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PredictionUrls {
    #[serde(default)]
    pub get: Option<String>,
    #[serde(default)]
    pub cancel: Option<String>,
}

/// Replicate-style prediction payload, as returned by submission and by
/// every poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Prediction {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Value,
    #[serde(default)]
    pub urls: Option<PredictionUrls>,
}

impl Prediction {
    pub fn status(&self) -> JobStatus {
        JobStatus::parse(&self.status)
    }

    pub fn poll_url(&self) -> Option<&str> {
        self.urls
            .as_ref()
            .and_then(|urls| urls.get.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Provider error detail, verbatim when it is a plain string.
    pub fn error_detail(&self) -> Option<String> {
        match &self.error {
            Value::Null => None,
            Value::String(text) if text.trim().is_empty() => None,
            Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Identifier, polling location and last observed status of a submitted job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    id: String,
    poll_url: String,
    status: JobStatus,
    last: Prediction,
}

impl JobHandle {
    pub fn new(prediction: Prediction, poll_url: impl Into<String>) -> Self {
        Self {
            id: prediction.id.clone(),
            poll_url: poll_url.into(),
            status: prediction.status(),
            last: prediction,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn poll_url(&self) -> &str {
        &self.poll_url
    }

    pub fn status(&self) -> &JobStatus {
        &self.status
    }

    pub fn last(&self) -> &Prediction {
        &self.last
    }

    /// Records a poll result. Status only moves to a strictly later stage;
    /// a regressing or sideways report (say an unrecognised status while
    /// processing) keeps the current one. Returns whether the status changed.
    pub fn observe(&mut self, prediction: Prediction) -> bool {
        if let Some(next) = prediction.poll_url() {
            self.poll_url = next.to_string();
        }
        if self.id.is_empty() && !prediction.id.is_empty() {
            self.id = prediction.id.clone();
        }
        let status = prediction.status();
        self.last = prediction;
        if status.rank() <= self.status.rank() {
            return false;
        }
        self.status = status;
        true
    }
}
