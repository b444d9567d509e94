use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::providers::ProviderKind;
use crate::request::NormalizationResult;

pub type EventPayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    RunStarted,
    ImageNormalized,
    GenerationFinished,
    GenerationFailed,
}

impl RunEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::ImageNormalized => "image_normalized",
            Self::GenerationFinished => "generation_finished",
            Self::GenerationFailed => "generation_failed",
        }
    }
}

/// Append-only `events.jsonl` writer for one run.
///
/// Each line is a compact JSON object with `type`, `run_id` and `ts`
/// followed by the event payload. Clones share the same file lock.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event: RunEvent, payload: EventPayload) -> anyhow::Result<Value> {
        let mut row = Map::new();
        row.insert("type".to_string(), Value::String(event.as_str().to_string()));
        row.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        row.insert("ts".to_string(), Value::String(now_utc_iso()));
        // Reserved keys stay as written above.
        for (key, value) in payload {
            row.entry(key).or_insert(value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&row)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(row))
    }

    pub fn image_normalized(
        &self,
        index: usize,
        source_bytes: usize,
        result: &NormalizationResult,
    ) -> anyhow::Result<Value> {
        self.emit(
            RunEvent::ImageNormalized,
            object(json!({
                "index": index,
                "source_bytes": source_bytes,
                "bytes": result.size,
                "width": result.width,
                "height": result.height,
                "content_type": result.content_type,
            })),
        )
    }

    pub fn generation_finished(
        &self,
        provider: ProviderKind,
        urls: &[String],
        elapsed_ms: u128,
    ) -> anyhow::Result<Value> {
        self.emit(
            RunEvent::GenerationFinished,
            object(json!({
                "provider": provider.name(),
                "urls": urls,
                "elapsed_ms": elapsed_ms as u64,
            })),
        )
    }

    pub fn generation_failed(
        &self,
        provider: ProviderKind,
        error: &str,
        http_status: u16,
    ) -> anyhow::Result<Value> {
        self.emit(
            RunEvent::GenerationFailed,
            object(json!({
                "provider": provider.name(),
                "error": error,
                "http_status": http_status,
            })),
        )
    }
}

fn object(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");

        let mut payload = EventPayload::new();
        payload.insert("provider".to_string(), Value::String("fal".to_string()));
        let emitted = writer.emit(RunEvent::RunStarted, payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], "run_started");
        assert_eq!(parsed["run_id"], "run-123");
        assert_eq!(parsed["provider"], "fal");

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_cannot_override_reserved_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-123");

        let mut payload = EventPayload::new();
        payload.insert("type".to_string(), Value::String("override".to_string()));
        payload.insert("run_id".to_string(), Value::String("other".to_string()));
        let emitted = writer.emit(RunEvent::RunStarted, payload)?;

        assert_eq!(emitted["type"], "run_started");
        assert_eq!(emitted["run_id"], "run-123");
        Ok(())
    }

    #[test]
    fn typed_helpers_append_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "run-9");

        let normalized = NormalizationResult {
            bytes: vec![0; 4],
            content_type: "image/jpeg".to_string(),
            size: 4,
            width: 2,
            height: 1,
        };
        writer.image_normalized(0, 100, &normalized)?;
        writer.generation_finished(
            ProviderKind::Replicate,
            &["https://cdn.example/a.png".to_string()],
            1500,
        )?;
        writer.generation_failed(ProviderKind::Fal, "boom", 502)?;

        let content = fs::read_to_string(&path)?;
        let rows: Vec<Value> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["type"], "image_normalized");
        assert_eq!(rows[0]["bytes"], 4);
        assert_eq!(rows[1]["provider"], "replicate");
        assert_eq!(rows[1]["urls"][0], "https://cdn.example/a.png");
        assert_eq!(rows[2]["type"], "generation_failed");
        assert_eq!(rows[2]["http_status"], 502);
        Ok(())
    }
}
