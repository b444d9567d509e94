use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Memoizes provider model identifiers resolved to concrete version ids.
///
/// Entries are written at most once per key and never invalidated. Two
/// callers that miss concurrently both run their resolver; the first value
/// stored wins and both callers receive it.
#[derive(Debug, Default)]
pub struct ModelVersionCache {
    entries: Mutex<HashMap<String, String>>,
}

impl ModelVersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    /// Stores `value` unless the key is already filled; returns the stored value.
    pub fn fill(&self, key: &str, value: String) -> String {
        self.entries()
            .entry(key.to_string())
            .or_insert(value)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn reset(&self) {
        self.entries().clear();
    }

    pub async fn resolve_or_fill<F, Fut, E>(&self, key: &str, resolve: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let resolved = resolve().await?;
        let stored = self.fill(key, resolved);
        tracing::debug!(key, version = %stored, "model version cached");
        Ok(stored)
    }

    // The lock is never held across an await point.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
