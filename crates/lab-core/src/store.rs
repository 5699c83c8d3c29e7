//! Contract for the external measurement store.
//!
//! The runtime does not implement persistence; it only defines what is handed
//! to a store: opaque JSON blobs under string ids, with full-text search over
//! titles and descriptions. Envelopes are stored side-by-side with results
//! under an adjacent key (`<id>.envelope`).

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One hit from a store search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub description: String,
}

/// Append-oriented blob store for experiments and measurement results.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Store `blob` under `id` (or a freshly allocated id when `None`).
    /// Returns the id the blob landed under.
    async fn put(
        &self,
        id: Option<String>,
        blob: serde_json::Value,
    ) -> Result<String, String>;

    async fn get(&self, id: &str) -> Result<Option<serde_json::Value>, String>;

    /// Case-insensitive substring search over stored titles/descriptions.
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, String>;
}

/// Key for the envelope stored next to a result.
pub fn envelope_key(id: &str) -> String {
    format!("{}.envelope", id)
}

/// In-memory store used by tests and the simulation-only CLI paths.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<BTreeMap<String, serde_json::Value>>,
    next_id: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn put(
        &self,
        id: Option<String>,
        blob: serde_json::Value,
    ) -> Result<String, String> {
        let id = id.unwrap_or_else(|| {
            let mut next = self.next_id.lock();
            *next += 1;
            format!("mem-{:06}", *next)
        });
        self.blobs.lock().insert(id.clone(), blob);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<serde_json::Value>, String> {
        Ok(self.blobs.lock().get(id).cloned())
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, String> {
        let needle = query.to_lowercase();
        let blobs = self.blobs.lock();
        let hits = blobs
            .iter()
            .filter_map(|(id, blob)| {
                let title = blob.get("title").and_then(|v| v.as_str()).unwrap_or("");
                let description = blob
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let haystack = format!("{} {}", title, description).to_lowercase();
                haystack.contains(&needle).then(|| SearchHit {
                    id: id.clone(),
                    title: title.to_string(),
                    description: description.to_string(),
                })
            })
            .collect();
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_allocates_ids_and_get_round_trips() {
        let store = MemoryStore::new();
        let id = store
            .put(None, json!({"title": "ramp", "description": "psu ramp"}))
            .await
            .unwrap();
        let blob = store.get(&id).await.unwrap().unwrap();
        assert_eq!(blob["title"], "ramp");
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_matches_title_and_description() {
        let store = MemoryStore::new();
        store
            .put(
                Some("a".into()),
                json!({"title": "PSU ramp", "description": "slow"}),
            )
            .await
            .unwrap();
        store
            .put(
                Some("b".into()),
                json!({"title": "noise floor", "description": "DMM idle"}),
            )
            .await
            .unwrap();

        let hits = store.search("psu").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }
}
