//! Experiment output of a measurement session.

use chrono::{DateTime, Utc};
use lab_core::{DataFrame, LabError, MeasurementStore, SessionError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declared sweep parameter, kept for provenance alongside the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterMeta {
    pub name: String,
    pub unit: Option<String>,
    pub points: usize,
}

/// Metadata header plus the tabular result frame of one session run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub title: String,
    pub description: String,
    pub operator: Option<String>,
    pub parameters: Vec<ParameterMeta>,
    pub frame: DataFrame,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    /// Background tasks that had to be aborted after the grace period.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub abandoned_tasks: Vec<String>,
    /// Background tasks that returned an error.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_errors: Vec<String>,
}

impl Experiment {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            operator: None,
            parameters: Vec::new(),
            frame: DataFrame::new(),
            started: now,
            finished: now,
            abandoned_tasks: Vec::new(),
            task_errors: Vec::new(),
        }
    }

    /// JSON blob handed to the measurement store. Title and description sit
    /// at the top level so the store's full-text search finds them.
    pub fn to_blob(&self) -> Result<serde_json::Value, LabError> {
        serde_json::to_value(self)
            .map_err(|e| SessionError::Store(format!("experiment serialization failed: {}", e)).into())
    }

    /// Persist to a store, returning the id the experiment landed under.
    pub async fn persist(
        &self,
        store: &dyn MeasurementStore,
        id: Option<String>,
    ) -> Result<String, LabError> {
        let blob = self.to_blob()?;
        store
            .put(id, blob)
            .await
            .map_err(|e| SessionError::Store(e).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::MemoryStore;

    #[tokio::test]
    async fn persisted_experiments_are_searchable_by_title() {
        let store = MemoryStore::new();
        let mut experiment = Experiment::new("psu ramp", "channel 1 soak");
        experiment.parameters.push(ParameterMeta {
            name: "voltage".into(),
            unit: Some("V".into()),
            points: 3,
        });

        let id = experiment.persist(&store, None).await.unwrap();
        let hits = store.search("ramp").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);

        let blob = store.get(&id).await.unwrap().unwrap();
        assert_eq!(blob["title"], "psu ramp");
        assert_eq!(blob["parameters"][0]["name"], "voltage");
    }
}
