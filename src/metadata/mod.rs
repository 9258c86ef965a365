//! Project/model catalog
//!
//! The offline mining job publishes a snapshot of every (project, model) pair
//! as `metadata/{version}.txt`, one record per model. Nodes fold the snapshot
//! named by the current version pointer into a [`ProjectCatalog`].

use crate::config::ProjectSelection;
use crate::store::files;
use crate::{Error, Result};

use object_store::path::Path;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// One line of a metadata snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectModelMetadata {
    pub project_id: u64,
    pub model_id: u64,
    #[serde(default)]
    pub model_type: String,
    /// Comma separated chunk ids
    #[serde(default)]
    pub chunks: String,
    pub start_time: i64,
    pub end_time: i64,
}

/// What a node knows about one model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelData {
    pub model_type: String,
    pub chunks: Vec<String>,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
}

/// Time interval covered by a model, as returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInterval {
    #[serde(rename = "mid")]
    pub model_id: u64,
    #[serde(rename = "mt")]
    pub model_type: String,
    #[serde(rename = "st")]
    pub start_timestamp: i64,
    #[serde(rename = "et")]
    pub end_timestamp: i64,
}

/// Models known per project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectCatalog {
    projects: BTreeMap<u64, BTreeMap<u64, ModelData>>,
}

impl ProjectCatalog {
    /// Fold snapshot records, keeping only selected projects. A later record
    /// for the same (project, model) replaces an earlier one.
    pub fn from_records(records: Vec<ProjectModelMetadata>, selection: &ProjectSelection) -> Self {
        let mut projects: BTreeMap<u64, BTreeMap<u64, ModelData>> = BTreeMap::new();
        for record in records {
            if !selection.contains(record.project_id) {
                continue;
            }
            let chunks = record
                .chunks
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
            projects.entry(record.project_id).or_default().insert(
                record.model_id,
                ModelData {
                    model_type: record.model_type,
                    chunks,
                    start_timestamp: record.start_time,
                    end_timestamp: record.end_time,
                },
            );
        }
        Self { projects }
    }

    pub fn model(&self, project_id: u64, model_id: u64) -> Option<&ModelData> {
        self.projects.get(&project_id)?.get(&model_id)
    }

    /// Latest model of a project: greatest end timestamp, ties broken by the
    /// greatest model id
    pub fn latest_model(&self, project_id: u64) -> Option<(u64, &ModelData)> {
        self.projects
            .get(&project_id)?
            .iter()
            .max_by_key(|(mid, data)| (data.end_timestamp, **mid))
            .map(|(mid, data)| (*mid, data))
    }

    /// Every model interval of a project, ordered by model id
    pub fn intervals(&self, project_id: u64) -> Vec<ModelInterval> {
        self.projects
            .get(&project_id)
            .map(|models| {
                models
                    .iter()
                    .map(|(mid, data)| ModelInterval {
                        model_id: *mid,
                        model_type: data.model_type.clone(),
                        start_timestamp: data.start_timestamp,
                        end_timestamp: data.end_timestamp,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains_project(&self, project_id: u64) -> bool {
        self.projects.contains_key(&project_id)
    }

    pub fn project_count(&self) -> usize {
        self.projects.len()
    }

    pub fn model_count(&self) -> usize {
        self.projects.values().map(BTreeMap::len).sum()
    }
}

/// Path of the snapshot published under a version name
pub fn snapshot_path(version: &str) -> Path {
    Path::from(format!("metadata/{}.txt", version))
}

/// Loads and publishes catalog snapshots in the cloud tier
#[derive(Clone)]
pub struct CatalogSource {
    store: Arc<dyn ObjectStore>,
    selection: ProjectSelection,
}

impl CatalogSource {
    pub fn new(store: Arc<dyn ObjectStore>, selection: ProjectSelection) -> Self {
        Self { store, selection }
    }

    /// Load the snapshot of `version`. A version with no published snapshot
    /// yields an empty catalog.
    pub async fn load(&self, version: &str) -> Result<ProjectCatalog> {
        let path = snapshot_path(version);
        let records = match files::read_records::<ProjectModelMetadata>(
            self.store.as_ref(),
            &path,
            files::MAX_METADATA_RECORD_BYTES,
        )
        .await
        {
            Ok(records) => records,
            Err(Error::NotFound(_)) => {
                warn!(version = %version, "No metadata snapshot published for version");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let catalog = ProjectCatalog::from_records(records, &self.selection);
        info!(
            version = %version,
            projects = catalog.project_count(),
            models = catalog.model_count(),
            "Loaded project catalog"
        );
        Ok(catalog)
    }

    /// Publish a snapshot under `version`. Snapshots are immutable; returns
    /// false when the version already exists.
    pub async fn publish(&self, version: &str, records: &[ProjectModelMetadata]) -> Result<bool> {
        let payload = files::encode_records(records)?;
        files::put_if_absent(self.store.as_ref(), &snapshot_path(version), payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn record(pid: u64, mid: u64, chunks: &str, start: i64, end: i64) -> ProjectModelMetadata {
        ProjectModelMetadata {
            project_id: pid,
            model_id: mid,
            model_type: "w".to_string(),
            chunks: chunks.to_string(),
            start_time: start,
            end_time: end,
        }
    }

    #[test]
    fn test_latest_model_prefers_end_then_id() {
        let catalog = ProjectCatalog::from_records(
            vec![
                record(1, 10, "1,2", 0, 100),
                record(1, 11, "1", 50, 200),
                record(1, 12, "1", 60, 200),
                record(1, 13, "1", 0, 150),
            ],
            &ProjectSelection::All,
        );

        let (mid, data) = catalog.latest_model(1).unwrap();
        assert_eq!(mid, 12);
        assert_eq!(data.end_timestamp, 200);
        assert!(catalog.latest_model(2).is_none());
        assert_eq!(catalog.model(1, 10).unwrap().chunks, vec!["1", "2"]);
    }

    #[test]
    fn test_selection_filters_projects() {
        let catalog = ProjectCatalog::from_records(
            vec![record(1, 1, "1", 0, 1), record(2, 1, "1", 0, 1)],
            &"2".parse().unwrap(),
        );
        assert!(!catalog.contains_project(1));
        assert!(catalog.contains_project(2));
        assert_eq!(catalog.model_count(), 1);
    }

    #[test]
    fn test_interval_wire_names() {
        let catalog =
            ProjectCatalog::from_records(vec![record(3, 4, "", 5, 6)], &ProjectSelection::All);
        let intervals = catalog.intervals(3);
        assert!(catalog.model(3, 4).unwrap().chunks.is_empty());

        let json = serde_json::to_value(&intervals).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{"mid": 4, "mt": "w", "st": 5, "et": 6}])
        );
    }

    #[tokio::test]
    async fn test_publish_and_load() {
        let source = CatalogSource::new(Arc::new(InMemory::new()), ProjectSelection::All);

        assert!(source.load("version1").await.unwrap().model_count() == 0);

        let records = vec![record(1, 1, "1,2,3", 0, 10)];
        assert!(source.publish("version2", &records).await.unwrap());
        assert!(!source.publish("version2", &[]).await.unwrap());

        let catalog = source.load("version2").await.unwrap();
        assert_eq!(catalog.model(1, 1).unwrap().chunks.len(), 3);
    }
}
