//! Dataset collaborator
//!
//! A dataset fixes the global item order and owns the scoring step that runs
//! on the coordinator once everything has been gathered.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::{Array, DatasetItem, FeatureSet, ItemDetections};
use crate::{Error, Result};

/// Inputs handed to [`Dataset::evaluate`]
#[derive(Debug, Clone, Copy)]
pub struct EvaluationRequest<'a> {
    pub detections: &'a [ItemDetections],
    pub ranks: &'a [Array],
    pub labels: &'a [Array],
    pub threshold: f32,
}

/// Outcome of a dataset evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub dataset: String,
    pub items: usize,
    pub detections: usize,
    pub detections_above_threshold: usize,
    pub labeled_detections: usize,
}

pub trait Dataset: Send + Sync {
    fn name(&self) -> &str;

    /// Number of items in the global index space
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn item(&self, index: usize) -> Result<DatasetItem>;

    /// Dataset-specific adjustments to the gathered feature streams
    fn postprocess(&self, _features: &mut FeatureSet) -> Result<()> {
        Ok(())
    }

    /// Score the aggregated results; called once, on the coordinator
    fn evaluate(&self, request: EvaluationRequest<'_>) -> Result<EvaluationReport>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    name: String,
    #[serde(default)]
    root_dir: PathBuf,
    items: Vec<ManifestEntry>,
}

/// Dataset described by a JSON manifest
///
/// ```json
/// { "name": "psdb_test", "root_dir": "data/psdb", "items": [{ "id": "s1.jpg" }] }
/// ```
///
/// Its evaluation summarises the gathered results by counting; scoring
/// against ground truth belongs to dedicated dataset implementations.
#[derive(Debug, Clone)]
pub struct ManifestDataset {
    name: String,
    root_dir: PathBuf,
    items: Vec<ManifestEntry>,
}

impl ManifestDataset {
    pub fn new(name: impl Into<String>, root_dir: impl Into<PathBuf>, items: Vec<ManifestEntry>) -> Self {
        Self {
            name: name.into(),
            root_dir: root_dir.into(),
            items,
        }
    }

    /// Load a manifest file; relative `root_dir`s resolve against its directory
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::dataset(format!("Failed to read {}: {}", path.display(), e)))?;
        let manifest: Manifest = serde_json::from_str(&raw)?;

        let root_dir = if manifest.root_dir.is_absolute() {
            manifest.root_dir
        } else {
            path.parent()
                .unwrap_or_else(|| Path::new("."))
                .join(manifest.root_dir)
        };

        Ok(Self::new(manifest.name, root_dir, manifest.items))
    }
}

impl Dataset for ManifestDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn item(&self, index: usize) -> Result<DatasetItem> {
        let entry = self.items.get(index).ok_or_else(|| {
            Error::dataset(format!(
                "item {} out of range for {} items",
                index,
                self.items.len()
            ))
        })?;
        let relative = entry.path.clone().unwrap_or_else(|| PathBuf::from(&entry.id));

        Ok(DatasetItem {
            index,
            id: entry.id.clone(),
            path: self.root_dir.join(relative),
        })
    }

    fn evaluate(&self, request: EvaluationRequest<'_>) -> Result<EvaluationReport> {
        for (stream, len) in [
            ("detections", request.detections.len()),
            ("ranks", request.ranks.len()),
            ("labels", request.labels.len()),
        ] {
            if len != self.len() {
                return Err(Error::dataset(format!(
                    "{} stream has {} items, dataset has {}",
                    stream,
                    len,
                    self.len()
                )));
            }
        }

        let mut report = EvaluationReport {
            dataset: self.name.clone(),
            items: self.len(),
            ..Default::default()
        };

        for (boxes, labels) in request.detections.iter().zip(request.labels) {
            report.detections += boxes.len();
            let labels = labels.as_int().unwrap_or_default();
            for (i, detection) in boxes.iter().enumerate() {
                if detection.score < request.threshold {
                    continue;
                }
                report.detections_above_threshold += 1;
                if labels.get(i).is_some_and(|label| *label >= 0) {
                    report.labeled_detections += 1;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Detection;
    use tempfile::TempDir;

    fn entries(ids: &[&str]) -> Vec<ManifestEntry> {
        ids.iter()
            .map(|id| ManifestEntry {
                id: id.to_string(),
                path: None,
            })
            .collect()
    }

    #[test]
    fn test_load_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"{"name": "psdb_train", "root_dir": "images",
                "items": [{"id": "s1.jpg"}, {"id": "s2.jpg", "path": "sub/s2.jpg"}]}"#,
        )
        .unwrap();

        let dataset = ManifestDataset::load(&path).unwrap();
        assert_eq!(dataset.name(), "psdb_train");
        assert_eq!(dataset.len(), 2);

        let second = dataset.item(1).unwrap();
        assert_eq!(second.id, "s2.jpg");
        assert_eq!(second.path, dir.path().join("images").join("sub/s2.jpg"));
        assert!(dataset.item(2).is_err());
    }

    #[test]
    fn test_evaluate_counts() {
        let dataset = ManifestDataset::new("ds", "/data", entries(&["a", "b"]));
        let detections = vec![
            vec![
                Detection::new(0.0, 0.0, 1.0, 1.0, 0.9),
                Detection::new(0.0, 0.0, 1.0, 1.0, 0.2),
            ],
            vec![Detection::new(0.0, 0.0, 1.0, 1.0, 0.6)],
        ];
        let ranks = vec![
            Array::int(vec![2, 1], vec![0, 1]).unwrap(),
            Array::int(vec![1, 1], vec![3]).unwrap(),
        ];
        let labels = vec![
            Array::int(vec![2], vec![4, 4]).unwrap(),
            Array::int(vec![1], vec![-1]).unwrap(),
        ];

        let report = dataset
            .evaluate(EvaluationRequest {
                detections: &detections,
                ranks: &ranks,
                labels: &labels,
                threshold: 0.5,
            })
            .unwrap();

        assert_eq!(report.items, 2);
        assert_eq!(report.detections, 3);
        assert_eq!(report.detections_above_threshold, 2);
        assert_eq!(report.labeled_detections, 1);
    }

    #[test]
    fn test_evaluate_rejects_incomplete_streams() {
        let dataset = ManifestDataset::new("ds", "/data", entries(&["a", "b"]));
        let result = dataset.evaluate(EvaluationRequest {
            detections: &[vec![]],
            ranks: &[],
            labels: &[],
            threshold: 0.5,
        });
        assert!(result.is_err());
    }
}
