//! Detector that replays recorded inference output
//!
//! Each item's output lives in `<dir>/<item id>.json` as a serialized
//! [`Inference`]. Lets the distributed pipeline run without a live model.

use std::path::PathBuf;

use crate::pipeline::{Detector, DetectorOptions, Inference};
use crate::types::DatasetItem;
use crate::{Error, Result};

pub struct ReplayDetector {
    dir: PathBuf,
    options: DetectorOptions,
}

impl ReplayDetector {
    pub fn new(dir: impl Into<PathBuf>, options: DetectorOptions) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Error::config(format!(
                "replay directory {} does not exist",
                dir.display()
            )));
        }
        tracing::debug!(dir = %dir.display(), device = options.device, "Replay detector ready");
        Ok(Self { dir, options })
    }

    fn record_path(&self, item: &DatasetItem) -> PathBuf {
        self.dir.join(format!("{}.json", item.id))
    }
}

impl Detector for ReplayDetector {
    fn infer(&mut self, item: &DatasetItem, _streams: &[String]) -> Result<Inference> {
        let path = self.record_path(item);
        let raw = std::fs::read_to_string(&path).map_err(|e| Error::Inference {
            index: item.index,
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;
        let inference: Inference = serde_json::from_str(&raw).map_err(|e| Error::Inference {
            index: item.index,
            message: format!("Malformed record {}: {}", path.display(), e),
        })?;

        if self.options.visualize {
            for detection in inference
                .detections
                .iter()
                .filter(|d| d.score >= self.options.threshold)
            {
                tracing::info!(
                    item = %item.id,
                    x1 = detection.x1,
                    y1 = detection.y1,
                    x2 = detection.x2,
                    y2 = detection.y2,
                    score = detection.score,
                    "Detection"
                );
            }
        }

        Ok(inference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Array, Detection};
    use tempfile::TempDir;

    fn item(index: usize, id: &str) -> DatasetItem {
        DatasetItem {
            index,
            id: id.to_string(),
            path: PathBuf::from(id),
        }
    }

    #[test]
    fn test_replays_recorded_output() {
        let dir = TempDir::new().unwrap();
        let recorded = Inference {
            detections: vec![Detection::new(1.0, 2.0, 3.0, 4.0, 0.8)],
            features: [(
                "pid_label".to_string(),
                Array::int(vec![1], vec![12]).unwrap(),
            )]
            .into_iter()
            .collect(),
        };
        std::fs::write(
            dir.path().join("s1.jpg.json"),
            serde_json::to_string(&recorded).unwrap(),
        )
        .unwrap();

        let mut detector = ReplayDetector::new(dir.path(), DetectorOptions::default()).unwrap();
        let replayed = detector.infer(&item(0, "s1.jpg"), &[]).unwrap();
        assert_eq!(replayed, recorded);
    }

    #[test]
    fn test_missing_record_is_an_inference_error() {
        let dir = TempDir::new().unwrap();
        let mut detector = ReplayDetector::new(dir.path(), DetectorOptions::default()).unwrap();

        let err = detector.infer(&item(3, "absent.jpg"), &[]).unwrap_err();
        assert!(matches!(err, Error::Inference { index: 3, .. }));
    }

    #[test]
    fn test_requires_existing_directory() {
        let dir = TempDir::new().unwrap();
        assert!(ReplayDetector::new(dir.path().join("nope"), DetectorOptions::default()).is_err());
    }
}
