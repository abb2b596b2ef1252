//! Per-worker inference over an assigned range

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::dataset::Dataset;
use crate::partition::WorkerRange;
use crate::types::{Array, DatasetItem, FeatureSet, ItemDetections};
use crate::{Error, Result};

/// Detections and requested feature arrays for one item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    pub detections: ItemDetections,
    #[serde(default)]
    pub features: BTreeMap<String, Array>,
}

/// Settings a detector is built with
#[derive(Debug, Clone, Default)]
pub struct DetectorOptions {
    /// Accelerator device bound to this worker
    pub device: u32,
    /// Report detections per item as they are produced
    pub visualize: bool,
    /// Score threshold used when visualizing
    pub threshold: f32,
}

/// Inference collaborator: turns one item into detections and features
pub trait Detector: Send {
    /// Run inference on `item`, producing at least the feature `streams` asked for
    fn infer(&mut self, item: &DatasetItem, streams: &[String]) -> Result<Inference>;
}

/// One worker's results, aligned with its range
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    pub range: WorkerRange,
    pub detections: Vec<ItemDetections>,
    pub features: FeatureSet,
}

impl PartialResult {
    fn with_streams(range: WorkerRange, streams: &[String]) -> Self {
        Self {
            range,
            detections: Vec::with_capacity(range.len()),
            features: streams
                .iter()
                .map(|name| (name.clone(), Vec::with_capacity(range.len())))
                .collect(),
        }
    }
}

/// Run `detector` over every item of `range` in ascending order
///
/// Any per-item failure aborts the worker: a result with holes would shift
/// every later item once the ranges are concatenated.
pub fn run_local(
    detector: &mut dyn Detector,
    dataset: &dyn Dataset,
    range: WorkerRange,
    streams: &[String],
    progress_every: usize,
) -> Result<PartialResult> {
    let mut partial = PartialResult::with_streams(range, streams);
    let started = Instant::now();

    for (done, index) in range.indices().enumerate() {
        let item = dataset.item(index)?;
        let mut inference = detector.infer(&item, streams).map_err(|e| match e {
            Error::Inference { .. } => e,
            other => Error::Inference {
                index,
                message: other.to_string(),
            },
        })?;

        for name in streams {
            let array = inference
                .features
                .remove(name)
                .ok_or_else(|| Error::MissingStream {
                    stream: name.clone(),
                    index,
                })?;
            if let Some(stream) = partial.features.get_mut(name) {
                stream.push(array);
            }
        }
        if !inference.features.is_empty() {
            tracing::debug!(
                index,
                extra = ?inference.features.keys().collect::<Vec<_>>(),
                "Dropping unrequested streams"
            );
        }
        partial.detections.push(inference.detections);

        let done = done + 1;
        if progress_every > 0 && (done % progress_every == 0 || done == range.len()) {
            tracing::info!(
                start = range.start,
                end = range.end,
                done,
                total = range.len(),
                avg_ms = started.elapsed().as_secs_f64() * 1000.0 / done as f64,
                "Inference progress"
            );
        }
    }

    Ok(partial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{EvaluationReport, EvaluationRequest};
    use crate::types::Detection;

    struct Numbered(usize);

    impl Dataset for Numbered {
        fn name(&self) -> &str {
            "numbered"
        }

        fn len(&self) -> usize {
            self.0
        }

        fn item(&self, index: usize) -> Result<DatasetItem> {
            Ok(DatasetItem {
                index,
                id: format!("img_{index}"),
                path: format!("img_{index}.jpg").into(),
            })
        }

        fn evaluate(&self, _request: EvaluationRequest<'_>) -> Result<EvaluationReport> {
            Ok(EvaluationReport::default())
        }
    }

    /// Emits one box and a "score" stream equal to twice the item index
    struct Doubler {
        seen: Vec<usize>,
        fail_on: Option<usize>,
        skip_stream_on: Option<usize>,
    }

    impl Doubler {
        fn new() -> Self {
            Self {
                seen: Vec::new(),
                fail_on: None,
                skip_stream_on: None,
            }
        }
    }

    impl Detector for Doubler {
        fn infer(&mut self, item: &DatasetItem, _streams: &[String]) -> Result<Inference> {
            self.seen.push(item.index);
            if self.fail_on == Some(item.index) {
                return Err(Error::internal("out of memory"));
            }

            let mut features = BTreeMap::new();
            if self.skip_stream_on != Some(item.index) {
                let value = (item.index * 2) as f32;
                features.insert("score".to_string(), Array::float(vec![1], vec![value])?);
            }
            features.insert("extra".to_string(), Array::float(vec![0], vec![])?);

            Ok(Inference {
                detections: vec![Detection::new(0.0, 0.0, 1.0, 1.0, 0.5)],
                features,
            })
        }
    }

    fn score_stream() -> Vec<String> {
        vec!["score".to_string()]
    }

    #[test]
    fn test_runs_range_in_order() {
        let mut detector = Doubler::new();
        let range = WorkerRange::new(4, 7);

        let partial = run_local(&mut detector, &Numbered(10), range, &score_stream(), 1).unwrap();

        assert_eq!(detector.seen, vec![4, 5, 6]);
        assert_eq!(partial.detections.len(), 3);
        let scores: Vec<f32> = partial.features["score"]
            .iter()
            .map(|a| a.as_float().unwrap()[0])
            .collect();
        assert_eq!(scores, vec![8.0, 10.0, 12.0]);
        assert!(!partial.features.contains_key("extra"));
    }

    #[test]
    fn test_item_failure_is_fatal() {
        let mut detector = Doubler::new();
        detector.fail_on = Some(5);

        let err = run_local(
            &mut detector,
            &Numbered(10),
            WorkerRange::new(4, 7),
            &score_stream(),
            0,
        )
        .unwrap_err();

        match err {
            Error::Inference { index, .. } => assert_eq!(index, 5),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(detector.seen, vec![4, 5]);
    }

    #[test]
    fn test_missing_stream_is_fatal() {
        let mut detector = Doubler::new();
        detector.skip_stream_on = Some(1);

        let err = run_local(
            &mut detector,
            &Numbered(3),
            WorkerRange::new(0, 3),
            &score_stream(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingStream { index: 1, .. }));
    }

    #[test]
    fn test_empty_range() {
        let mut detector = Doubler::new();
        let partial = run_local(
            &mut detector,
            &Numbered(2),
            WorkerRange::new(2, 2),
            &score_stream(),
            10,
        )
        .unwrap();

        assert!(partial.detections.is_empty());
        assert!(partial.features["score"].is_empty());
    }
}
