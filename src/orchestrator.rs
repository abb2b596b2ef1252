//! Distributed evaluation driver
//!
//! Every rank partitions, infers, reduces and joins the gathers. Only the
//! coordinator goes on to persist the aggregated results and evaluate them.

use serde::Serialize;

use crate::artifact::{ArtifactPaths, ArtifactStore};
use crate::comm::Communicator;
use crate::dataset::{Dataset, EvaluationReport, EvaluationRequest};
use crate::gather::{collect, Payload};
use crate::partition::assign;
use crate::pipeline::{run_local, Detector, PartialResult};
use crate::reduce::ReductionPolicy;
use crate::types::{Array, FeatureSet, ItemDetections};
use crate::{Error, Result};

/// What a run asks for and how it is scored
#[derive(Debug, Clone)]
pub struct EvalSettings {
    pub coordinator_rank: usize,
    /// Feature streams requested from the detector
    pub streams: Vec<String>,
    pub reduction: ReductionPolicy,
    /// Stream holding ranked identities, handed to evaluation
    pub rank_stream: String,
    /// Stream holding identity labels, handed to evaluation
    pub label_stream: String,
    pub det_thresh: f32,
    pub progress_every: usize,
}

impl EvalSettings {
    /// Check everything that can be checked before work is distributed
    pub fn validate(&self) -> Result<()> {
        if !self.det_thresh.is_finite() {
            return Err(Error::config("det_thresh must be a finite number"));
        }

        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.streams.iter().find(|s| !seen.insert(s.as_str())) {
            return Err(Error::config(format!("stream '{}' requested twice", dup)));
        }

        let produced = self.reduction.output_streams(&self.streams);
        for needed in [&self.rank_stream, &self.label_stream] {
            if !produced.contains(needed) {
                return Err(Error::config(format!(
                    "evaluation needs stream '{}' but the requested streams {:?} yield {:?}",
                    needed, self.streams, produced
                )));
            }
        }
        Ok(())
    }
}

/// Gathered results in global item order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedResult {
    pub detections: Vec<ItemDetections>,
    pub features: FeatureSet,
}

impl AggregatedResult {
    /// Every stream must cover the whole index space
    pub fn validate(&self, total_items: usize) -> Result<()> {
        if self.detections.len() != total_items {
            return Err(Error::internal(format!(
                "aggregated detections cover {} items, expected {}",
                self.detections.len(),
                total_items
            )));
        }
        for (name, stream) in &self.features {
            if stream.len() != total_items {
                return Err(Error::internal(format!(
                    "aggregated stream '{}' covers {} items, expected {}",
                    name,
                    stream.len(),
                    total_items
                )));
            }
        }
        Ok(())
    }

    fn stream(&self, name: &str) -> Result<&[Array]> {
        self.features
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::config(format!("aggregated results lack stream '{}'", name)))
    }
}

/// Coordinator's result of a run
#[derive(Debug, Clone, Serialize)]
pub struct EvalOutcome {
    pub report: EvaluationReport,
    pub artifacts: ArtifactPaths,
}

pub struct Evaluator {
    settings: EvalSettings,
    model: String,
}

impl Evaluator {
    /// `model` names the outputs, usually the weights file stem
    pub fn new(settings: EvalSettings, model: impl Into<String>) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            model: model.into(),
        })
    }

    /// Run this rank's share and, on the coordinator, finish the evaluation
    ///
    /// Collective: every rank of `comm` must call this. Returns `None` on
    /// non-coordinating ranks.
    pub async fn run(
        &self,
        comm: &dyn Communicator,
        dataset: &dyn Dataset,
        detector: &mut dyn Detector,
        store: &ArtifactStore,
    ) -> Result<Option<EvalOutcome>> {
        let root = self.settings.coordinator_rank;
        let Some(mut aggregated) = self.distribute(comm, dataset, detector).await? else {
            return Ok(None);
        };
        debug_assert!(comm.is_root(root));

        dataset.postprocess(&mut aggregated.features)?;

        let paths = ArtifactPaths::new(dataset.name(), &self.model);
        store
            .persist_results(&paths, &aggregated.detections, &aggregated.features)
            .await?;

        let report = dataset.evaluate(EvaluationRequest {
            detections: &aggregated.detections,
            ranks: aggregated.stream(&self.settings.rank_stream)?,
            labels: aggregated.stream(&self.settings.label_stream)?,
            threshold: self.settings.det_thresh,
        })?;
        tracing::info!(report = ?report, "Evaluation complete");

        Ok(Some(EvalOutcome {
            report,
            artifacts: paths,
        }))
    }

    /// Partition, infer, reduce and gather; the coordinator gets the merged result
    pub async fn distribute(
        &self,
        comm: &dyn Communicator,
        dataset: &dyn Dataset,
        detector: &mut dyn Detector,
    ) -> Result<Option<AggregatedResult>> {
        let root = self.settings.coordinator_rank;
        let total = dataset.len();
        let range = assign(total, comm.world_size(), comm.rank())?;
        tracing::info!(
            rank = comm.rank(),
            world_size = comm.world_size(),
            start = range.start,
            end = range.end,
            "Processing assigned range"
        );

        let PartialResult {
            detections,
            mut features,
            ..
        } = run_local(
            detector,
            dataset,
            range,
            &self.settings.streams,
            self.settings.progress_every,
        )?;
        self.settings.reduction.apply(&mut features)?;

        let detections = collect(comm, root, Payload::stream(detections)).await?;
        let features = collect(comm, root, Payload::streams(features)).await?;

        let (Some(detections), Some(features)) = (detections, features) else {
            return Ok(None);
        };

        let aggregated = AggregatedResult {
            detections: detections
                .into_stream()
                .ok_or_else(|| Error::internal("detections gathered as a mapping"))?,
            features: features
                .into_stream_map()
                .ok_or_else(|| Error::internal("features gathered with nested streams"))?,
        };
        aggregated.validate(total)?;
        tracing::info!(
            items = total,
            streams = ?aggregated.features.keys().collect::<Vec<_>>(),
            "Aggregated results from all ranks"
        );

        Ok(Some(aggregated))
    }
}
