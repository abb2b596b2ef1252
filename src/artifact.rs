//! Persisted evaluation artifacts
//!
//! Artifact file format:
//! - Magic bytes: "SEAR" (4 bytes)
//! - Version: u32 (4 bytes)
//! - Frame: [`ArtifactHeader`] followed by the value, see [`crate::codec`]

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::codec::{decode_frame_within, encode_frame_within};
use crate::storage::StorageBackend;
use crate::types::{FeatureSet, ItemDetections};
use crate::{Error, Result};

pub const DETECTIONS_ARTIFACT: &str = "gallery_detections.bin";
pub const FEATURES_ARTIFACT: &str = "gallery_features.bin";

const ARTIFACT_MAGIC: &[u8; 4] = b"SEAR";
const ARTIFACT_VERSION: u32 = 1;

/// Artifacts are bounded only by the frame's length field, not by the wire limit
const ARTIFACT_MAX_LEN: u32 = u32::MAX;
const _: () = assert!(ARTIFACT_MAX_LEN > crate::codec::MAX_FRAME_LEN);

/// Metadata stored in front of every artifact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactHeader {
    pub kind: String,
    pub items: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct ArtifactBody<T> {
    header: ArtifactHeader,
    value: T,
}

/// Storage keys of one evaluation's artifacts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactPaths {
    pub detections: String,
    pub features: String,
}

impl ArtifactPaths {
    /// Deterministic location derived from dataset name and model identity
    pub fn new(dataset: &str, model: &str) -> Self {
        let prefix = format!("{}/{}", dataset, model);
        Self {
            detections: format!("{}/{}", prefix, DETECTIONS_ARTIFACT),
            features: format!("{}/{}", prefix, FEATURES_ARTIFACT),
        }
    }
}

/// Opaque persist/load pair for aggregated results
#[derive(Clone)]
pub struct ArtifactStore {
    storage: Arc<dyn StorageBackend>,
}

impl ArtifactStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub async fn persist<T: Serialize>(&self, key: &str, kind: &str, items: usize, value: &T) -> Result<()> {
        let body = ArtifactBody {
            header: ArtifactHeader {
                kind: kind.to_string(),
                items,
                created_at: Utc::now(),
            },
            value,
        };
        let frame = encode_frame_within(&body, ARTIFACT_MAX_LEN)?;

        let mut buffer = BytesMut::with_capacity(8 + frame.len());
        buffer.put_slice(ARTIFACT_MAGIC);
        buffer.put_u32(ARTIFACT_VERSION);
        buffer.put_slice(&frame);

        self.storage.put(key, buffer.freeze()).await?;
        tracing::info!(key, kind, items, "Persisted artifact");
        Ok(())
    }

    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<(ArtifactHeader, T)> {
        let data = self.storage.get(key).await?;
        if data.len() < 8 || &data[..4] != ARTIFACT_MAGIC {
            return Err(Error::storage(format!("Invalid artifact {}: bad magic bytes", key)));
        }

        let mut cursor = &data[4..];
        let version = cursor.get_u32();
        if version != ARTIFACT_VERSION {
            return Err(Error::storage(format!(
                "Unsupported artifact version: {}",
                version
            )));
        }

        let body: ArtifactBody<T> = decode_frame_within(cursor, ARTIFACT_MAX_LEN)?;
        Ok((body.header, body.value))
    }

    /// Write the aggregated detections and features
    pub async fn persist_results(
        &self,
        paths: &ArtifactPaths,
        detections: &[ItemDetections],
        features: &FeatureSet,
    ) -> Result<()> {
        self.persist(&paths.detections, "detections", detections.len(), &detections)
            .await?;
        let items = features.values().map(Vec::len).max().unwrap_or(0);
        self.persist(&paths.features, "features", items, features).await
    }

    pub async fn load_results(&self, paths: &ArtifactPaths) -> Result<(Vec<ItemDetections>, FeatureSet)> {
        let (_, detections) = self.load(&paths.detections).await?;
        let (_, features) = self.load(&paths.features).await?;
        Ok((detections, features))
    }
}
