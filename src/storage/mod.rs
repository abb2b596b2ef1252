//! Storage abstraction layer
//!
//! Artifacts are written through this interface so the coordinator does not
//! care where they land.

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

pub mod local;

pub use local::LocalStorage;

/// Storage backend trait
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read object from storage
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Write object to storage, replacing any previous value
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
}
