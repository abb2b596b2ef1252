//! Local filesystem storage backend

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::{Error, Result};

use super::StorageBackend;

/// Local filesystem storage rooted at a directory
pub struct LocalStorage {
    root_path: PathBuf,
}

impl LocalStorage {
    pub fn new(root_path: impl Into<PathBuf>) -> Result<Self> {
        let root_path = root_path.into();
        std::fs::create_dir_all(&root_path)?;
        Ok(Self { root_path })
    }

    /// Map a key onto a path below the root, refusing keys that escape it
    pub fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(Error::storage(format!("Invalid storage key: {}", key)));
        }
        Ok(self.root_path.join(relative))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.resolve_path(key)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| Error::storage(format!("Failed to read {}: {}", path.display(), e)))?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.resolve_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write beside the target and rename so readers never see a partial file
        let staging = path.with_extension("partial");
        fs::write(&staging, &data).await?;
        fs::rename(&staging, &path).await?;
        Ok(())
    }
}
