//! Model file availability
//!
//! Evaluation is often launched while training is still writing the
//! snapshot, so workers poll until the weights file shows up.

use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// How long to wait for the model file
#[derive(Debug, Clone)]
pub struct ModelWait {
    /// Poll until the file exists; fail immediately when false
    pub enabled: bool,
    pub interval: Duration,
    /// `None` polls forever
    pub max_wait: Option<Duration>,
}

impl Default for ModelWait {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            max_wait: None,
        }
    }
}

/// Block until `path` exists, re-checking every `wait.interval`
pub async fn wait_for_model(path: &Path, wait: &ModelWait) -> Result<()> {
    let started = tokio::time::Instant::now();

    loop {
        if tokio::fs::try_exists(path).await? {
            return Ok(());
        }
        if !wait.enabled {
            return Err(Error::ModelUnavailable(path.to_path_buf()));
        }
        if let Some(max_wait) = wait.max_wait {
            if started.elapsed() >= max_wait {
                tracing::warn!(path = %path.display(), waited = ?started.elapsed(), "Gave up waiting for model");
                return Err(Error::ModelUnavailable(path.to_path_buf()));
            }
        }

        tracing::info!(path = %path.display(), "Waiting for model file to exist...");
        tokio::time::sleep(wait.interval).await;
    }
}

/// Model identity used to name outputs: the weights file stem
pub fn model_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "model".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn quick(max_wait: Option<Duration>) -> ModelWait {
        ModelWait {
            enabled: true,
            interval: Duration::from_millis(10),
            max_wait,
        }
    }

    #[tokio::test]
    async fn test_existing_model_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("net.caffemodel");
        std::fs::write(&path, b"weights").unwrap();

        wait_for_model(&path, &ModelWait::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_without_wait_missing_model_fails() {
        let dir = TempDir::new().unwrap();
        let wait = ModelWait {
            enabled: false,
            ..quick(None)
        };

        let err = wait_for_model(&dir.path().join("missing"), &wait)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn test_bounded_wait_gives_up() {
        let dir = TempDir::new().unwrap();
        let result = wait_for_model(
            &dir.path().join("missing"),
            &quick(Some(Duration::from_millis(40))),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_model_appearing_later_is_picked_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("late.caffemodel");

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tokio::fs::write(&writer_path, b"weights").await.unwrap();
        });

        wait_for_model(&path, &quick(Some(Duration::from_secs(10))))
            .await
            .unwrap();
        writer.await.unwrap();
    }

    #[test]
    fn test_model_name() {
        assert_eq!(
            model_name(Path::new("/snapshots/resnet50_iter_50000.caffemodel")),
            "resnet50_iter_50000"
        );
        assert_eq!(model_name(Path::new("")), "model");
    }
}
