//! Error types for shardeval

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Inference failed on item {index}: {message}")]
    Inference { index: usize, message: String },

    #[error("Stream '{stream}' missing from inference output of item {index}")]
    MissingStream { stream: String, index: usize },

    #[error("Invalid array: {0}")]
    InvalidArray(String),

    #[error("Aggregation structure mismatch: {0}")]
    StructureMismatch(String),

    #[error("Gather timed out after {waited:?} waiting for rank {rank}")]
    GatherTimeout { rank: usize, waited: Duration },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Model file not available: {}", .0.display())]
    ModelUnavailable(PathBuf),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn communication(msg: impl Into<String>) -> Self {
        Error::Communication(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Error::Codec(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Error::Dataset(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}
