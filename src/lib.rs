//! shardeval - distributed detection and feature evaluation
//!
//! Splits an image collection across workers (one per accelerator device),
//! runs inference on each worker's contiguous slice and gathers the partial
//! results back onto a coordinator in global item order:
//! - Contiguous near-equal partitioning of the index space
//! - Top-K reduction of probability streams before they leave a worker
//! - Rank-ordered collective gather over in-process channels or TCP
//! - Persisted artifacts and evaluation on the coordinator

pub mod artifact;
pub mod codec;
pub mod comm;
pub mod config;
pub mod dataset;
pub mod error;
pub mod gather;
pub mod model;
pub mod orchestrator;
pub mod partition;
pub mod pipeline;
pub mod reduce;
pub mod replay;
pub mod storage;
pub mod types;

pub use error::{Error, Result};
