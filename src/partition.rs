//! Work partitioning across workers
//!
//! The global index space `[0, total)` is split into contiguous half-open
//! ranges, one per worker rank. Ranks below `total % workers` take one extra
//! item, so no two ranges differ by more than one and concatenating the
//! ranges in rank order yields the original item order.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::{Error, Result};

/// Contiguous `[start, end)` slice of the global index space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerRange {
    pub start: usize,
    pub end: usize,
}

impl WorkerRange {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn indices(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Compute the range owned by `worker_rank`
pub fn assign(total_items: usize, worker_count: usize, worker_rank: usize) -> Result<WorkerRange> {
    if worker_count == 0 {
        return Err(Error::config("worker_count must be positive"));
    }
    if worker_rank >= worker_count {
        return Err(Error::config(format!(
            "worker_rank {} out of range for {} workers",
            worker_rank, worker_count
        )));
    }

    let base = total_items / worker_count;
    let remainder = total_items % worker_count;

    let start = worker_rank * base + worker_rank.min(remainder);
    let end = start + base + usize::from(worker_rank < remainder);

    Ok(WorkerRange::new(start, end))
}

/// Ranges for every rank, in rank order
pub fn assign_all(total_items: usize, worker_count: usize) -> Result<Vec<WorkerRange>> {
    (0..worker_count)
        .map(|rank| assign(total_items, worker_count, rank))
        .collect()
}

/// Identity of one worker within the group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// This worker's rank (0-based)
    pub rank: usize,

    /// Total number of workers in the group
    pub world_size: usize,

    /// Accelerator device bound to this rank
    pub device: u32,
}

impl WorkerConfig {
    /// Bind `rank` to its device
    ///
    /// Fails when there are fewer devices than workers; this is a startup
    /// error, not a partitioning one.
    pub fn new(rank: usize, world_size: usize, devices: &[u32]) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::config("world_size must be positive"));
        }
        if rank >= world_size {
            return Err(Error::config(format!(
                "rank {} out of range for world_size {}",
                rank, world_size
            )));
        }
        if devices.len() < world_size {
            return Err(Error::config(format!(
                "number of devices ({}) must be >= world_size ({})",
                devices.len(),
                world_size
            )));
        }

        Ok(Self {
            rank,
            world_size,
            device: devices[rank],
        })
    }

    pub fn is_coordinator(&self, coordinator_rank: usize) -> bool {
        self.rank == coordinator_rank
    }

    /// The slice of `total_items` this worker owns
    pub fn range(&self, total_items: usize) -> Result<WorkerRange> {
        assign(total_items, self.world_size, self.rank)
    }
}
