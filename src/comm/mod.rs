//! Communication substrate for collective operations
//!
//! A [`Communicator`] is an explicit handle carrying the caller's rank, the
//! group size and the gather primitive. Every participant must issue the same
//! sequence of gathers; each one is stamped with a sequence number and a tag
//! so the root can tell a structural disagreement apart from a slow peer.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

pub mod local;
pub mod tcp;

pub use local::{LocalCommunicator, LocalGroup};
pub use tcp::{TcpCommunicator, TcpOptions};

/// Collective communication handle for one rank
#[async_trait]
pub trait Communicator: Send + Sync {
    /// This participant's rank
    fn rank(&self) -> usize;

    /// Number of participants in the group
    fn world_size(&self) -> usize;

    /// Gather `payload` from every rank onto `root`
    ///
    /// Blocks until all ranks have contributed. The root receives the
    /// contributions ordered by rank (its own included); every other rank
    /// receives `None`.
    async fn gather(&self, root: usize, tag: &str, payload: Bytes) -> Result<Option<Vec<Bytes>>>;

    fn is_root(&self, root: usize) -> bool {
        self.rank() == root
    }
}

/// One rank's contribution to a gather
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub seq: u64,
    pub rank: usize,
    pub tag: String,
    pub payload: Bytes,
}

impl Envelope {
    /// Check that this contribution belongs to the gather the root is running
    pub(crate) fn verify(&self, seq: u64, tag: &str) -> Result<()> {
        if self.seq != seq {
            return Err(Error::StructureMismatch(format!(
                "rank {} is at gather #{} while the root is at gather #{}",
                self.rank, self.seq, seq
            )));
        }
        if self.tag != tag {
            return Err(Error::StructureMismatch(format!(
                "rank {} contributed '{}' while the root expected '{}'",
                self.rank, self.tag, tag
            )));
        }
        Ok(())
    }
}

pub(crate) fn check_root(root: usize, world_size: usize) -> Result<()> {
    if root >= world_size {
        return Err(Error::config(format!(
            "gather root {} out of range for world_size {}",
            root, world_size
        )));
    }
    Ok(())
}

/// Time left before `deadline`, or `None` when waiting is unbounded
pub(crate) fn remaining(deadline: Option<tokio::time::Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(tokio::time::Instant::now()))
}
