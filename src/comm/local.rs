//! In-process communicator backed by tokio channels
//!
//! Every rank owns an inbox; gathers send envelopes to the root's inbox. Used
//! for single-host runs where each worker is a task, and in tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use super::{check_root, remaining, Communicator, Envelope};
use crate::{Error, Result};

/// Factory for a group of connected [`LocalCommunicator`]s
pub struct LocalGroup;

impl LocalGroup {
    /// Create handles for ranks `0..world_size`, indexed by rank
    pub fn create(
        world_size: usize,
        gather_timeout: Option<Duration>,
    ) -> Result<Vec<LocalCommunicator>> {
        if world_size == 0 {
            return Err(Error::config("world_size must be positive"));
        }

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..world_size).map(|_| mpsc::unbounded_channel()).unzip();

        Ok(receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| LocalCommunicator {
                rank,
                world_size,
                gather_timeout,
                next_seq: AtomicU64::new(0),
                peers: senders.clone(),
                inbox: Mutex::new(Inbox {
                    receiver,
                    pending: HashMap::new(),
                }),
            })
            .collect())
    }
}

struct Inbox {
    receiver: mpsc::UnboundedReceiver<Envelope>,
    /// Contributions that arrived ahead of the gather they belong to
    pending: HashMap<u64, Vec<Envelope>>,
}

/// One rank's handle inside a [`LocalGroup`]
pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    gather_timeout: Option<Duration>,
    next_seq: AtomicU64,
    peers: Vec<mpsc::UnboundedSender<Envelope>>,
    inbox: Mutex<Inbox>,
}

impl LocalCommunicator {
    fn place(
        slots: &mut [Option<Bytes>],
        envelope: Envelope,
        seq: u64,
        tag: &str,
    ) -> Result<()> {
        envelope.verify(seq, tag)?;
        let slot = slots.get_mut(envelope.rank).ok_or_else(|| {
            Error::communication(format!("contribution from unknown rank {}", envelope.rank))
        })?;
        if slot.is_some() {
            return Err(Error::StructureMismatch(format!(
                "rank {} contributed twice to gather #{}",
                envelope.rank, seq
            )));
        }
        *slot = Some(envelope.payload);
        Ok(())
    }
}

#[async_trait]
impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn gather(&self, root: usize, tag: &str, payload: Bytes) -> Result<Option<Vec<Bytes>>> {
        check_root(root, self.world_size)?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        if self.rank != root {
            let envelope = Envelope {
                seq,
                rank: self.rank,
                tag: tag.to_string(),
                payload,
            };
            self.peers[root]
                .send(envelope)
                .map_err(|_| Error::communication(format!("inbox of rank {} is closed", root)))?;
            return Ok(None);
        }

        let started = tokio::time::Instant::now();
        let deadline = self.gather_timeout.map(|t| started + t);

        let mut inbox = self.inbox.lock().await;
        let mut slots: Vec<Option<Bytes>> = vec![None; self.world_size];
        slots[self.rank] = Some(payload);
        let mut received = 1;

        for envelope in inbox.pending.remove(&seq).unwrap_or_default() {
            Self::place(&mut slots, envelope, seq, tag)?;
            received += 1;
        }

        while received < self.world_size {
            let next = match remaining(deadline) {
                Some(left) => match tokio::time::timeout(left, inbox.receiver.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        let rank = slots.iter().position(Option::is_none).unwrap_or(0);
                        return Err(Error::GatherTimeout {
                            rank,
                            waited: started.elapsed(),
                        });
                    }
                },
                None => inbox.receiver.recv().await,
            };

            let envelope =
                next.ok_or_else(|| Error::communication("all peers have disconnected"))?;
            if envelope.seq > seq {
                inbox.pending.entry(envelope.seq).or_default().push(envelope);
                continue;
            }

            Self::place(&mut slots, envelope, seq, tag)?;
            received += 1;
        }

        tracing::trace!(seq, tag, ranks = self.world_size, "Local gather complete");
        Ok(Some(slots.into_iter().flatten().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_gather_orders_by_rank() {
        let group: Vec<Arc<LocalCommunicator>> = LocalGroup::create(3, None)
            .unwrap()
            .into_iter()
            .map(Arc::new)
            .collect();

        // Non-roots contribute in reverse rank order
        for comm in group.iter().skip(1).rev() {
            let payload = Bytes::from(vec![comm.rank() as u8]);
            assert!(comm.gather(0, "score", payload).await.unwrap().is_none());
        }

        let gathered = group[0]
            .gather(0, "score", Bytes::from_static(&[0]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            gathered,
            vec![
                Bytes::from_static(&[0]),
                Bytes::from_static(&[1]),
                Bytes::from_static(&[2])
            ]
        );
    }

    #[tokio::test]
    async fn test_early_contributions_are_buffered() {
        let group = LocalGroup::create(2, Some(Duration::from_secs(5))).unwrap();

        // Rank 1 runs two gathers ahead of the root
        group[1].gather(0, "a", Bytes::from_static(b"a1")).await.unwrap();
        group[1].gather(0, "b", Bytes::from_static(b"b1")).await.unwrap();

        let first = group[0].gather(0, "a", Bytes::from_static(b"a0")).await.unwrap().unwrap();
        let second = group[0].gather(0, "b", Bytes::from_static(b"b0")).await.unwrap().unwrap();

        assert_eq!(first[1], Bytes::from_static(b"a1"));
        assert_eq!(second[1], Bytes::from_static(b"b1"));
    }

    #[tokio::test]
    async fn test_tag_mismatch_is_reported() {
        let group = LocalGroup::create(2, Some(Duration::from_secs(5))).unwrap();

        group[1].gather(0, "features/feat", Bytes::new()).await.unwrap();
        let err = group[0]
            .gather(0, "features/pid_rank", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StructureMismatch(_)));
    }

    #[tokio::test]
    async fn test_missing_peer_times_out() {
        let group = LocalGroup::create(3, Some(Duration::from_millis(50))).unwrap();

        group[1].gather(0, "score", Bytes::new()).await.unwrap();
        let err = group[0].gather(0, "score", Bytes::new()).await.unwrap_err();
        match err {
            Error::GatherTimeout { rank, .. } => assert_eq!(rank, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_rank_group() {
        let group = LocalGroup::create(1, None).unwrap();
        let gathered = group[0]
            .gather(0, "score", Bytes::from_static(b"x"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gathered, vec![Bytes::from_static(b"x")]);
    }

    #[tokio::test]
    async fn test_invalid_root() {
        let group = LocalGroup::create(2, None).unwrap();
        assert!(group[0].gather(2, "score", Bytes::new()).await.is_err());
        assert!(LocalGroup::create(0, None).is_err());
    }
}
