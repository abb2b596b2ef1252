//! Multi-process communicator over TCP
//!
//! The coordinator listens on a known address and every other rank dials in
//! and introduces itself with a `Hello` frame. A gather is one framed
//! [`Envelope`] per worker, read by the coordinator in rank order.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use super::{check_root, remaining, Communicator, Envelope};
use crate::codec::{read_frame, write_frame};
use crate::{Error, Result};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Settings shared by every rank of a TCP group
#[derive(Debug, Clone)]
pub struct TcpOptions {
    pub world_size: usize,
    pub coordinator_rank: usize,
    /// `None` waits for peers indefinitely
    pub gather_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

impl TcpOptions {
    pub fn new(world_size: usize, coordinator_rank: usize) -> Self {
        Self {
            world_size,
            coordinator_rank,
            gather_timeout: None,
            connect_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    rank: usize,
    world_size: usize,
}

enum Link {
    /// Connections to workers, indexed by rank (`None` at the coordinator's own slot)
    Coordinator(Vec<Option<Mutex<TcpStream>>>),
    Worker(Mutex<TcpStream>),
}

/// One rank's handle in a TCP group
pub struct TcpCommunicator {
    rank: usize,
    options: TcpOptions,
    next_seq: AtomicU64,
    link: Link,
}

impl TcpCommunicator {
    /// Join the group: bind and accept on the coordinator, dial elsewhere
    pub async fn establish(address: &str, rank: usize, options: TcpOptions) -> Result<Self> {
        if rank == options.coordinator_rank {
            let listener = TcpListener::bind(address).await.map_err(|e| {
                Error::communication(format!("Failed to bind {}: {}", address, e))
            })?;
            Self::accept(listener, options).await
        } else {
            Self::connect(address, rank, options).await
        }
    }

    /// Accept every worker of the group on `listener`
    pub async fn accept(listener: TcpListener, options: TcpOptions) -> Result<Self> {
        check_root(options.coordinator_rank, options.world_size)?;

        let deadline = tokio::time::Instant::now() + options.connect_timeout;
        let mut peers: Vec<Option<Mutex<TcpStream>>> =
            (0..options.world_size).map(|_| None).collect();
        let mut joined = 1;

        while joined < options.world_size {
            let (mut stream, addr) = tokio::time::timeout_at(deadline, listener.accept())
                .await
                .map_err(|_| {
                    let missing: Vec<usize> = peers
                        .iter()
                        .enumerate()
                        .filter(|(rank, p)| p.is_none() && *rank != options.coordinator_rank)
                        .map(|(rank, _)| rank)
                        .collect();
                    Error::communication(format!(
                        "Timed out waiting for ranks {:?} to connect",
                        missing
                    ))
                })??;
            stream.set_nodelay(true)?;

            let hello: Hello = tokio::time::timeout_at(deadline, read_frame(&mut stream))
                .await
                .map_err(|_| Error::communication(format!("No hello from {}", addr)))??;

            if hello.world_size != options.world_size {
                return Err(Error::config(format!(
                    "rank {} at {} expects world_size {}, coordinator has {}",
                    hello.rank, addr, hello.world_size, options.world_size
                )));
            }
            if hello.rank >= options.world_size || hello.rank == options.coordinator_rank {
                return Err(Error::config(format!(
                    "peer at {} announced invalid rank {}",
                    addr, hello.rank
                )));
            }
            if peers[hello.rank].is_some() {
                return Err(Error::config(format!(
                    "rank {} connected twice (second from {})",
                    hello.rank, addr
                )));
            }

            tracing::info!(rank = hello.rank, %addr, "Worker joined");
            peers[hello.rank] = Some(Mutex::new(stream));
            joined += 1;
        }

        Ok(Self {
            rank: options.coordinator_rank,
            options,
            next_seq: AtomicU64::new(0),
            link: Link::Coordinator(peers),
        })
    }

    /// Dial the coordinator at `address`, retrying until the connect timeout
    pub async fn connect(address: &str, rank: usize, options: TcpOptions) -> Result<Self> {
        if rank >= options.world_size || rank == options.coordinator_rank {
            return Err(Error::config(format!(
                "rank {} cannot join as a worker of a {}-rank group coordinated by rank {}",
                rank, options.world_size, options.coordinator_rank
            )));
        }

        let deadline = tokio::time::Instant::now() + options.connect_timeout;
        let mut stream = loop {
            match TcpStream::connect(address).await {
                Ok(stream) => break stream,
                Err(e) if tokio::time::Instant::now() + CONNECT_RETRY_INTERVAL < deadline => {
                    tracing::debug!(rank, address, error = %e, "Coordinator not reachable yet");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(Error::communication(format!(
                        "Failed to reach coordinator at {}: {}",
                        address, e
                    )))
                }
            }
        };
        stream.set_nodelay(true)?;

        write_frame(
            &mut stream,
            &Hello {
                rank,
                world_size: options.world_size,
            },
        )
        .await?;

        Ok(Self {
            rank,
            options,
            next_seq: AtomicU64::new(0),
            link: Link::Worker(Mutex::new(stream)),
        })
    }
}

#[async_trait]
impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.options.world_size
    }

    async fn gather(&self, root: usize, tag: &str, payload: Bytes) -> Result<Option<Vec<Bytes>>> {
        check_root(root, self.options.world_size)?;
        if root != self.options.coordinator_rank {
            return Err(Error::communication(format!(
                "TCP transport only gathers to the coordinator (rank {}), not rank {}",
                self.options.coordinator_rank, root
            )));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let peers = match &self.link {
            Link::Worker(stream) => {
                let envelope = Envelope {
                    seq,
                    rank: self.rank,
                    tag: tag.to_string(),
                    payload,
                };
                let mut stream = stream.lock().await;
                write_frame(&mut *stream, &envelope).await?;
                return Ok(None);
            }
            Link::Coordinator(peers) => peers,
        };

        let started = tokio::time::Instant::now();
        let deadline = self.options.gather_timeout.map(|t| started + t);
        let mut gathered = Vec::with_capacity(self.options.world_size);
        let mut own = Some(payload);

        for (rank, peer) in peers.iter().enumerate() {
            let Some(peer) = peer else {
                gathered.push(own.take().unwrap_or_default());
                continue;
            };

            let mut stream = peer.lock().await;
            let envelope: Envelope = match remaining(deadline) {
                Some(left) => tokio::time::timeout(left, read_frame(&mut *stream))
                    .await
                    .map_err(|_| Error::GatherTimeout {
                        rank,
                        waited: started.elapsed(),
                    })??,
                None => read_frame(&mut *stream).await?,
            };

            if envelope.rank != rank {
                return Err(Error::communication(format!(
                    "connection of rank {} carried a frame from rank {}",
                    rank, envelope.rank
                )));
            }
            envelope.verify(seq, tag)?;
            gathered.push(envelope.payload);
        }

        tracing::trace!(seq, tag, ranks = gathered.len(), "TCP gather complete");
        Ok(Some(gathered))
    }
}
