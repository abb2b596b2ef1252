//! Ordered collective gather of partial results
//!
//! Each worker holds the outputs for its contiguous slice of the index space.
//! Gathering the slices onto the root and concatenating them in rank order
//! restores global item order without sending any indices.

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::codec::{from_msgpack, to_msgpack};
use crate::comm::Communicator;
use crate::{Error, Result};

/// Shape of a partial result: a single stream or named sub-payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload<T> {
    Stream(Vec<T>),
    Streams(BTreeMap<String, Payload<T>>),
}

impl<T> Payload<T> {
    pub fn stream(items: Vec<T>) -> Self {
        Payload::Stream(items)
    }

    /// Build a mapping of plain streams
    pub fn streams<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Vec<T>)>,
    {
        Payload::Streams(
            entries
                .into_iter()
                .map(|(name, items)| (name.into(), Payload::Stream(items)))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&Payload<T>> {
        match self {
            Payload::Streams(children) => children.get(name),
            Payload::Stream(_) => None,
        }
    }

    pub fn as_stream(&self) -> Option<&[T]> {
        match self {
            Payload::Stream(items) => Some(items),
            Payload::Streams(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<Vec<T>> {
        match self {
            Payload::Stream(items) => Some(items),
            Payload::Streams(_) => None,
        }
    }

    /// Flatten a mapping of plain streams back into `name -> items`
    ///
    /// Returns `None` if the payload is not a mapping of plain streams.
    pub fn into_stream_map(self) -> Option<BTreeMap<String, Vec<T>>> {
        match self {
            Payload::Streams(children) => children
                .into_iter()
                .map(|(name, child)| child.into_stream().map(|items| (name, items)))
                .collect(),
            Payload::Stream(_) => None,
        }
    }
}

/// Gather `payload` from every rank onto `root`
///
/// Collective: every rank must call this with a payload of the same
/// structure. The root gets the rank-ordered concatenation of every stream;
/// other ranks get `None`.
pub async fn collect<T, C>(comm: &C, root: usize, payload: Payload<T>) -> Result<Option<Payload<T>>>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    C: Communicator + ?Sized,
{
    collect_at(comm, root, String::new(), payload).await
}

fn collect_at<'a, T, C>(
    comm: &'a C,
    root: usize,
    path: String,
    payload: Payload<T>,
) -> BoxFuture<'a, Result<Option<Payload<T>>>>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    C: Communicator + ?Sized,
{
    async move {
        match payload {
            Payload::Stream(items) => {
                let gathered = gather_stream(comm, root, &path, items).await?;
                Ok(gathered.map(Payload::Stream))
            }
            Payload::Streams(children) => {
                let keys: Vec<&String> = children.keys().collect();
                agree_on_keys(comm, root, &path, &keys).await?;

                let mut merged = BTreeMap::new();
                for (name, child) in children {
                    let child_path = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{}/{}", path, name)
                    };
                    if let Some(result) = collect_at(comm, root, child_path, child).await? {
                        merged.insert(name, result);
                    }
                }

                if comm.is_root(root) {
                    Ok(Some(Payload::Streams(merged)))
                } else {
                    Ok(None)
                }
            }
        }
    }
    .boxed()
}

/// Make sure every rank is about to gather the same set of streams
async fn agree_on_keys<C>(comm: &C, root: usize, path: &str, keys: &[&String]) -> Result<()>
where
    C: Communicator + ?Sized,
{
    let tag = format!("{}#keys", path);
    let encoded = Bytes::from(to_msgpack(keys)?);

    let Some(contributions) = comm.gather(root, &tag, encoded).await? else {
        return Ok(());
    };

    for (rank, contribution) in contributions.iter().enumerate() {
        let theirs: Vec<String> = from_msgpack(contribution)?;
        if theirs.len() != keys.len() || theirs.iter().zip(keys).any(|(a, b)| a != *b) {
            return Err(Error::StructureMismatch(format!(
                "rank {} holds streams {:?} under '{}', root holds {:?}",
                rank, theirs, path, keys
            )));
        }
    }
    Ok(())
}

async fn gather_stream<T, C>(comm: &C, root: usize, tag: &str, items: Vec<T>) -> Result<Option<Vec<T>>>
where
    T: Serialize + DeserializeOwned,
    C: Communicator + ?Sized,
{
    let encoded = Bytes::from(to_msgpack(&items)?);
    let local_len = items.len();
    drop(items);

    let Some(contributions) = comm.gather(root, tag, encoded).await? else {
        tracing::debug!(rank = comm.rank(), tag, items = local_len, "Contributed stream");
        return Ok(None);
    };

    let mut merged = Vec::new();
    for (rank, contribution) in contributions.iter().enumerate() {
        let part: Vec<T> = from_msgpack(contribution).map_err(|e| {
            Error::codec(format!("stream '{}' from rank {}: {}", tag, rank, e))
        })?;
        tracing::debug!(rank, tag, items = part.len(), "Received stream slice");
        merged.extend(part);
    }

    Ok(Some(merged))
}
