//! Replica fan-out with tunable quorums.
//!
//! A mutation is dispatched to every active replica at once; the operation
//! completes as soon as `quorum` successes arrive. Outstanding replies keep
//! running fire-and-forget and are observed only for logging. When quorum
//! becomes unreachable the error list collapses to a single outcome:
//! NotFound wins over generic failure.

use crate::peer::{PeerClient, PeerError};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use quorus_common::{Object, ObjectError, Reference, StorageMethod};
use quorus_ring::{NodeId, RedundancySet, RedundantNode};
use quorus_store::{ObjectStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// A single replica's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaResponse {
    Ok(u64),
    NotFound,
    Unavailable,
    Timeout,
    Error(String),
}

impl ReplicaResponse {
    fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            StoreError::LockedContainer(_) => Self::Unavailable,
            StoreError::InvalidData(e) => Self::Error(e),
            StoreError::Internal(e) => Self::Error(e),
        }
    }

    fn from_peer(err: PeerError) -> Self {
        match err {
            PeerError::NotFound => Self::NotFound,
            PeerError::Unavailable => Self::Unavailable,
            PeerError::Timeout => Self::Timeout,
            PeerError::Rpc(e) => Self::Error(e),
        }
    }
}

/// Quorum for a mutation: W for PUT, D for DELETE. When the resolved
/// replica count falls short of the configured quorum, the effective
/// quorum degrades to `max(1, replicas − 1)`.
pub fn write_quorum(method: StorageMethod, set: &RedundancySet) -> usize {
    let configured = match method {
        StorageMethod::Put => set.w,
        StorageMethod::Delete => set.d,
    };
    let replicas = set.num_of_replicas();
    if replicas < configured {
        std::cmp::max(1, replicas.saturating_sub(1))
    } else {
        configured
    }
}

/// The available sublist of a redundancy set, iff it can satisfy `quorum`.
pub fn active_redundancies(
    quorum: usize,
    set: &RedundancySet,
) -> Result<Vec<RedundantNode>, ObjectError> {
    let available = set.available();
    if quorum <= available.len() {
        Ok(available)
    } else {
        Err(ObjectError::NotSatisfyQuorum {
            needed: quorum,
            available: available.len(),
        })
    }
}

/// Fan a mutation out to `active` and wait for `quorum` successes.
///
/// Returns the ETag of the write (0 for DELETE). Peer calls get a fresh
/// [`Reference`] each; the per-call deadline is `timeout`.
pub async fn replicate<S: ObjectStore, P: PeerClient>(
    store: &Arc<S>,
    peers: &Arc<P>,
    local: NodeId,
    method: StorageMethod,
    quorum: usize,
    active: Vec<RedundantNode>,
    object: &Object,
    timeout: Duration,
) -> Result<u64, ObjectError> {
    let total = active.len();
    let mut futs = FuturesUnordered::new();

    for replica in active {
        if replica.node == local {
            let store = store.clone();
            let object = object.clone();
            futs.push(tokio::spawn(async move {
                let response = match method {
                    StorageMethod::Put => store
                        .put(object.addr_id, &object.key, object.clone())
                        .map(ReplicaResponse::Ok)
                        .unwrap_or_else(ReplicaResponse::from_store),
                    StorageMethod::Delete => store
                        .delete(object.addr_id, &object.key, object.clone())
                        .map(|_| ReplicaResponse::Ok(0))
                        .unwrap_or_else(ReplicaResponse::from_store),
                };
                if !matches!(response, ReplicaResponse::Ok(_)) {
                    tracing::debug!(
                        "local {} of '{}' failed: {:?}",
                        method.as_str(),
                        object.key,
                        response
                    );
                }
                response
            }));
        } else {
            let peers = peers.clone();
            let object = object.clone();
            futs.push(tokio::spawn(async move {
                let reference = Reference::mint();
                let result = match method {
                    StorageMethod::Put => {
                        tokio::time::timeout(timeout, peers.put(replica.addr, reference, &object))
                            .await
                            .map_err(|_| PeerError::Timeout)
                            .and_then(|r| r)
                    }
                    StorageMethod::Delete => tokio::time::timeout(
                        timeout,
                        peers.delete(replica.addr, reference, &object),
                    )
                    .await
                    .map_err(|_| PeerError::Timeout)
                    .and_then(|r| r)
                    .map(|_| 0),
                };
                match result {
                    Ok(etag) => ReplicaResponse::Ok(etag),
                    Err(e) => {
                        // Stragglers past quorum land here too; logging is
                        // all the observation they get.
                        tracing::debug!(
                            "replica {} of '{}' on {} failed: {}",
                            method.as_str(),
                            object.key,
                            replica.addr,
                            e
                        );
                        ReplicaResponse::from_peer(e)
                    }
                }
            }));
        }
    }

    let mut successes = 0usize;
    let mut received = 0usize;
    let mut etag = 0u64;
    let mut errors: Vec<ReplicaResponse> = Vec::new();

    while let Some(joined) = futs.next().await {
        received += 1;
        let response =
            joined.unwrap_or_else(|e| ReplicaResponse::Error(format!("replica task: {}", e)));
        match response {
            ReplicaResponse::Ok(e) => {
                successes += 1;
                etag = e;
                if successes >= quorum {
                    quorus_metrics::metrics()
                        .replications
                        .with_label_values(&[method.as_str(), "ok"])
                        .inc();
                    return Ok(etag);
                }
            }
            other => errors.push(other),
        }
        // Quorum unreachable: fail now rather than wait out stragglers.
        if successes + (total - received) < quorum {
            break;
        }
    }

    quorus_metrics::metrics()
        .replications
        .with_label_values(&[method.as_str(), "failed"])
        .inc();
    quorus_metrics::metrics().quorum_failures.inc();

    Err(collapse_errors(quorum, successes, &errors))
}

/// Collapse a replica error list to one outcome: any NotFound wins, else
/// a generic replicate failure carrying the counts.
fn collapse_errors(quorum: usize, successes: usize, errors: &[ReplicaResponse]) -> ObjectError {
    if errors.iter().any(|e| matches!(e, ReplicaResponse::NotFound)) {
        ObjectError::NotFound
    } else {
        ObjectError::ReplicateFailure(format!(
            "{} of {} acks, {} error(s)",
            successes,
            quorum,
            errors.len()
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
