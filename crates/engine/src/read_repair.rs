//! The read-and-repair state machine.
//!
//! A GET walks the active redundancy set in ring order, trying each node
//! as the primary read. A successful read answers the client immediately;
//! when other replicas remain, a detached repair pass compares their
//! metadata and converges every replica to the maximum-clock version.
//! Repair failures are logged, never surfaced.

use crate::handler::{peer_error, store_error, GetReply, ObjectHandler};
use crate::peer::PeerClient;
use crate::replicate;
use quorus_common::{Metadata, Object, ObjectError, ReadParams, StorageMethod};
use quorus_ring::{NodeId, RedundancySet, RedundantNode};
use quorus_store::{ObjectStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one primary-read attempt.
enum Attempt {
    Match,
    Found {
        metadata: Metadata,
        data: Vec<u8>,
        repair: bool,
    },
}

impl<S: ObjectStore, P: PeerClient> ObjectHandler<S, P> {
    /// Read with background repair. Tries each active replica in order
    /// until one succeeds; errors accumulate and the most recent one is
    /// returned when every candidate fails.
    pub(crate) async fn read_and_repair(
        &self,
        params: &ReadParams,
        set: &RedundancySet,
    ) -> Result<GetReply, ObjectError> {
        let active = replicate::active_redundancies(params.quorum, set)?;

        let mut last_err = ObjectError::NotFound;
        for (idx, replica) in active.iter().enumerate() {
            match self.read_attempt(params, replica).await {
                Ok(Attempt::Match) => return Ok(GetReply::Match),
                Ok(Attempt::Found {
                    metadata,
                    data,
                    repair,
                }) => {
                    let remaining: Vec<RedundantNode> = active
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != idx)
                        .map(|(_, r)| r.clone())
                        .collect();
                    if repair && !remaining.is_empty() {
                        self.spawn_repair(
                            params,
                            replica.clone(),
                            metadata.clone(),
                            data.clone(),
                            remaining,
                        );
                    }
                    return Ok(GetReply::Object { metadata, data });
                }
                Err(e) => {
                    tracing::debug!(
                        "read of '{}' via {} failed: {}",
                        params.key,
                        replica.addr,
                        e
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// One primary-read attempt against a single replica.
    async fn read_attempt(
        &self,
        params: &ReadParams,
        replica: &RedundantNode,
    ) -> Result<Attempt, ObjectError> {
        if replica.node == self.local {
            if params.etag != 0 {
                // If-match short-circuit: a HEAD suffices when the stored
                // checksum equals the request ETag.
                let bytes = self.store.head(params.addr_id, &params.key).map_err(store_error)?;
                let meta = Metadata::decode(&bytes)?;
                if meta.checksum == params.etag {
                    return Ok(Attempt::Match);
                }
                let (metadata, data) = self.local_get(params)?;
                return Ok(Attempt::Found {
                    metadata,
                    data,
                    // A lone replica has nobody to converge with.
                    repair: params.num_of_replicas != 1,
                });
            }
            let (metadata, data) = self.local_get(params)?;
            Ok(Attempt::Found {
                metadata,
                data,
                repair: true,
            })
        } else {
            match tokio::time::timeout(
                self.request_timeout,
                self.peers.get(replica.addr, params.reference, params),
            )
            .await
            {
                Ok(Ok((metadata, data))) => Ok(Attempt::Found {
                    metadata,
                    data,
                    repair: true,
                }),
                Ok(Err(e)) => Err(peer_error(e)),
                Err(_) => Err(ObjectError::Timeout),
            }
        }
    }

    /// Detached repair pass; the reply never waits on it.
    fn spawn_repair(
        &self,
        params: &ReadParams,
        source: RedundantNode,
        auth_meta: Metadata,
        auth_data: Vec<u8>,
        remaining: Vec<RedundantNode>,
    ) {
        let store = self.store.clone();
        let peers = self.peers.clone();
        let local = self.local;
        let timeout = self.request_timeout;
        let params = params.clone();

        tokio::spawn(async move {
            quorus_metrics::metrics().read_repairs.inc();
            let key = params.key.clone();
            if let Err(e) = repair_replicas(
                store, peers, local, timeout, params, source, auth_meta, auth_data, remaining,
            )
            .await
            {
                quorus_metrics::metrics().repair_failures.inc();
                tracing::warn!("read repair of '{}' did not converge: {}", key, e);
            } else {
                tracing::debug!("read repair of '{}' converged", key);
            }
        });
    }
}

// ---------------------------------------------------------------------------
// The repair pass
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn repair_replicas<S: ObjectStore, P: PeerClient>(
    store: Arc<S>,
    peers: Arc<P>,
    local: NodeId,
    timeout: Duration,
    params: ReadParams,
    source: RedundantNode,
    auth_meta: Metadata,
    auth_data: Vec<u8>,
    remaining: Vec<RedundantNode>,
) -> Result<(), ObjectError> {
    // Collect what every other replica believes.
    let mut observed: Vec<(RedundantNode, Option<Metadata>)> = Vec::with_capacity(remaining.len());
    for replica in &remaining {
        let meta = fetch_meta(&store, &peers, local, timeout, &params, replica).await;
        observed.push((replica.clone(), meta));
    }

    // The winner is the maximum-clock version (checksum breaks ties).
    let mut winner_node = source.clone();
    let mut winner_meta = auth_meta.clone();
    for (replica, meta) in &observed {
        if let Some(meta) = meta {
            if (meta.clock, meta.checksum) > (winner_meta.clock, winner_meta.checksum) {
                winner_node = replica.clone();
                winner_meta = meta.clone();
            }
        }
    }

    let winner_data = if winner_meta.del {
        Vec::new()
    } else if winner_node.node == source.node {
        auth_data
    } else {
        fetch_body(&store, &peers, local, timeout, &params, &winner_node).await?
    };

    // Converge everyone else, the primary-read source included.
    let mut targets = observed;
    targets.push((source, Some(auth_meta)));

    let mut failures = 0usize;
    for (replica, meta) in targets {
        if replica.node == winner_node.node {
            continue;
        }
        let stale = match &meta {
            Some(m) => (m.clock, m.checksum) != (winner_meta.clock, winner_meta.checksum),
            None => true,
        };
        if !stale {
            continue;
        }
        if let Err(e) = correct_replica(
            &store,
            &peers,
            local,
            timeout,
            &params,
            &replica,
            &winner_meta,
            &winner_data,
        )
        .await
        {
            failures += 1;
            tracing::debug!("repair of replica {} failed: {}", replica.addr, e);
        }
    }

    if failures > 0 {
        Err(ObjectError::RecoverFailure(format!(
            "{} replica(s) not converged",
            failures
        )))
    } else {
        Ok(())
    }
}

/// What one replica currently stores, `None` when the key is absent
/// or the replica cannot answer.
async fn fetch_meta<S: ObjectStore, P: PeerClient>(
    store: &Arc<S>,
    peers: &Arc<P>,
    local: NodeId,
    timeout: Duration,
    params: &ReadParams,
    replica: &RedundantNode,
) -> Option<Metadata> {
    let bytes = if replica.node == local {
        match store.head(params.addr_id, &params.key) {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound) => return None,
            Err(e) => {
                tracing::debug!("repair head on local store failed: {}", e);
                return None;
            }
        }
    } else {
        match tokio::time::timeout(timeout, peers.head(replica.addr, params.addr_id, &params.key))
            .await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                tracing::debug!("repair head on {} failed: {}", replica.addr, e);
                return None;
            }
            Err(_) => return None,
        }
    };
    Metadata::decode(&bytes).ok()
}

/// Fetch the winning version's body from the replica that holds it.
async fn fetch_body<S: ObjectStore, P: PeerClient>(
    store: &Arc<S>,
    peers: &Arc<P>,
    local: NodeId,
    timeout: Duration,
    params: &ReadParams,
    winner: &RedundantNode,
) -> Result<Vec<u8>, ObjectError> {
    if winner.node == local {
        let (_, object) = store
            .get(params.addr_id, &params.key, 0, 0, false)
            .map_err(store_error)?;
        return Ok(object.data);
    }
    let whole = ReadParams::whole(params.addr_id, params.key.clone(), params.req_id);
    match tokio::time::timeout(timeout, peers.get(winner.addr, whole.reference, &whole)).await {
        Ok(Ok((_, data))) => Ok(data),
        Ok(Err(e)) => Err(peer_error(e)),
        Err(_) => Err(ObjectError::Timeout),
    }
}

/// Overwrite one stale replica with the winning version.
#[allow(clippy::too_many_arguments)]
async fn correct_replica<S: ObjectStore, P: PeerClient>(
    store: &Arc<S>,
    peers: &Arc<P>,
    local: NodeId,
    timeout: Duration,
    params: &ReadParams,
    replica: &RedundantNode,
    winner_meta: &Metadata,
    winner_data: &[u8],
) -> Result<(), ObjectError> {
    if winner_meta.del {
        let mut tomb = Object::tombstone(params.addr_id, params.key.clone());
        tomb.clock = winner_meta.clock;
        tomb.timestamp = winner_meta.timestamp;
        if replica.node == local {
            return store
                .delete(params.addr_id, &params.key, tomb)
                .map_err(store_error);
        }
        return match tokio::time::timeout(
            timeout,
            peers.delete(replica.addr, params.reference, &tomb),
        )
        .await
        {
            Ok(result) => result.map_err(peer_error),
            Err(_) => Err(ObjectError::Timeout),
        };
    }

    let object = Object {
        addr_id: winner_meta.addr_id,
        key: winner_meta.key.clone(),
        data: winner_data.to_vec(),
        dsize: winner_data.len() as u64,
        cindex: winner_meta.cindex,
        cnumber: winner_meta.cnumber,
        parent_key: winner_meta.parent_key.clone(),
        clock: winner_meta.clock,
        timestamp: winner_meta.timestamp,
        checksum: winner_meta.checksum,
        method: StorageMethod::Put,
        del: false,
        req_id: 0,
        ring_hash: winner_meta.ring_hash,
        num_of_replicas: winner_meta.num_of_replicas,
    };

    if replica.node == local {
        store
            .put(params.addr_id, &params.key, object)
            .map(|_| ())
            .map_err(store_error)
    } else {
        match tokio::time::timeout(timeout, peers.put(replica.addr, params.reference, &object))
            .await
        {
            Ok(result) => result.map(|_| ()).map_err(peer_error),
            Err(_) => Err(ObjectError::Timeout),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::GetReply;
    use crate::testutil::{two_peer_cluster, PeerBehavior};
    use quorus_common::content_etag;
    use quorus_ring::{LookupOp, RedundancyResolver};

    /// Find a key whose primary replica is the local node, so the primary
    /// read deterministically hits the local store.
    fn key_with_local_primary(
        resolver: &dyn RedundancyResolver,
        local: quorus_ring::NodeId,
    ) -> String {
        for i in 0..10_000 {
            let key = format!("repair/key-{}", i);
            let set = resolver.lookup_by_key(LookupOp::Get, &key).unwrap();
            if set.nodes[0].node == local {
                return key;
            }
        }
        panic!("no key with local primary found");
    }

    fn stale_local_fresh_remotes() -> (
        crate::handler::ObjectHandler<quorus_store::MemStore, crate::testutil::MockPeerClient>,
        crate::testutil::TestEnv,
        String,
        Vec<u8>,
    ) {
        let (handler, env) = two_peer_cluster(PeerBehavior::Ok, PeerBehavior::Ok);
        let key = key_with_local_primary(env.resolver.as_ref(), handler.local);
        let addr = env.resolver.vnode_id(&key);

        // Local replica: stale version at clock 10.
        let mut stale = Object::new_put(addr, &key, b"old".to_vec());
        stale.clock = 10;
        stale.timestamp = 10;
        env.store.put(addr, &key, stale).unwrap();

        // Both remotes: fresh version at clock 20.
        let mut fresh = Object::new_put(addr, &key, b"new".to_vec());
        fresh.clock = 20;
        fresh.timestamp = 20;
        let fresh_meta = Metadata::from(&fresh);
        for member in &env.remote_members {
            env.peers
                .set_remote_object(member.addr, &key, fresh_meta.clone(), b"new".to_vec());
        }
        (handler, env, key, b"new".to_vec())
    }

    #[tokio::test]
    async fn test_stale_primary_read_returns_immediately_then_converges() {
        let (handler, env, key, fresh_data) = stale_local_fresh_remotes();
        let addr = env.resolver.vnode_id(&key);

        // The stale primary answers the client without waiting for repair.
        match handler.get(addr, &key, 0, 0, 0, 1).await.unwrap() {
            GetReply::Object { data, .. } => assert_eq!(data, b"old"),
            GetReply::Match => unreachable!(),
        }

        // One reconciliation pass replaces the local copy with the
        // majority version.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let (meta, object) = env.store.get(addr, &key, 0, 0, false).unwrap();
        assert_eq!(object.data, fresh_data);
        assert_eq!(meta.clock, 20);
        assert_eq!(meta.checksum, content_etag(b"new"));
    }

    #[tokio::test]
    async fn test_repair_pushes_fresh_local_version_to_stale_remote() {
        let (handler, env) = two_peer_cluster(PeerBehavior::Ok, PeerBehavior::Ok);
        let key = key_with_local_primary(env.resolver.as_ref(), handler.local);
        let addr = env.resolver.vnode_id(&key);

        // Local replica holds the newest version; remotes have nothing.
        let mut fresh = Object::new_put(addr, &key, b"fresh".to_vec());
        fresh.clock = 30;
        env.store.put(addr, &key, fresh).unwrap();

        match handler.get(addr, &key, 0, 0, 0, 1).await.unwrap() {
            GetReply::Object { data, .. } => assert_eq!(data, b"fresh"),
            GetReply::Match => unreachable!(),
        }

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let pushed = env.peers.put_keys();
        assert_eq!(
            pushed.iter().filter(|k| *k == &key).count(),
            2,
            "both stale remotes receive the corrective put, got {:?}",
            pushed
        );
    }

    #[tokio::test]
    async fn test_read_falls_through_to_next_replica_on_local_failure() {
        let (handler, env) = two_peer_cluster(PeerBehavior::Ok, PeerBehavior::Ok);
        let key = key_with_local_primary(env.resolver.as_ref(), handler.local);
        let addr = env.resolver.vnode_id(&key);

        // Local store cannot serve the read.
        env.store.lock_container(env.store.container_of(addr));

        // A remote replica holds the object.
        let mut remote = Object::new_put(addr, &key, b"remote-copy".to_vec());
        remote.clock = 5;
        let meta = Metadata::from(&remote);
        for member in &env.remote_members {
            env.peers
                .set_remote_object(member.addr, &key, meta.clone(), b"remote-copy".to_vec());
        }

        match handler.get(addr, &key, 0, 0, 0, 1).await.unwrap() {
            GetReply::Object { data, .. } => assert_eq!(data, b"remote-copy"),
            GetReply::Match => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_all_replicas_failing_returns_last_error() {
        let (handler, env) =
            two_peer_cluster(PeerBehavior::Unavailable, PeerBehavior::Unavailable);
        let key = key_with_local_primary(env.resolver.as_ref(), handler.local);
        let addr = env.resolver.vnode_id(&key);

        // Nothing anywhere: local NotFound, remotes Unavailable.
        let err = handler.get(addr, &key, 0, 0, 0, 1).await.unwrap_err();
        assert_eq!(err, ObjectError::Unavailable, "most recent error wins");
    }

    #[tokio::test]
    async fn test_repair_propagates_tombstone() {
        let (handler, env) = two_peer_cluster(PeerBehavior::Ok, PeerBehavior::Ok);
        let key = key_with_local_primary(env.resolver.as_ref(), handler.local);
        let addr = env.resolver.vnode_id(&key);

        // Local replica: live object. Remote replicas: newer tombstone.
        let mut live = Object::new_put(addr, &key, b"zombie".to_vec());
        live.clock = 10;
        env.store.put(addr, &key, live).unwrap();

        let mut tomb = Object::tombstone(addr, &key);
        tomb.clock = 20;
        tomb.timestamp = 20;
        let tomb_meta = Metadata::from(&tomb);
        for member in &env.remote_members {
            env.peers
                .set_remote_object(member.addr, &key, tomb_meta.clone(), Vec::new());
        }

        // The stale read still answers; the repair pass tombstones local.
        let _ = handler.get(addr, &key, 0, 0, 0, 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(
            env.store.get(addr, &key, 0, 0, false).unwrap_err(),
            quorus_store::StoreError::NotFound,
            "local zombie must be tombstoned by repair"
        );
    }
}
