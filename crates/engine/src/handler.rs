//! The GET/PUT/DELETE/HEAD handler layer.
//!
//! Holds no cross-request mutable state: every operation snapshots a
//! redundancy set, stamps the admission clock, and delegates to the
//! replicator or the read-repair engine. Collaborator services arrive as
//! injected handles so tests can substitute fakes.

use crate::dir_delete::DirCache;
use crate::notify::{EventNotifier, MutationEvent};
use crate::peer::{PeerClient, PeerError};
use crate::replicate;
use crate::watchdog::WatchdogState;
use quorus_common::{
    LogicalClock, Metadata, Object, ObjectError, ReadParams, Reference, StorageMethod,
};
use quorus_mq::MessageQueue;
use quorus_ring::{LookupOp, NodeId, RedundancyResolver};
use quorus_store::{ObjectStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Reply of a GET.
#[derive(Debug, Clone, PartialEq)]
pub enum GetReply {
    /// The stored checksum matched the request ETag; no body transferred.
    Match,
    Object { metadata: Metadata, data: Vec<u8> },
}

/// The per-node request handler.
pub struct ObjectHandler<S: ObjectStore, P: PeerClient> {
    pub(crate) local: NodeId,
    pub(crate) store: Arc<S>,
    pub(crate) peers: Arc<P>,
    pub(crate) resolver: Arc<dyn RedundancyResolver>,
    pub(crate) queue: Arc<dyn MessageQueue>,
    pub(crate) notifier: Arc<dyn EventNotifier>,
    pub(crate) watchdog: Arc<dyn WatchdogState>,
    pub(crate) dir_cache: DirCache,
    pub(crate) clock: LogicalClock,
    pub(crate) request_timeout: Duration,
}

impl<S: ObjectStore, P: PeerClient> std::fmt::Debug for ObjectHandler<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandler")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl<S: ObjectStore, P: PeerClient> ObjectHandler<S, P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Arc<dyn RedundancyResolver>,
        store: Arc<S>,
        peers: Arc<P>,
        queue: Arc<dyn MessageQueue>,
        notifier: Arc<dyn EventNotifier>,
        watchdog: Arc<dyn WatchdogState>,
        request_timeout: Duration,
    ) -> Self {
        let local = resolver.local_node();
        Self {
            local,
            store,
            peers,
            resolver,
            queue,
            notifier,
            watchdog,
            dir_cache: DirCache::default(),
            clock: LogicalClock::new(),
            request_timeout,
        }
    }

    // -----------------------------------------------------------------------
    // GET
    // -----------------------------------------------------------------------

    /// Read an object, repairing stale replicas in the background.
    /// A non-zero `etag` arms the if-match short-circuit; a `(0, 0)` range
    /// reads the whole object.
    pub async fn get(
        &self,
        addr_id: u32,
        key: &str,
        etag: u64,
        start_pos: u64,
        end_pos: u64,
        req_id: u64,
    ) -> Result<GetReply, ObjectError> {
        quorus_metrics::metrics().object_gets.inc();
        let _timer = quorus_metrics::start_op_timer("get");
        self.guard()?;

        let set = self.resolver.lookup_by_addr(LookupOp::Get, addr_id)?;
        let params = ReadParams {
            reference: Reference::mint(),
            addr_id,
            key: key.to_string(),
            etag,
            start_pos,
            end_pos,
            num_of_replicas: set.num_of_replicas() as u8,
            quorum: set.r,
            req_id,
        };

        let reply = self.read_and_repair(&params, &set).await?;
        if let GetReply::Object { metadata, data } = &reply {
            if metadata.dsize == 0 && data.is_empty() {
                return Err(ObjectError::NotFound);
            }
        }
        Ok(reply)
    }

    // -----------------------------------------------------------------------
    // PUT
    // -----------------------------------------------------------------------

    /// Write an object through the replication quorum. `quorum == 0` means
    /// "use the configured W". A PUT carrying `del == true` is a deletion
    /// and tears down stored chunks first.
    pub async fn put(
        &self,
        mut object: Object,
        req_id: u64,
        quorum: usize,
    ) -> Result<u64, ObjectError> {
        quorus_metrics::metrics().object_puts.inc();
        let _timer = quorus_metrics::start_op_timer("put");
        self.guard()?;

        if object.del {
            self.put_delete(object, req_id, quorum).await?;
            return Ok(0);
        }

        object.method = StorageMethod::Put;
        object.stamp(self.clock.next(), req_id);
        let etag = self
            .replicate_object(StorageMethod::Put, &mut object, quorum)
            .await?;

        self.notifier
            .notify(MutationEvent {
                method: StorageMethod::Put,
                addr_id: object.addr_id,
                key: object.key.clone(),
                etag,
                clock: object.clock,
            })
            .await;
        Ok(etag)
    }

    /// PUT-with-`del`: consult the stored metadata and, for a chunked
    /// parent, delete chunks `cnumber .. 1` before the parent. Any chunk
    /// failure aborts the teardown with the parent still intact.
    async fn put_delete(
        &self,
        object: Object,
        req_id: u64,
        quorum: usize,
    ) -> Result<(), ObjectError> {
        match self.store.head(object.addr_id, &object.key) {
            Ok(bytes) => {
                let meta = Metadata::decode(&bytes)?;
                if meta.cnumber > 0 {
                    for index in (1..=meta.cnumber).rev() {
                        let chunk_key = chunk_key(&object.key, index);
                        let chunk_addr = self.resolver.vnode_id(&chunk_key);
                        let mut chunk = Object::tombstone(chunk_addr, chunk_key);
                        chunk.parent_key = Some(object.key.clone());
                        chunk.cindex = index;
                        self.delete(chunk, req_id, false, 0).await?;
                    }
                }
            }
            // No local copy: nothing chunked to tear down.
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(store_error(e)),
        }
        self.delete(object, req_id, false, quorum).await
    }

    // -----------------------------------------------------------------------
    // DELETE
    // -----------------------------------------------------------------------

    /// Delete an object through the D quorum. With `check_under_dir`, a
    /// key ending in `/` additionally fans the deletion out to everything
    /// stored under that directory.
    pub async fn delete(
        &self,
        object: Object,
        req_id: u64,
        check_under_dir: bool,
        quorum: usize,
    ) -> Result<(), ObjectError> {
        quorus_metrics::metrics().object_deletes.inc();
        let _timer = quorus_metrics::start_op_timer("delete");
        self.guard()?;

        let mut object = object.into_tombstone();
        object.stamp(self.clock.next(), req_id);

        let result = self
            .replicate_object(StorageMethod::Delete, &mut object, quorum)
            .await;

        let deleted_or_absent = matches!(result, Ok(_) | Err(ObjectError::NotFound));
        if deleted_or_absent && check_under_dir && object.key.ends_with('/') {
            self.spawn_dir_delete(&object.key);
        }

        match result {
            Ok(_) => {
                self.notifier
                    .notify(MutationEvent {
                        method: StorageMethod::Delete,
                        addr_id: object.addr_id,
                        key: object.key.clone(),
                        etag: 0,
                        clock: object.clock,
                    })
                    .await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // HEAD
    // -----------------------------------------------------------------------

    /// Metadata for a key. `can_retry == false` restricts the lookup to
    /// the local store (recovery and rebalance use this); otherwise the
    /// redundancy set is walked until the first success.
    pub async fn head(
        &self,
        addr_id: u32,
        key: &str,
        can_retry: bool,
    ) -> Result<Metadata, ObjectError> {
        quorus_metrics::metrics().object_heads.inc();
        let _timer = quorus_metrics::start_op_timer("head");

        if !can_retry {
            let bytes = self.store.head(addr_id, key).map_err(store_error)?;
            return Metadata::decode(&bytes);
        }

        let set = self.resolver.lookup_by_addr(LookupOp::Get, addr_id)?;
        if set.nodes.is_empty() {
            return Err(ObjectError::NotFound);
        }

        let mut last_err = ObjectError::NotFound;
        for replica in &set.nodes {
            let attempt = if replica.node == self.local {
                self.store.head(addr_id, key).map_err(store_error)
            } else {
                match tokio::time::timeout(
                    self.request_timeout,
                    self.peers.head(replica.addr, addr_id, key),
                )
                .await
                {
                    Ok(Ok(bytes)) => Ok(bytes),
                    Ok(Err(e)) => Err(peer_error(e)),
                    Err(_) => Err(ObjectError::Timeout),
                }
            };
            match attempt {
                Ok(bytes) => return Metadata::decode(&bytes),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    // -----------------------------------------------------------------------
    // Inbound replication (peer-initiated)
    // -----------------------------------------------------------------------

    /// Apply a peer's replica write to the local store, echoing its
    /// reference.
    pub fn apply_put(
        &self,
        object: Object,
        reference: Reference,
    ) -> (Reference, Result<u64, ObjectError>) {
        if let Err(e) = self.guard() {
            return (reference, Err(e));
        }
        let result = self
            .store
            .put(object.addr_id, &object.key.clone(), object)
            .map_err(store_error);
        (reference, result)
    }

    /// Apply a peer's replica delete. A `NotFound` with `req_id == 0` is
    /// normalized to `Ok(0)`: it indicates a concurrent rebalance already
    /// removed the key.
    pub fn apply_delete(
        &self,
        object: Object,
        reference: Reference,
    ) -> (Reference, Result<u64, ObjectError>) {
        if let Err(e) = self.guard() {
            return (reference, Err(e));
        }
        let req_id = object.req_id;
        let result = match self
            .store
            .delete(object.addr_id, &object.key.clone(), object)
            .map_err(store_error)
        {
            Ok(()) => Ok(0),
            Err(ObjectError::NotFound) if req_id == 0 => Ok(0),
            Err(e) => Err(e),
        };
        (reference, result)
    }

    /// Serve a peer's replica read from the local store.
    pub fn local_get(&self, params: &ReadParams) -> Result<(Metadata, Vec<u8>), ObjectError> {
        self.guard()?;
        let (meta, object) = self
            .store
            .get(
                params.addr_id,
                &params.key,
                params.start_pos,
                params.end_pos,
                false,
            )
            .map_err(store_error)?;
        Ok((meta, object.data))
    }

    /// Serve a peer's HEAD from the local store (tombstones included).
    pub fn local_head(&self, addr_id: u32, key: &str) -> Result<Vec<u8>, ObjectError> {
        self.store.head(addr_id, key).map_err(store_error)
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    /// Look up redundancies for the object's address, stamp the replica
    /// envelope, filter available nodes and run the fan-out.
    async fn replicate_object(
        &self,
        method: StorageMethod,
        object: &mut Object,
        quorum_override: usize,
    ) -> Result<u64, ObjectError> {
        let set = self.resolver.lookup_by_addr(LookupOp::Put, object.addr_id)?;
        object.num_of_replicas = set.num_of_replicas() as u8;
        object.ring_hash = set.ring_hash;

        let quorum = if quorum_override > 0 {
            quorum_override.min(set.num_of_replicas().max(1))
        } else {
            replicate::write_quorum(method, &set)
        };
        let active = replicate::active_redundancies(quorum, &set)?;

        replicate::replicate(
            &self.store,
            &self.peers,
            self.local,
            method,
            quorum,
            active,
            object,
            self.request_timeout,
        )
        .await
    }

    /// Pre-flight guard: refuse work while any watchdog reports unsafe.
    pub(crate) fn guard(&self) -> Result<(), ObjectError> {
        let unsafe_items = self.watchdog.find_not_safe_items(&[]);
        if unsafe_items.is_empty() {
            Ok(())
        } else {
            tracing::warn!("rejecting request, watchdogs unsafe: {:?}", unsafe_items);
            Err(ObjectError::Unavailable)
        }
    }
}

/// Synthetic key of chunk `index` under `parent`: `parent ‖ LF ‖ index`.
pub fn chunk_key(parent: &str, index: u32) -> String {
    format!("{}\n{}", parent, index)
}

pub(crate) fn store_error(e: StoreError) -> ObjectError {
    match e {
        StoreError::NotFound => ObjectError::NotFound,
        StoreError::LockedContainer(_) => ObjectError::Unavailable,
        StoreError::InvalidData(m) => ObjectError::InvalidData(m),
        StoreError::Internal(m) => {
            tracing::warn!("store error: {}", m);
            ObjectError::Unavailable
        }
    }
}

pub(crate) fn peer_error(e: PeerError) -> ObjectError {
    match e {
        PeerError::NotFound => ObjectError::NotFound,
        PeerError::Unavailable => ObjectError::Unavailable,
        PeerError::Timeout => ObjectError::Timeout,
        PeerError::Rpc(m) => {
            tracing::debug!("peer rpc error: {}", m);
            ObjectError::Unavailable
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
