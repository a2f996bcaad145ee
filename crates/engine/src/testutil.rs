//! Shared fakes for engine tests: a scripted peer client and a canned
//! cluster builder around the real ring resolver and in-memory store.

use crate::handler::ObjectHandler;
use crate::notify::QueueNotifier;
use crate::peer::{PeerClient, PeerError};
use crate::watchdog::WatchdogRegistry;
use quorus_common::{Metadata, Object, ReadParams, Reference};
use quorus_mq::{LocalQueue, MessageQueue};
use quorus_ring::{NodeMember, NodeState, RedundancyResolver, ReplicationParams, RingResolver};
use quorus_store::{CompactionStats, MemStore};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// How a mock peer answers mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerBehavior {
    Ok,
    /// Never answers; the caller's deadline decides.
    Hang,
    NotFound,
    Unavailable,
}

#[derive(Debug, Default)]
struct MockState {
    behaviors: HashMap<SocketAddr, PeerBehavior>,
    log: Vec<(&'static str, SocketAddr, String)>,
    fail_delete_keys: Vec<String>,
    fail_dir_delete: HashSet<SocketAddr>,
    remote_objects: HashMap<(SocketAddr, String), (Metadata, Vec<u8>)>,
    compact: HashMap<SocketAddr, CompactionStats>,
}

/// A scripted peer transport recording every call.
#[derive(Debug, Default)]
pub(crate) struct MockPeerClient {
    state: Mutex<MockState>,
}

impl MockPeerClient {
    pub fn set_behavior(&self, addr: SocketAddr, behavior: PeerBehavior) {
        self.lock().behaviors.insert(addr, behavior);
    }

    pub fn fail_deletes_matching(&self, key: &str) {
        self.lock().fail_delete_keys.push(key.to_string());
    }

    pub fn fail_dir_delete_on(&self, addr: SocketAddr) {
        self.lock().fail_dir_delete.insert(addr);
    }

    /// Seed a replica object served by `get`/`head` on one peer.
    pub fn set_remote_object(&self, addr: SocketAddr, key: &str, meta: Metadata, data: Vec<u8>) {
        self.lock()
            .remote_objects
            .insert((addr, key.to_string()), (meta, data));
    }

    pub fn set_compact_status(&self, addr: SocketAddr, stats: CompactionStats) {
        self.lock().compact.insert(addr, stats);
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    pub fn put_count(&self) -> usize {
        self.lock().log.iter().filter(|(op, _, _)| *op == "put").count()
    }

    /// Keys of delete calls, in call order.
    pub fn deleted_keys(&self) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter(|(op, _, _)| *op == "delete")
            .map(|(_, _, key)| key.clone())
            .collect()
    }

    /// Keys written via `put`, in call order.
    pub fn put_keys(&self) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter(|(op, _, _)| *op == "put")
            .map(|(_, _, key)| key.clone())
            .collect()
    }

    /// Targets of `delete_objects_under_dir` calls, in call order.
    pub fn dir_delete_targets(&self) -> Vec<SocketAddr> {
        self.lock()
            .log
            .iter()
            .filter(|(op, _, _)| *op == "delete_objects_under_dir")
            .map(|(_, addr, _)| *addr)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock lock poisoned")
    }

    fn behavior(&self, addr: SocketAddr) -> PeerBehavior {
        *self.lock().behaviors.get(&addr).unwrap_or(&PeerBehavior::Ok)
    }

    async fn apply_behavior(&self, addr: SocketAddr) -> Result<(), PeerError> {
        match self.behavior(addr) {
            PeerBehavior::Ok => Ok(()),
            PeerBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            PeerBehavior::NotFound => Err(PeerError::NotFound),
            PeerBehavior::Unavailable => Err(PeerError::Unavailable),
        }
    }
}

#[async_trait::async_trait]
impl PeerClient for MockPeerClient {
    async fn get(
        &self,
        target: SocketAddr,
        _reference: Reference,
        params: &ReadParams,
    ) -> Result<(Metadata, Vec<u8>), PeerError> {
        self.lock().log.push(("get", target, params.key.clone()));
        self.apply_behavior(target).await?;
        self.lock()
            .remote_objects
            .get(&(target, params.key.clone()))
            .cloned()
            .ok_or(PeerError::NotFound)
    }

    async fn put(
        &self,
        target: SocketAddr,
        _reference: Reference,
        object: &Object,
    ) -> Result<u64, PeerError> {
        self.lock().log.push(("put", target, object.key.clone()));
        self.apply_behavior(target).await?;
        Ok(object.checksum)
    }

    async fn delete(
        &self,
        target: SocketAddr,
        _reference: Reference,
        object: &Object,
    ) -> Result<(), PeerError> {
        self.lock().log.push(("delete", target, object.key.clone()));
        let fail = self
            .lock()
            .fail_delete_keys
            .iter()
            .any(|k| object.key.contains(k.as_str()));
        if fail {
            return Err(PeerError::Rpc("scripted delete failure".into()));
        }
        self.apply_behavior(target).await?;
        Ok(())
    }

    async fn head(
        &self,
        target: SocketAddr,
        _addr_id: u32,
        key: &str,
    ) -> Result<Vec<u8>, PeerError> {
        self.lock().log.push(("head", target, key.to_string()));
        self.apply_behavior(target).await?;
        self.lock()
            .remote_objects
            .get(&(target, key.to_string()))
            .map(|(meta, _)| meta.encode())
            .ok_or(PeerError::NotFound)
    }

    async fn compact_status(&self, target: SocketAddr) -> Result<CompactionStats, PeerError> {
        self.lock().log.push(("compact_status", target, String::new()));
        self.apply_behavior(target).await?;
        Ok(self
            .lock()
            .compact
            .get(&target)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_objects_under_dir(
        &self,
        target: SocketAddr,
        reference: Reference,
        prefixes: &[Option<String>],
    ) -> Result<Reference, PeerError> {
        let first = prefixes
            .iter()
            .flatten()
            .next()
            .cloned()
            .unwrap_or_default();
        self.lock()
            .log
            .push(("delete_objects_under_dir", target, first));
        if self.lock().fail_dir_delete.contains(&target) {
            return Err(PeerError::Unavailable);
        }
        self.apply_behavior(target).await?;
        Ok(reference)
    }
}

// ---------------------------------------------------------------------------
// Cluster builders
// ---------------------------------------------------------------------------

pub(crate) struct TestEnv {
    pub store: Arc<MemStore>,
    pub peers: Arc<MockPeerClient>,
    pub queue: Arc<LocalQueue>,
    pub registry: Arc<WatchdogRegistry>,
    pub resolver: Arc<RingResolver>,
    pub remote_members: Vec<NodeMember>,
}

impl TestEnv {
    /// Mark every remote member suspended so only the local node remains
    /// available.
    pub fn suspend_peers(&self) {
        for m in &self.remote_members {
            self.resolver.set_state(&m.id, NodeState::Suspended);
        }
    }
}

pub(crate) fn local_member() -> NodeMember {
    NodeMember::running("127.0.0.1:7100".parse().unwrap())
}

fn build(
    member_count: usize,
    behaviors: &[PeerBehavior],
) -> (ObjectHandler<MemStore, MockPeerClient>, TestEnv) {
    let local = local_member();
    let resolver = Arc::new(RingResolver::new(
        local.id,
        ReplicationParams { n: 3, w: 2, r: 1, d: 2 },
        128,
    ));
    resolver.add_member(local);

    let peers = Arc::new(MockPeerClient::default());
    let mut remote_members = Vec::new();
    for i in 1..member_count {
        let member = NodeMember::running(format!("127.0.0.1:{}", 7100 + i).parse().unwrap());
        if let Some(b) = behaviors.get(i - 1) {
            peers.set_behavior(member.addr, *b);
        }
        resolver.add_member(member.clone());
        remote_members.push(member);
    }

    let store = Arc::new(MemStore::new(8));
    let queue = Arc::new(LocalQueue::default());
    let registry = Arc::new(WatchdogRegistry::default());
    let notifier = Arc::new(QueueNotifier::new(queue.clone() as Arc<dyn MessageQueue>));

    let handler = ObjectHandler::new(
        resolver.clone() as Arc<dyn RedundancyResolver>,
        store.clone(),
        peers.clone(),
        queue.clone() as Arc<dyn MessageQueue>,
        notifier,
        registry.clone(),
        Duration::from_secs(5),
    );

    let env = TestEnv {
        store,
        peers,
        queue,
        registry,
        resolver,
        remote_members,
    };
    (handler, env)
}

/// A cluster of `member_count` nodes where every remote answers `Ok`.
pub(crate) fn handler_with(
    member_count: usize,
) -> (ObjectHandler<MemStore, MockPeerClient>, TestEnv) {
    build(member_count, &[])
}

/// Local node plus two scripted remotes (N=3, W=2, R=1, D=2).
pub(crate) fn two_peer_cluster(
    first: PeerBehavior,
    second: PeerBehavior,
) -> (ObjectHandler<MemStore, MockPeerClient>, TestEnv) {
    build(3, &[first, second])
}
