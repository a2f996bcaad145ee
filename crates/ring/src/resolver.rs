//! Redundancy lookup over a consistent-hash vnode ring.
//!
//! Every member owns a fixed number of positions on a 64-bit ring. A key
//! maps to a vnode id (key hash modulo ring size), the vnode id maps to a
//! ring position, and the redundancy set is the first N distinct members
//! at or after that position, walking clockwise.

use crate::member::{NodeId, NodeMember, NodeState};
use crate::RingError;
use quorus_common::ring_position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::RwLock;

/// Positions each member owns on the ring.
const POSITIONS_PER_NODE: u32 = 64;

/// The operation a lookup serves. Ordering is identical for both today;
/// the parameter exists so a read-preference policy can reorder later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOp {
    Get,
    Put,
}

/// N/W/R/D snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationParams {
    pub n: usize,
    pub w: usize,
    pub r: usize,
    pub d: usize,
}

/// One entry of a redundancy set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedundantNode {
    pub node: NodeId,
    pub addr: SocketAddr,
    pub available: bool,
}

/// An ordered, read-only snapshot of the nodes responsible for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedundancySet {
    pub ring_hash: u64,
    pub n: usize,
    pub w: usize,
    pub r: usize,
    pub d: usize,
    pub nodes: Vec<RedundantNode>,
}

impl RedundancySet {
    /// The available sublist, in ring order.
    pub fn available(&self) -> Vec<RedundantNode> {
        self.nodes.iter().filter(|n| n.available).cloned().collect()
    }

    /// Replica count actually resolved (may be below N in a small cluster).
    pub fn num_of_replicas(&self) -> usize {
        self.nodes.len()
    }
}

/// The resolver contract the engine depends on. Injected as a handle so
/// tests can substitute fakes.
pub trait RedundancyResolver: Send + Sync + 'static {
    fn lookup_by_key(&self, op: LookupOp, key: &str) -> Result<RedundancySet, RingError>;
    fn lookup_by_addr(&self, op: LookupOp, addr_id: u32) -> Result<RedundancySet, RingError>;
    fn running_members(&self) -> Vec<NodeMember>;
    fn has_charge_of_node(&self, key: &str, node: &NodeId) -> bool;
    fn vnode_id(&self, key: &str) -> u32;
    /// `None` when the ring has no configured replication factor.
    fn replication_params(&self) -> Option<ReplicationParams>;
    fn local_node(&self) -> NodeId;
}

// ---------------------------------------------------------------------------
// RingResolver
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RingState {
    members: BTreeMap<NodeId, NodeMember>,
    positions: BTreeMap<u64, NodeId>,
}

/// The production resolver: membership + vnode ring behind a read lock.
#[derive(Debug)]
pub struct RingResolver {
    local: NodeId,
    params: ReplicationParams,
    vnode_total: u32,
    state: RwLock<RingState>,
}

impl RingResolver {
    pub fn new(local: NodeId, params: ReplicationParams, vnode_total: u32) -> Self {
        Self {
            local,
            params,
            vnode_total: vnode_total.max(1),
            state: RwLock::new(RingState::default()),
        }
    }

    /// Add (or replace) a member and claim its ring positions.
    pub fn add_member(&self, member: NodeMember) {
        let mut state = self.state.write().expect("ring lock poisoned");
        for i in 0..POSITIONS_PER_NODE {
            let seed = format!("{}#{}", member.addr, i);
            state.positions.insert(ring_position(seed.as_bytes()), member.id);
        }
        state.members.insert(member.id, member);
    }

    /// Transition a member's state; unknown ids are ignored.
    pub fn set_state(&self, id: &NodeId, node_state: NodeState) {
        let mut state = self.state.write().expect("ring lock poisoned");
        if let Some(m) = state.members.get_mut(id) {
            m.state = node_state;
        }
    }

    fn lookup_at(&self, position: u64) -> Result<RedundancySet, RingError> {
        let state = self.state.read().expect("ring lock poisoned");
        if state.positions.is_empty() {
            return Err(RingError::NoRedundancy);
        }

        let mut nodes: Vec<RedundantNode> = Vec::with_capacity(self.params.n);
        let mut seen = std::collections::HashSet::new();

        // Clockwise walk from `position`, wrapping once.
        let walk = state
            .positions
            .range(position..)
            .chain(state.positions.range(..position));
        for (_, id) in walk {
            if !seen.insert(*id) {
                continue;
            }
            let member = &state.members[id];
            nodes.push(RedundantNode {
                node: *id,
                addr: member.addr,
                available: member.is_available(),
            });
            if nodes.len() == self.params.n {
                break;
            }
        }

        Ok(RedundancySet {
            ring_hash: position,
            n: self.params.n,
            w: self.params.w,
            r: self.params.r,
            d: self.params.d,
            nodes,
        })
    }
}

impl RedundancyResolver for RingResolver {
    fn lookup_by_key(&self, op: LookupOp, key: &str) -> Result<RedundancySet, RingError> {
        // Key lookups route through the vnode so that
        // lookup_by_key(k) == lookup_by_addr(vnode_id(k)).
        self.lookup_by_addr(op, self.vnode_id(key))
    }

    fn lookup_by_addr(&self, _op: LookupOp, addr_id: u32) -> Result<RedundancySet, RingError> {
        self.lookup_at(ring_position(&addr_id.to_be_bytes()))
    }

    fn running_members(&self) -> Vec<NodeMember> {
        let state = self.state.read().expect("ring lock poisoned");
        state
            .members
            .values()
            .filter(|m| m.state == NodeState::Running)
            .cloned()
            .collect()
    }

    fn has_charge_of_node(&self, key: &str, node: &NodeId) -> bool {
        match self.lookup_by_key(LookupOp::Put, key) {
            Ok(set) => set.nodes.iter().any(|n| n.node == *node),
            Err(_) => false,
        }
    }

    fn vnode_id(&self, key: &str) -> u32 {
        (ring_position(key.as_bytes()) % u64::from(self.vnode_total)) as u32
    }

    fn replication_params(&self) -> Option<ReplicationParams> {
        Some(self.params)
    }

    fn local_node(&self) -> NodeId {
        self.local
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn member(port: u16) -> NodeMember {
        NodeMember::running(format!("127.0.0.1:{}", port).parse().unwrap())
    }

    fn resolver_with(n_members: u16) -> RingResolver {
        let local = member(7100);
        let resolver = RingResolver::new(
            local.id,
            ReplicationParams { n: 3, w: 2, r: 1, d: 2 },
            128,
        );
        for p in 0..n_members {
            resolver.add_member(member(7100 + p));
        }
        resolver
    }

    #[test]
    fn test_empty_ring_yields_no_redundancy() {
        let resolver = resolver_with(0);
        assert_eq!(
            resolver.lookup_by_key(LookupOp::Get, "k").unwrap_err(),
            RingError::NoRedundancy
        );
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let resolver = resolver_with(5);
        let a = resolver.lookup_by_key(LookupOp::Put, "some/key").unwrap();
        let b = resolver.lookup_by_key(LookupOp::Put, "some/key").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_lookup_by_key_matches_vnode_lookup() {
        let resolver = resolver_with(5);
        let by_key = resolver.lookup_by_key(LookupOp::Get, "a/b/c").unwrap();
        let by_addr = resolver
            .lookup_by_addr(LookupOp::Get, resolver.vnode_id("a/b/c"))
            .unwrap();
        assert_eq!(by_key, by_addr);
    }

    #[test]
    fn test_set_has_n_distinct_nodes() {
        let resolver = resolver_with(5);
        let set = resolver.lookup_by_key(LookupOp::Put, "k1").unwrap();
        assert_eq!(set.nodes.len(), 3);
        let distinct: std::collections::HashSet<NodeId> =
            set.nodes.iter().map(|n| n.node).collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn test_small_cluster_yields_short_set() {
        let resolver = resolver_with(2);
        let set = resolver.lookup_by_key(LookupOp::Put, "k1").unwrap();
        assert_eq!(set.nodes.len(), 2, "only 2 members exist");
        assert_eq!(set.n, 3, "configured N is reported unchanged");
    }

    #[test]
    fn test_availability_tracks_member_state() {
        let resolver = resolver_with(3);
        let set = resolver.lookup_by_key(LookupOp::Get, "k1").unwrap();
        assert!(set.nodes.iter().all(|n| n.available));

        let suspended = set.nodes[1].node;
        resolver.set_state(&suspended, NodeState::Suspended);

        let set = resolver.lookup_by_key(LookupOp::Get, "k1").unwrap();
        assert!(!set.nodes[1].available);
        assert_eq!(set.available().len(), 2);
    }

    #[test]
    fn test_running_members_excludes_stopped() {
        let resolver = resolver_with(4);
        assert_eq!(resolver.running_members().len(), 4);
        let id = resolver.running_members()[0].id;
        resolver.set_state(&id, NodeState::Stopped);
        assert_eq!(resolver.running_members().len(), 3);
    }

    #[test]
    fn test_has_charge_of_node() {
        let resolver = resolver_with(5);
        let set = resolver.lookup_by_key(LookupOp::Put, "owned/key").unwrap();
        for n in &set.nodes {
            assert!(resolver.has_charge_of_node("owned/key", &n.node));
        }
        // A member outside the set has no charge.
        let outside = resolver
            .running_members()
            .into_iter()
            .find(|m| !set.nodes.iter().any(|n| n.node == m.id));
        if let Some(m) = outside {
            assert!(!resolver.has_charge_of_node("owned/key", &m.id));
        }
    }

    #[test]
    fn test_vnode_id_within_ring_size() {
        let resolver = resolver_with(3);
        for i in 0..1000 {
            let v = resolver.vnode_id(&format!("key-{}", i));
            assert!(v < 128);
        }
    }

    #[test]
    fn test_keys_spread_across_nodes() {
        let resolver = resolver_with(5);
        let mut primaries = std::collections::HashSet::new();
        for i in 0..200 {
            let set = resolver
                .lookup_by_key(LookupOp::Put, &format!("spread-{}", i))
                .unwrap();
            primaries.insert(set.nodes[0].node);
        }
        assert!(
            primaries.len() >= 3,
            "expected several distinct primaries, got {}",
            primaries.len()
        );
    }
}
