//! Cluster member identity and state.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::net::SocketAddr;

/// Number of bytes in a node identifier (SHA-1 width).
pub const ID_BYTES: usize = 20;

/// A 160-bit node identity, derived from the node's advertised address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    /// Create a `NodeId` from raw bytes.
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Derive a `NodeId` by SHA-1 hashing arbitrary data (normally the
    /// node's listen address string).
    pub fn from_sha1(data: &[u8]) -> Self {
        let hash = Sha1::digest(data);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 4 bytes as hex for readability.
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

/// Membership state of a node as seen by the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Running,
    Suspended,
    Stopped,
}

/// A cluster member: identity, address, state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMember {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub state: NodeState,
}

impl NodeMember {
    /// A running member whose identity is derived from its address.
    pub fn running(addr: SocketAddr) -> Self {
        Self {
            id: NodeId::from_sha1(addr.to_string().as_bytes()),
            addr,
            state: NodeState::Running,
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == NodeState::Running
    }
}
