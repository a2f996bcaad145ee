//! quorus-ring: the redundancy resolver.
//!
//! Maps keys and vnode addresses to an ordered list of responsible nodes
//! plus the N/W/R/D replication parameters. Redundancy sets are read-only
//! snapshots valid for the duration of one request; ordering is
//! deterministic from the ring.

pub mod member;
pub mod resolver;

pub use member::{NodeId, NodeMember, NodeState};
pub use resolver::{
    LookupOp, RedundancyResolver, RedundancySet, RedundantNode, ReplicationParams, RingResolver,
};

/// Errors from redundancy lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// The ring holds no members; fatal for the request.
    #[error("no redundancy set available")]
    NoRedundancy,
}

impl From<RingError> for quorus_common::ObjectError {
    fn from(_: RingError) -> Self {
        quorus_common::ObjectError::NoRedundancy
    }
}
