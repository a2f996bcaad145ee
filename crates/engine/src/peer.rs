//! Abstraction over node-to-node RPCs.
//!
//! A trait in the engine crate with the gRPC implementation in
//! `quorus-net`, so unit tests run against mocks. Every reply echoes the
//! initiator's [`Reference`] so concurrent in-flight operations can be
//! discriminated.

use quorus_common::{Metadata, Object, ReadParams, Reference};
use quorus_store::CompactionStats;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("peer reported not found")]
    NotFound,
    #[error("peer unavailable")]
    Unavailable,
    #[error("peer RPC timed out")]
    Timeout,
    #[error("peer RPC failed: {0}")]
    Rpc(String),
}

/// Transport for peer RPCs. Implementations enforce the per-call deadline.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync + 'static {
    /// Read an object replica from a remote node's local store.
    async fn get(
        &self,
        target: SocketAddr,
        reference: Reference,
        params: &ReadParams,
    ) -> Result<(Metadata, Vec<u8>), PeerError>;

    /// Apply a write on a remote replica; returns the ETag.
    async fn put(
        &self,
        target: SocketAddr,
        reference: Reference,
        object: &Object,
    ) -> Result<u64, PeerError>;

    /// Apply a delete on a remote replica.
    async fn delete(
        &self,
        target: SocketAddr,
        reference: Reference,
        object: &Object,
    ) -> Result<(), PeerError>;

    /// Metadata bytes for a key on a remote node.
    async fn head(&self, target: SocketAddr, addr_id: u32, key: &str) -> Result<Vec<u8>, PeerError>;

    /// Remote compactor state, for cluster-wide compaction coordination.
    async fn compact_status(&self, target: SocketAddr) -> Result<CompactionStats, PeerError>;

    /// Ask a remote node to purge everything under the given prefixes.
    /// `None` slots are placeholders for prefixes resolved on the peer.
    async fn delete_objects_under_dir(
        &self,
        target: SocketAddr,
        reference: Reference,
        prefixes: &[Option<String>],
    ) -> Result<Reference, PeerError>;
}
