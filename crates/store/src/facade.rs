//! The object-store contract.

use quorus_common::{Metadata, Object};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Errors surfaced by the local store.
///
/// `LockedContainer` MUST be translated to `Unavailable` at the handler
/// boundary; it never crosses the node's RPC surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("container {0} is locked")]
    LockedContainer(u32),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("store error: {0}")]
    Internal(String),
}

/// Compactor state as observed by the adaptive controller and peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionStatus {
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionStats {
    pub status: CompactionStatus,
    pub pending_targets: Vec<u32>,
    /// Wall-clock seconds of the last completed run (0 = never).
    pub latest_exec_time: u64,
}

impl Default for CompactionStats {
    fn default() -> Self {
        Self {
            status: CompactionStatus::Idle,
            pending_targets: Vec::new(),
            latest_exec_time: 0,
        }
    }
}

/// A running content digest threaded through chunked HEAD walks.
#[derive(Clone)]
pub struct DigestContext(Sha1);

impl DigestContext {
    pub fn new() -> Self {
        Self(Sha1::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize to the 64-bit ETag form.
    pub fn digest64(self) -> u64 {
        let digest = self.0.finalize();
        u64::from_be_bytes(digest[..8].try_into().expect("sha1 digest >= 8 bytes"))
    }
}

impl Default for DigestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DigestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestContext").finish_non_exhaustive()
    }
}

/// The local store facade.
///
/// Implementations use interior mutability; the engine shares one instance
/// across all in-flight handler tasks. Ranges are inclusive and `(0, 0)`
/// means "whole object".
pub trait ObjectStore: Send + Sync + 'static {
    /// Read an object. With `forced_integrity_check`, the stored checksum
    /// is verified against the data before returning.
    fn get(
        &self,
        addr_id: u32,
        key: &str,
        start_pos: u64,
        end_pos: u64,
        forced_integrity_check: bool,
    ) -> Result<(Metadata, Object), StoreError>;

    /// Write an object; returns the content ETag.
    fn put(&self, addr_id: u32, key: &str, object: Object) -> Result<u64, StoreError>;

    /// Write a tombstone carrying the object's clock/timestamp.
    fn delete(&self, addr_id: u32, key: &str, object: Object) -> Result<(), StoreError>;

    /// Metadata bytes for a key (tombstones included).
    fn head(&self, addr_id: u32, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Metadata plus the running digest advanced over the stored body.
    fn head_with_digest(
        &self,
        addr_id: u32,
        key: &str,
        ctx: DigestContext,
    ) -> Result<(Metadata, DigestContext), StoreError>;

    /// Scan metadata whose key begins with `prefix`, in key order.
    fn fetch_by_key(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, &[u8]),
    ) -> Result<(), StoreError>;

    /// Compact the given containers, dropping tombstones and entries the
    /// ownership predicate rejects.
    fn compact_data(
        &self,
        targets: &[u32],
        parallelism: usize,
        owned: &(dyn Fn(&str) -> bool + Sync),
    ) -> Result<(), StoreError>;

    /// Current compactor state.
    fn compaction_stats(&self) -> CompactionStats;

    /// Record a container as needing compaction.
    fn mark_compaction_target(&self, container: u32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorus_common::content_etag;

    #[test]
    fn test_digest_context_matches_content_etag() {
        let mut ctx = DigestContext::new();
        ctx.update(b"hello ");
        ctx.update(b"world");
        assert_eq!(ctx.digest64(), content_etag(b"hello world"));
    }

    #[test]
    fn test_compaction_stats_default_idle() {
        let stats = CompactionStats::default();
        assert_eq!(stats.status, CompactionStatus::Idle);
        assert!(stats.pending_targets.is_empty());
        assert_eq!(stats.latest_exec_time, 0);
    }
}
