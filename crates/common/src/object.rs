//! Object and metadata records.
//!
//! An `Object` is owned by exactly one in-flight handler task; replicas
//! receive copies by value over the wire. `Metadata` is the body-less
//! projection that HEAD and read repair exchange, encoded as JSON bytes
//! on the wire so peers on older builds can skip unknown fields.

use serde::{Deserialize, Serialize};

use crate::error::ObjectError;
use crate::Reference;

/// The mutation kind carried by an [`Object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageMethod {
    Put,
    Delete,
}

impl StorageMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Delete => "delete",
        }
    }
}

/// A stored object: body plus the replication envelope.
///
/// Invariants: `del == true` implies `data` is empty and `dsize == 0`;
/// `checksum` is the content ETag of `data` on PUT; `clock` is stamped at
/// request admission and is monotone per node within a process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Partitioning key: vnode id of `key` under the ring.
    pub addr_id: u32,
    pub key: String,
    pub data: Vec<u8>,
    pub dsize: u64,
    /// Chunk index within a multi-part object (0 for whole objects).
    pub cindex: u32,
    /// Chunk count for a multi-part parent (0 for non-chunked objects).
    pub cnumber: u32,
    /// Parent key for chunk objects.
    pub parent_key: Option<String>,
    /// Logical clock stamped at admission.
    pub clock: u64,
    /// Wall clock, milliseconds.
    pub timestamp: u64,
    /// Content ETag of `data`.
    pub checksum: u64,
    pub method: StorageMethod,
    pub del: bool,
    pub req_id: u64,
    pub ring_hash: u64,
    pub num_of_replicas: u8,
}

impl Object {
    /// A fresh PUT object. The checksum and size are derived from the body;
    /// the replication envelope (clock, ring_hash, num_of_replicas) is
    /// stamped later, at admission.
    pub fn new_put(addr_id: u32, key: impl Into<String>, data: Vec<u8>) -> Self {
        let checksum = crate::content_etag(&data);
        let dsize = data.len() as u64;
        Self {
            addr_id,
            key: key.into(),
            data,
            dsize,
            cindex: 0,
            cnumber: 0,
            parent_key: None,
            clock: 0,
            timestamp: 0,
            checksum,
            method: StorageMethod::Put,
            del: false,
            req_id: 0,
            ring_hash: 0,
            num_of_replicas: 0,
        }
    }

    /// A delete tombstone for `key`.
    pub fn tombstone(addr_id: u32, key: impl Into<String>) -> Self {
        Self {
            addr_id,
            key: key.into(),
            data: Vec::new(),
            dsize: 0,
            cindex: 0,
            cnumber: 0,
            parent_key: None,
            clock: 0,
            timestamp: 0,
            checksum: 0,
            method: StorageMethod::Delete,
            del: true,
            req_id: 0,
            ring_hash: 0,
            num_of_replicas: 0,
        }
    }

    /// Stamp the admission envelope onto the object.
    pub fn stamp(&mut self, clock: u64, req_id: u64) {
        self.clock = clock;
        self.timestamp = crate::wall_clock_millis();
        self.req_id = req_id;
    }

    /// Convert into a tombstone in place, per the `del` invariant.
    pub fn into_tombstone(mut self) -> Self {
        self.data = Vec::new();
        self.dsize = 0;
        self.checksum = 0;
        self.del = true;
        self.method = StorageMethod::Delete;
        self
    }
}

/// Body-less projection of an [`Object`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub addr_id: u32,
    pub key: String,
    pub dsize: u64,
    pub cindex: u32,
    /// Chunk count; 0 for non-chunked objects.
    pub cnumber: u32,
    pub parent_key: Option<String>,
    pub clock: u64,
    pub timestamp: u64,
    pub checksum: u64,
    pub del: bool,
    pub ring_hash: u64,
    pub num_of_replicas: u8,
}

impl Metadata {
    /// Wire form: JSON bytes, as returned by `head`.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode the wire form. Failure means the object is corrupt.
    pub fn decode(bytes: &[u8]) -> Result<Self, ObjectError> {
        serde_json::from_slice(bytes).map_err(|e| ObjectError::InvalidData(e.to_string()))
    }
}

impl From<&Object> for Metadata {
    fn from(o: &Object) -> Self {
        Self {
            addr_id: o.addr_id,
            key: o.key.clone(),
            dsize: o.dsize,
            cindex: o.cindex,
            cnumber: o.cnumber,
            parent_key: o.parent_key.clone(),
            clock: o.clock,
            timestamp: o.timestamp,
            checksum: o.checksum,
            del: o.del,
            ring_hash: o.ring_hash,
            num_of_replicas: o.num_of_replicas,
        }
    }
}

/// Parameters of a single read, threaded through the read-repair engine.
#[derive(Debug, Clone)]
pub struct ReadParams {
    pub reference: Reference,
    pub addr_id: u32,
    pub key: String,
    /// If-match ETag; 0 disables the short-circuit.
    pub etag: u64,
    /// Inclusive range; `(0, 0)` means whole object.
    pub start_pos: u64,
    pub end_pos: u64,
    pub num_of_replicas: u8,
    pub quorum: usize,
    pub req_id: u64,
}

impl ReadParams {
    /// Whole-object read with no if-match.
    pub fn whole(addr_id: u32, key: impl Into<String>, req_id: u64) -> Self {
        Self {
            reference: Reference::mint(),
            addr_id,
            key: key.into(),
            etag: 0,
            start_pos: 0,
            end_pos: 0,
            num_of_replicas: 0,
            quorum: 0,
            req_id,
        }
    }

    pub fn is_whole_range(&self) -> bool {
        self.start_pos == 0 && self.end_pos == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_put_derives_checksum_and_size() {
        let o = Object::new_put(7, "bucket/key", b"abcdef".to_vec());
        assert_eq!(o.dsize, 6);
        assert_eq!(o.checksum, crate::content_etag(b"abcdef"));
        assert!(!o.del);
        assert_eq!(o.method, StorageMethod::Put);
    }

    #[test]
    fn test_tombstone_invariant() {
        let t = Object::tombstone(7, "bucket/key");
        assert!(t.del);
        assert!(t.data.is_empty());
        assert_eq!(t.dsize, 0);
        assert_eq!(t.checksum, 0);
        assert_eq!(t.method, StorageMethod::Delete);
    }

    #[test]
    fn test_into_tombstone_clears_body() {
        let o = Object::new_put(1, "k", b"payload".to_vec()).into_tombstone();
        assert!(o.del);
        assert!(o.data.is_empty());
        assert_eq!(o.dsize, 0);
        assert_eq!(o.checksum, 0);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let mut o = Object::new_put(3, "a/b/c", b"xyz".to_vec());
        o.stamp(42, 9);
        let meta = Metadata::from(&o);
        let decoded = Metadata::decode(&meta.encode()).unwrap();
        assert_eq!(meta, decoded);
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.checksum, o.checksum);
    }

    #[test]
    fn test_metadata_decode_rejects_garbage() {
        let err = Metadata::decode(b"\x00\x01\x02").unwrap_err();
        assert!(matches!(err, ObjectError::InvalidData(_)));
    }

    #[test]
    fn test_stamp_sets_wall_clock() {
        let mut o = Object::new_put(1, "k", vec![]);
        o.stamp(100, 5);
        assert_eq!(o.clock, 100);
        assert_eq!(o.req_id, 5);
        assert!(o.timestamp > 0);
    }

    #[test]
    fn test_read_params_whole_range() {
        let p = ReadParams::whole(1, "k", 0);
        assert!(p.is_whole_range());
        assert_eq!(p.etag, 0);
    }
}
