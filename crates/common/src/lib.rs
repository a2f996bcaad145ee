//! quorus-common: shared domain types for the quorus storage node.
//!
//! Provides the `Object`/`Metadata` pair that travels between replicas,
//! request `Reference`s, the process-monotone logical clock, content
//! hashing, and the error taxonomy shared by every layer.

pub mod clock;
pub mod error;
pub mod object;

pub use clock::LogicalClock;
pub use error::ObjectError;
pub use object::{Metadata, Object, ReadParams, StorageMethod};

use sha1::{Digest, Sha1};
use std::fmt;

// ---------------------------------------------------------------------------
// Reference
// ---------------------------------------------------------------------------

/// A per-request correlation token, minted by the initiator of an external
/// request and echoed verbatim in peer replies.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, PartialOrd, Ord,
)]
pub struct Reference(uuid::Uuid);

impl Reference {
    /// Mint a fresh reference.
    pub fn mint() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parse from the wire form produced by [`Reference::to_string`].
    pub fn parse(s: &str) -> Result<Self, ObjectError> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ObjectError::InvalidData(format!("bad reference: {}", e)))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Show the first uuid group only; enough to eyeball correlation in logs.
        let s = self.0.to_string();
        write!(f, "Ref({})", &s[..8])
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Content ETag: the first 8 bytes of the SHA-1 digest of the body,
/// big-endian. Returned to clients for optimistic concurrency and stored
/// as the object checksum.
pub fn content_etag(data: &[u8]) -> u64 {
    let digest = Sha1::digest(data);
    u64::from_be_bytes(digest[..8].try_into().expect("sha1 digest >= 8 bytes"))
}

/// Position of arbitrary bytes on the 64-bit hash ring.
pub fn ring_position(data: &[u8]) -> u64 {
    let digest = Sha1::digest(data);
    u64::from_be_bytes(digest[..8].try_into().expect("sha1 digest >= 8 bytes"))
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn wall_clock_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wall-clock seconds since the Unix epoch.
pub fn wall_clock_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
