//! quorus-engine: the request-handling core of a storage node.
//!
//! Owns replication correctness (W/R/D quorums with partial-failure
//! recovery), the read-and-repair state machine, the watchdog-driven
//! adaptive controller, recursive directory deletion, and the admission
//! layer that bounds concurrency. The local store, the ring, the message
//! queue and the event notifier are injected handles; peer transport is
//! the [`peer::PeerClient`] seam with a gRPC implementation in
//! `quorus-net`.

pub mod dir_delete;
pub mod handler;
pub mod notify;
pub mod peer;
pub mod pool;
pub mod read_repair;
pub mod replicate;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testutil;

pub use handler::{GetReply, ObjectHandler};
pub use peer::{PeerClient, PeerError};
pub use pool::WorkerPool;
