//! quorus-mq: the message-queue contract.
//!
//! The durable backend is an external collaborator; this crate defines the
//! topics, the `publish` contract, and the per-topic concurrency throttle
//! handles the adaptive controller drives. [`LocalQueue`] is the in-process
//! implementation used by the node wiring and the tests.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// The durable topics consumed by background workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueId {
    PerObject,
    SyncByVnodeId,
    Rebalance,
    AsyncDeleteObj,
    AsyncDeleteDir,
    RecoveryNode,
    SyncObjWithDc,
    CompMetaWithDc,
    DelDir,
}

impl QueueId {
    /// Every topic, in declaration order.
    pub const ALL: [QueueId; 9] = [
        QueueId::PerObject,
        QueueId::SyncByVnodeId,
        QueueId::Rebalance,
        QueueId::AsyncDeleteObj,
        QueueId::AsyncDeleteDir,
        QueueId::RecoveryNode,
        QueueId::SyncObjWithDc,
        QueueId::CompMetaWithDc,
        QueueId::DelDir,
    ];

    /// Topics under adaptive concurrency control. The dir-purge retry
    /// topic stays at fixed concurrency so retries drain even under load.
    pub const THROTTLED: [QueueId; 8] = [
        QueueId::PerObject,
        QueueId::SyncByVnodeId,
        QueueId::Rebalance,
        QueueId::AsyncDeleteObj,
        QueueId::RecoveryNode,
        QueueId::SyncObjWithDc,
        QueueId::CompMetaWithDc,
        QueueId::DelDir,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueId::PerObject => "per_object",
            QueueId::SyncByVnodeId => "sync_by_vnode_id",
            QueueId::Rebalance => "rebalance",
            QueueId::AsyncDeleteObj => "async_delete_obj",
            QueueId::AsyncDeleteDir => "async_delete_dir",
            QueueId::RecoveryNode => "recovery_node",
            QueueId::SyncObjWithDc => "sync_obj_with_dc",
            QueueId::CompMetaWithDc => "comp_meta_with_dc",
            QueueId::DelDir => "del_dir",
        }
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub key: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum MqError {
    #[error("queue backend rejected publish to {0}: {1}")]
    PublishFailed(QueueId, String),
}

/// Producer contract: accept a message for at-least-once delivery.
pub trait MessageQueue: Send + Sync + 'static {
    fn publish(&self, qid: QueueId, key: &str, payload: &[u8]) -> Result<(), MqError>;
}

// ---------------------------------------------------------------------------
// Throttle handles
// ---------------------------------------------------------------------------

/// Capability handle over one topic's consumer concurrency.
///
/// Held by the adaptive controller so throttling never looks a queue up
/// by name at the call site.
#[derive(Debug, Clone)]
pub struct QueueThrottle {
    topic: QueueId,
    concurrency: Arc<AtomicUsize>,
    max: usize,
}

impl QueueThrottle {
    pub fn new(topic: QueueId, initial: usize, max: usize) -> Self {
        Self {
            topic,
            concurrency: Arc::new(AtomicUsize::new(initial.clamp(1, max.max(1)))),
            max: max.max(1),
        }
    }

    pub fn topic(&self) -> QueueId {
        self.topic
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.load(Ordering::Relaxed)
    }

    /// Raise consumer concurrency by one, up to the configured ceiling.
    pub fn increase(&self) {
        let prev = self.concurrency.load(Ordering::Relaxed);
        if prev < self.max {
            self.concurrency.store(prev + 1, Ordering::Relaxed);
            tracing::debug!("queue {} concurrency {} -> {}", self.topic, prev, prev + 1);
        }
    }

    /// Lower consumer concurrency by one; consumers never stop entirely.
    pub fn decrease(&self) {
        let prev = self.concurrency.load(Ordering::Relaxed);
        if prev > 1 {
            self.concurrency.store(prev - 1, Ordering::Relaxed);
            tracing::debug!("queue {} concurrency {} -> {}", self.topic, prev, prev - 1);
        }
    }
}

// ---------------------------------------------------------------------------
// LocalQueue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TopicState {
    pending: Mutex<VecDeque<Envelope>>,
    throttle: QueueThrottle,
}

/// In-process queue: per-topic pending buffers plus throttle handles.
#[derive(Debug)]
pub struct LocalQueue {
    topics: HashMap<QueueId, TopicState>,
}

impl LocalQueue {
    pub fn new(initial_concurrency: usize, max_concurrency: usize) -> Self {
        let topics = QueueId::ALL
            .into_iter()
            .map(|qid| {
                (
                    qid,
                    TopicState {
                        pending: Mutex::new(VecDeque::new()),
                        throttle: QueueThrottle::new(qid, initial_concurrency, max_concurrency),
                    },
                )
            })
            .collect();
        Self { topics }
    }

    /// Throttle handle for one topic.
    pub fn throttle(&self, qid: QueueId) -> QueueThrottle {
        self.topics[&qid].throttle.clone()
    }

    /// Throttle handles for every topic under adaptive control, in
    /// declaration order.
    pub fn throttles(&self) -> Vec<QueueThrottle> {
        QueueId::THROTTLED
            .iter()
            .map(|qid| self.throttle(*qid))
            .collect()
    }

    /// Number of messages waiting on a topic.
    pub fn pending_len(&self, qid: QueueId) -> usize {
        self.topics[&qid].pending.lock().expect("mq lock poisoned").len()
    }

    /// Drain everything pending on a topic (consumer/test hook).
    pub fn drain(&self, qid: QueueId) -> Vec<Envelope> {
        self.topics[&qid]
            .pending
            .lock()
            .expect("mq lock poisoned")
            .drain(..)
            .collect()
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new(4, 16)
    }
}

impl MessageQueue for LocalQueue {
    fn publish(&self, qid: QueueId, key: &str, payload: &[u8]) -> Result<(), MqError> {
        self.topics[&qid]
            .pending
            .lock()
            .expect("mq lock poisoned")
            .push_back(Envelope {
                key: key.to_string(),
                payload: payload.to_vec(),
            });
        quorus_metrics::metrics()
            .queue_publishes
            .with_label_values(&[qid.as_str()])
            .inc();
        tracing::debug!("published to {} key '{}'", qid, key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
