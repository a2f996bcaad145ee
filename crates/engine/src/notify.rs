//! Outbound notification hooks.
//!
//! After each completed mutation the handler notifies downstream syncers
//! (directory index, remote cluster). The notifier is an injected handle;
//! the queue-backed implementation publishes one envelope per interested
//! topic.

use quorus_common::StorageMethod;
use quorus_mq::{MessageQueue, QueueId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A completed mutation, as seen by downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub method: StorageMethod,
    pub addr_id: u32,
    pub key: String,
    pub etag: u64,
    pub clock: u64,
}

#[async_trait::async_trait]
pub trait EventNotifier: Send + Sync + 'static {
    async fn notify(&self, event: MutationEvent);
}

/// Notifier that drops everything; used where no syncers are wired.
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait::async_trait]
impl EventNotifier for NoopNotifier {
    async fn notify(&self, _event: MutationEvent) {}
}

/// Queue-backed notifier: feeds the per-object directory syncer and the
/// cross-DC object syncer.
pub struct QueueNotifier {
    queue: Arc<dyn MessageQueue>,
}

impl QueueNotifier {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait::async_trait]
impl EventNotifier for QueueNotifier {
    async fn notify(&self, event: MutationEvent) {
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("mutation event encode failed: {}", e);
                return;
            }
        };
        for topic in [QueueId::PerObject, QueueId::SyncObjWithDc] {
            if let Err(e) = self.queue.publish(topic, &event.key, &payload) {
                tracing::warn!("mutation notify to {} failed: {}", topic, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorus_mq::LocalQueue;

    #[tokio::test]
    async fn test_queue_notifier_feeds_both_syncers() {
        let queue = Arc::new(LocalQueue::default());
        let notifier = QueueNotifier::new(queue.clone() as Arc<dyn MessageQueue>);

        notifier
            .notify(MutationEvent {
                method: StorageMethod::Put,
                addr_id: 3,
                key: "a/b".into(),
                etag: 99,
                clock: 7,
            })
            .await;

        for topic in [QueueId::PerObject, QueueId::SyncObjWithDc] {
            let envelopes = queue.drain(topic);
            assert_eq!(envelopes.len(), 1);
            let event: MutationEvent = serde_json::from_slice(&envelopes[0].payload).unwrap();
            assert_eq!(event.key, "a/b");
            assert_eq!(event.etag, 99);
        }
    }

    #[tokio::test]
    async fn test_noop_notifier_is_silent() {
        let notifier = NoopNotifier;
        notifier
            .notify(MutationEvent {
                method: StorageMethod::Delete,
                addr_id: 0,
                key: "k".into(),
                etag: 0,
                clock: 1,
            })
            .await;
    }
}
