//! Recursive directory delete.
//!
//! A DELETE whose key ends in `/` tombstones the directory record, then
//! fans the purge out: every running member is asked to remove its own
//! objects under the prefix, and the local store is scanned so each live
//! entry lands on the async-deletion topic. Peer failures become retry
//! envelopes on the queue; nothing here propagates.

use crate::handler::ObjectHandler;
use crate::peer::PeerClient;
use quorus_common::{wall_clock_millis, ObjectError, Reference};
use quorus_mq::QueueId;
use quorus_store::ObjectStore;
use std::collections::HashSet;
use std::sync::Mutex;

/// Cache of directory listings; a directory delete invalidates its parent
/// entry so stale listings don't resurface removed keys.
#[derive(Debug, Default)]
pub struct DirCache {
    dirs: Mutex<HashSet<String>>,
}

impl DirCache {
    pub fn insert(&self, dir: &str) {
        self.dirs
            .lock()
            .expect("dir cache lock poisoned")
            .insert(dir.to_string());
    }

    /// Drop a cached directory; returns whether an entry existed.
    pub fn invalidate(&self, dir: &str) -> bool {
        self.dirs
            .lock()
            .expect("dir cache lock poisoned")
            .remove(dir)
    }

    pub fn contains(&self, dir: &str) -> bool {
        self.dirs
            .lock()
            .expect("dir cache lock poisoned")
            .contains(dir)
    }
}

/// Parent directory of a directory key: `a/b/` -> `a/`, `top/` -> `/`.
pub fn parent_directory(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => trimmed[..=idx].to_string(),
        None => "/".to_string(),
    }
}

impl<S: ObjectStore, P: PeerClient> ObjectHandler<S, P> {
    /// Kick off the directory purge for a key ending in `/`. Fire and
    /// forget: the DELETE reply never waits on the fan-out.
    pub(crate) fn spawn_dir_delete(&self, key: &str) {
        let parent = parent_directory(key);
        self.dir_cache.invalidate(&parent);

        // Tombstone record for the directory-metadata syncer.
        let record = serde_json::json!({
            "dir": key,
            "deleted": true,
            "timestamp": wall_clock_millis(),
        });
        if let Err(e) = self
            .queue
            .publish(QueueId::DelDir, key, record.to_string().as_bytes())
        {
            tracing::warn!("directory tombstone enqueue failed: {}", e);
        }

        let members = self.resolver.running_members();
        let peers = self.peers.clone();
        let queue = self.queue.clone();
        let timeout = self.request_timeout;
        let prefix = key.to_string();
        let reference = Reference::mint();

        tokio::spawn(async move {
            for member in members {
                let prefixes = [Some(prefix.clone()), None];
                let dispatched = tokio::time::timeout(
                    timeout,
                    peers.delete_objects_under_dir(member.addr, reference, &prefixes),
                )
                .await;
                let failed = !matches!(dispatched, Ok(Ok(_)));
                if failed {
                    tracing::warn!(
                        "dir purge dispatch to {} failed, enqueueing retry",
                        member.addr
                    );
                    if let Err(e) = queue.publish(
                        QueueId::AsyncDeleteDir,
                        &member.addr.to_string(),
                        prefix.as_bytes(),
                    ) {
                        tracing::warn!("dir purge retry enqueue failed: {}", e);
                    }
                }
            }
        });

        // The local share of the purge.
        if let Err(e) = self.prefix_search_and_remove_objects(key) {
            tracing::warn!("local prefix purge of '{}' failed: {}", key, e);
        }
    }

    /// Scan the local store under `prefix` and enqueue an async deletion
    /// for every live entry. Already-deleted entries are skipped.
    pub fn prefix_search_and_remove_objects(&self, prefix: &str) -> Result<usize, ObjectError> {
        let mut enqueued = 0usize;
        let queue = self.queue.clone();
        self.store
            .fetch_by_key(prefix, &mut |key, meta_bytes| {
                let meta = match quorus_common::Metadata::decode(meta_bytes) {
                    Ok(meta) => meta,
                    Err(e) => {
                        tracing::warn!("skipping corrupt metadata for '{}': {}", key, e);
                        return;
                    }
                };
                if meta.del {
                    return;
                }
                let mq_key = format!("{}\n{}", meta.addr_id, key);
                if queue
                    .publish(QueueId::AsyncDeleteObj, &mq_key, meta_bytes)
                    .is_ok()
                {
                    enqueued += 1;
                }
            })
            .map_err(crate::handler::store_error)?;

        tracing::debug!("prefix purge '{}' enqueued {} object(s)", prefix, enqueued);
        Ok(enqueued)
    }

    /// Inbound entry point for a peer's `delete_objects_under_dir`; echoes
    /// the reference after the local purge is enqueued.
    pub fn delete_objects_under_dir(
        &self,
        reference: Reference,
        prefixes: &[Option<String>],
    ) -> Reference {
        for prefix in prefixes.iter().flatten() {
            if let Err(e) = self.prefix_search_and_remove_objects(prefix) {
                tracing::warn!("peer-driven prefix purge of '{}' failed: {}", prefix, e);
            }
        }
        reference
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
