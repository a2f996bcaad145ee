//! In-memory reference implementation of the store facade.
//!
//! Conflict resolution follows the replica rule: highest clock wins,
//! ties broken by checksum. Tombstones are kept (carrying the deleting
//! clock) until compaction drops them.

use crate::facade::{CompactionStats, CompactionStatus, DigestContext, ObjectStore, StoreError};
use quorus_common::{content_etag, wall_clock_secs, Metadata, Object, StorageMethod};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct Entry {
    meta: Metadata,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    locked: HashSet<u32>,
    stats: CompactionStats,
}

/// An in-memory object store with container locking and compaction
/// bookkeeping.
#[derive(Debug)]
pub struct MemStore {
    containers: u32,
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new(containers: u32) -> Self {
        Self {
            containers: containers.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The container an address belongs to.
    pub fn container_of(&self, addr_id: u32) -> u32 {
        addr_id % self.containers
    }

    /// Lock a container (as the compactor would); reads and writes against
    /// it fail with `LockedContainer` until unlocked.
    pub fn lock_container(&self, container: u32) {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .locked
            .insert(container);
    }

    pub fn unlock_container(&self, container: u32) {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .locked
            .remove(&container);
    }

    /// Number of stored entries, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_unlocked(&self, inner: &Inner, addr_id: u32) -> Result<(), StoreError> {
        let container = self.container_of(addr_id);
        if inner.locked.contains(&container) {
            return Err(StoreError::LockedContainer(container));
        }
        Ok(())
    }

    /// `true` when `incoming` should supersede `existing`.
    fn supersedes(existing: &Metadata, incoming: &Metadata) -> bool {
        match incoming.clock.cmp(&existing.clock) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => incoming.checksum >= existing.checksum,
            std::cmp::Ordering::Less => false,
        }
    }
}

impl ObjectStore for MemStore {
    fn get(
        &self,
        addr_id: u32,
        key: &str,
        start_pos: u64,
        end_pos: u64,
        forced_integrity_check: bool,
    ) -> Result<(Metadata, Object), StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        self.check_unlocked(&inner, addr_id)?;

        let entry = inner.entries.get(key).ok_or(StoreError::NotFound)?;
        if entry.meta.del {
            return Err(StoreError::NotFound);
        }

        if forced_integrity_check && content_etag(&entry.data) != entry.meta.checksum {
            return Err(StoreError::InvalidData(format!(
                "checksum mismatch for key '{}'",
                key
            )));
        }

        let data = if start_pos == 0 && end_pos == 0 {
            entry.data.clone()
        } else {
            let len = entry.data.len() as u64;
            if start_pos >= len {
                return Err(StoreError::InvalidData(format!(
                    "range start {} beyond object size {}",
                    start_pos, len
                )));
            }
            let end = end_pos.min(len.saturating_sub(1));
            entry.data[start_pos as usize..=end as usize].to_vec()
        };

        let object = Object {
            addr_id: entry.meta.addr_id,
            key: entry.meta.key.clone(),
            dsize: data.len() as u64,
            data,
            cindex: entry.meta.cindex,
            cnumber: entry.meta.cnumber,
            parent_key: entry.meta.parent_key.clone(),
            clock: entry.meta.clock,
            timestamp: entry.meta.timestamp,
            checksum: entry.meta.checksum,
            method: StorageMethod::Put,
            del: false,
            req_id: 0,
            ring_hash: entry.meta.ring_hash,
            num_of_replicas: entry.meta.num_of_replicas,
        };
        Ok((entry.meta.clone(), object))
    }

    fn put(&self, addr_id: u32, key: &str, object: Object) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        self.check_unlocked(&inner, addr_id)?;

        let meta = Metadata::from(&object);
        if let Some(existing) = inner.entries.get(key) {
            if !Self::supersedes(&existing.meta, &meta) {
                // A newer write already landed; keep it.
                return Ok(existing.meta.checksum);
            }
        }
        let etag = meta.checksum;
        inner.entries.insert(
            key.to_string(),
            Entry {
                meta,
                data: object.data,
            },
        );
        Ok(etag)
    }

    fn delete(&self, addr_id: u32, key: &str, object: Object) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        self.check_unlocked(&inner, addr_id)?;

        match inner.entries.get(key) {
            None => Err(StoreError::NotFound),
            Some(existing) if existing.meta.del => Ok(()), // already deleted
            Some(existing) => {
                let mut meta = Metadata::from(&object);
                meta.del = true;
                meta.dsize = 0;
                meta.checksum = 0;
                if !Self::supersedes(&existing.meta, &meta) {
                    return Ok(());
                }
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        meta,
                        data: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn head(&self, addr_id: u32, key: &str) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        self.check_unlocked(&inner, addr_id)?;
        let entry = inner.entries.get(key).ok_or(StoreError::NotFound)?;
        Ok(entry.meta.encode())
    }

    fn head_with_digest(
        &self,
        addr_id: u32,
        key: &str,
        mut ctx: DigestContext,
    ) -> Result<(Metadata, DigestContext), StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        self.check_unlocked(&inner, addr_id)?;
        let entry = inner.entries.get(key).ok_or(StoreError::NotFound)?;
        if entry.meta.del {
            return Err(StoreError::NotFound);
        }
        ctx.update(&entry.data);
        Ok((entry.meta.clone(), ctx))
    }

    fn fetch_by_key(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, &[u8]),
    ) -> Result<(), StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        for (key, entry) in inner.entries.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            visit(key, &entry.meta.encode());
        }
        Ok(())
    }

    fn compact_data(
        &self,
        targets: &[u32],
        parallelism: usize,
        owned: &(dyn Fn(&str) -> bool + Sync),
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            if inner.stats.status == CompactionStatus::Running {
                return Err(StoreError::Internal("compaction already running".into()));
            }
            inner.stats.status = CompactionStatus::Running;
        }

        tracing::info!(
            "compacting {} container(s), parallelism {}",
            targets.len(),
            parallelism
        );

        let mut dropped = 0usize;
        for &container in targets {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.locked.insert(container);
            let doomed: Vec<String> = inner
                .entries
                .iter()
                .filter(|(key, entry)| {
                    self.container_of(entry.meta.addr_id) == container
                        && (entry.meta.del || !owned(key))
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                inner.entries.remove(&key);
                dropped += 1;
            }
            inner.locked.remove(&container);
        }

        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.stats.pending_targets.retain(|c| !targets.contains(c));
        inner.stats.latest_exec_time = wall_clock_secs();
        inner.stats.status = CompactionStatus::Idle;
        tracing::info!("compaction finished, dropped {} entrie(s)", dropped);
        Ok(())
    }

    fn compaction_stats(&self) -> CompactionStats {
        self.inner.lock().expect("store lock poisoned").stats.clone()
    }

    fn mark_compaction_target(&self, container: u32) {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if !inner.stats.pending_targets.contains(&container) {
            inner.stats.pending_targets.push(container);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn put_object(store: &MemStore, key: &str, data: &[u8], clock: u64) -> u64 {
        let mut o = Object::new_put(1, key, data.to_vec());
        o.stamp(clock, 0);
        store.put(1, key, o).unwrap()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = MemStore::new(4);
        let etag = put_object(&store, "a/b", b"payload", 10);
        assert_eq!(etag, content_etag(b"payload"));

        let (meta, object) = store.get(1, "a/b", 0, 0, false).unwrap();
        assert_eq!(object.data, b"payload");
        assert_eq!(meta.checksum, etag);
        assert_eq!(meta.clock, 10);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let store = MemStore::new(4);
        assert_eq!(
            store.get(1, "nope", 0, 0, false).unwrap_err(),
            StoreError::NotFound
        );
    }

    #[test]
    fn test_stale_put_is_ignored() {
        let store = MemStore::new(4);
        put_object(&store, "k", b"new", 20);
        put_object(&store, "k", b"old", 10);

        let (_, object) = store.get(1, "k", 0, 0, false).unwrap();
        assert_eq!(object.data, b"new", "older clock must not overwrite");
    }

    #[test]
    fn test_clock_tie_resolved_by_checksum() {
        let store = MemStore::new(4);
        let e1 = content_etag(b"aaa");
        let e2 = content_etag(b"zzz");
        let (lo, hi) = if e1 < e2 {
            (b"aaa", b"zzz")
        } else {
            (b"zzz", b"aaa")
        };
        put_object(&store, "k", hi, 5);
        put_object(&store, "k", lo, 5);

        let (meta, _) = store.get(1, "k", 0, 0, false).unwrap();
        assert_eq!(meta.checksum, content_etag(hi));
    }

    #[test]
    fn test_delete_writes_tombstone() {
        let store = MemStore::new(4);
        put_object(&store, "k", b"v", 10);

        let mut tomb = Object::tombstone(1, "k");
        tomb.stamp(11, 0);
        store.delete(1, "k", tomb).unwrap();

        assert_eq!(
            store.get(1, "k", 0, 0, false).unwrap_err(),
            StoreError::NotFound
        );
        // HEAD still sees the tombstone with the deleting clock.
        let meta = Metadata::decode(&store.head(1, "k").unwrap()).unwrap();
        assert!(meta.del);
        assert_eq!(meta.clock, 11);
        assert_eq!(meta.dsize, 0);
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let store = MemStore::new(4);
        let mut tomb = Object::tombstone(1, "k");
        tomb.stamp(1, 0);
        assert_eq!(store.delete(1, "k", tomb).unwrap_err(), StoreError::NotFound);
    }

    #[test]
    fn test_second_delete_is_noop_ok() {
        let store = MemStore::new(4);
        put_object(&store, "k", b"v", 10);

        let mut t1 = Object::tombstone(1, "k");
        t1.stamp(11, 0);
        store.delete(1, "k", t1).unwrap();

        let mut t2 = Object::tombstone(1, "k");
        t2.stamp(12, 0);
        store.delete(1, "k", t2).unwrap();
    }

    #[test]
    fn test_locked_container_rejects_ops() {
        let store = MemStore::new(4);
        put_object(&store, "k", b"v", 10);

        let container = store.container_of(1);
        store.lock_container(container);

        assert!(matches!(
            store.get(1, "k", 0, 0, false).unwrap_err(),
            StoreError::LockedContainer(_)
        ));
        let mut o = Object::new_put(1, "k2", b"x".to_vec());
        o.stamp(11, 0);
        assert!(matches!(
            store.put(1, "k2", o).unwrap_err(),
            StoreError::LockedContainer(_)
        ));

        store.unlock_container(container);
        assert!(store.get(1, "k", 0, 0, false).is_ok());
    }

    #[test]
    fn test_range_read_inclusive() {
        let store = MemStore::new(4);
        put_object(&store, "k", b"0123456789", 10);

        let (_, object) = store.get(1, "k", 2, 5, false).unwrap();
        assert_eq!(object.data, b"2345");
        assert_eq!(object.dsize, 4);

        // End clamped to object size.
        let (_, object) = store.get(1, "k", 8, 100, false).unwrap();
        assert_eq!(object.data, b"89");

        // Start beyond the object is invalid.
        assert!(matches!(
            store.get(1, "k", 50, 60, false).unwrap_err(),
            StoreError::InvalidData(_)
        ));
    }

    #[test]
    fn test_forced_integrity_check_detects_corruption() {
        let store = MemStore::new(4);
        let mut o = Object::new_put(1, "k", b"body".to_vec());
        o.stamp(10, 0);
        o.checksum = 0xDEAD; // corrupt the stored checksum
        store.put(1, "k", o).unwrap();

        assert!(store.get(1, "k", 0, 0, false).is_ok());
        assert!(matches!(
            store.get(1, "k", 0, 0, true).unwrap_err(),
            StoreError::InvalidData(_)
        ));
    }

    #[test]
    fn test_head_with_digest_accumulates() {
        let store = MemStore::new(4);
        put_object(&store, "a", b"hello ", 10);
        put_object(&store, "b", b"world", 11);

        let ctx = DigestContext::new();
        let (_, ctx) = store.head_with_digest(1, "a", ctx).unwrap();
        let (_, ctx) = store.head_with_digest(1, "b", ctx).unwrap();
        assert_eq!(ctx.digest64(), content_etag(b"hello world"));
    }

    #[test]
    fn test_fetch_by_key_prefix_scan() {
        let store = MemStore::new(4);
        put_object(&store, "dir/a", b"1", 10);
        put_object(&store, "dir/b", b"2", 11);
        put_object(&store, "other/c", b"3", 12);

        let mut seen = Vec::new();
        store
            .fetch_by_key("dir/", &mut |key, meta_bytes| {
                let meta = Metadata::decode(meta_bytes).unwrap();
                seen.push((key.to_string(), meta.del));
            })
            .unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "dir/a");
        assert_eq!(seen[1].0, "dir/b");
    }

    #[test]
    fn test_compact_drops_tombstones_and_foreign_entries() {
        let store = MemStore::new(1); // everything in container 0
        put_object(&store, "keep", b"v", 10);
        put_object(&store, "foreign", b"v", 11);
        put_object(&store, "gone", b"v", 12);
        let mut tomb = Object::tombstone(1, "gone");
        tomb.stamp(13, 0);
        store.delete(1, "gone", tomb).unwrap();

        store.mark_compaction_target(0);
        assert_eq!(store.compaction_stats().pending_targets, vec![0]);

        store
            .compact_data(&[0], 2, &|key: &str| key != "foreign")
            .unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.get(1, "keep", 0, 0, false).is_ok());
        let stats = store.compaction_stats();
        assert_eq!(stats.status, CompactionStatus::Idle);
        assert!(stats.pending_targets.is_empty());
        assert!(stats.latest_exec_time > 0);
    }
}
