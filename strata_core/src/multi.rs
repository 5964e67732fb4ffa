//! A union of multiple backing block stores.
//!
//! Behaves like a unionfs: Put and DeleteBlock only go to the first mount,
//! all others are considered read-only.

use crate::block::Block;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::store::{BlockStore, KEYS_BUF, KeyStream, stream_send};
use crossbeam_channel::bounded;
use parking_lot::RwLock;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use std::sync::Arc;
use std::thread;

/// A named backing store composed into the multi-mount store.
pub struct Mount {
    /// Mount name (prefix).
    pub name: String,
    /// The backing store.
    pub blocks: Arc<dyn BlockStore>,
}

impl Mount {
    /// Create a mount.
    pub fn new(name: impl Into<String>, blocks: Arc<dyn BlockStore>) -> Self {
        Self {
            name: name.into(),
            blocks,
        }
    }
}

/// Per-mount presence report from [`MultiBlockstore::locate`].
///
/// Diagnostics only, never used for routing decisions.
#[derive(Debug)]
pub struct LocateInfo {
    /// Mount name.
    pub mount: String,
    /// Whether the key is present in this mount.
    pub present: bool,
    /// Error encountered probing this mount, absence excluded.
    pub error: Option<Error>,
}

/// Guard for the store's exclusion lock.
///
/// Held for the duration of a GC or clean run; dropped to unlock. The guard
/// owns its lock handle so it can move into a background sweep thread.
pub struct GcGuard {
    _guard: ArcRwLockWriteGuard<parking_lot::RawRwLock, ()>,
}

/// An ordered list of named mounts.
///
/// Mount 0 is the only writable target; all mounts are read targets,
/// queried in order. The mount list is fixed at construction.
pub struct MultiBlockstore {
    mounts: Vec<Mount>,
    gc_lock: Arc<RwLock<()>>,
}

impl MultiBlockstore {
    /// Compose mounts into a union store. At least one mount is required.
    pub fn new(mounts: Vec<Mount>) -> Result<Self> {
        if mounts.is_empty() {
            return Err(Error::invalid_arg("multi blockstore requires a mount"));
        }
        Ok(Self {
            mounts,
            gc_lock: Arc::new(RwLock::new(())),
        })
    }

    /// The first (writable, cache) mount.
    pub fn first_mount(&self) -> &Arc<dyn BlockStore> {
        &self.mounts[0].blocks
    }

    /// Names of all mounts, in order.
    pub fn mounts(&self) -> Vec<&str> {
        self.mounts.iter().map(|m| m.name.as_str()).collect()
    }

    /// Look up a mount by name.
    pub fn mount(&self, name: &str) -> Option<&Arc<dyn BlockStore>> {
        self.mounts
            .iter()
            .find(|m| m.name == name)
            .map(|m| &m.blocks)
    }

    /// Acquire the exclusion lock with write intent.
    ///
    /// Blocks until ordinary readers drain; only one GC-or-Clean run holds
    /// this at a time. Dropping the guard unlocks.
    pub fn gc_lock(&self) -> GcGuard {
        GcGuard {
            _guard: self.gc_lock.write_arc(),
        }
    }

    /// Probe every mount independently for a key.
    pub fn locate(&self, key: &Key) -> Vec<LocateInfo> {
        let mut res = Vec::with_capacity(self.mounts.len());
        for m in &self.mounts {
            let (present, error) = match m.blocks.get(key) {
                Ok(_) => (true, None),
                Err(err) if err.is_not_found() => (false, None),
                Err(err) => (false, Some(err)),
            };
            res.push(LocateInfo {
                mount: m.name.clone(),
                present,
                error,
            });
        }
        res
    }
}

impl BlockStore for MultiBlockstore {
    fn has(&self, key: &Key) -> Result<bool> {
        let mut first_err = None;
        for m in &self.mounts {
            match m.blocks.has(key) {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }

    fn get(&self, key: &Key) -> Result<Block> {
        let mut first_err: Option<Error> = None;
        for m in &self.mounts {
            match m.blocks.get(key) {
                Ok(block) => return Ok(block),
                Err(err) => {
                    // Prefer the first error that is not plain absence.
                    let replace = match &first_err {
                        None => true,
                        Some(prev) => prev.is_not_found(),
                    };
                    if replace {
                        first_err = Some(err);
                    }
                }
            }
        }
        Err(first_err.unwrap_or_else(|| Error::not_found(key.to_hex())))
    }

    fn put(&self, block: Block) -> Result<()> {
        let _read = self.gc_lock.read();
        // Has is cheaper than Put, so see if we already have it.
        if let Ok(true) = self.has(block.key()) {
            return Ok(()); // already stored
        }
        self.mounts[0].blocks.put(block)
    }

    fn put_many(&self, blocks: Vec<Block>) -> Result<()> {
        let _read = self.gc_lock.read();
        // Has is cheaper than Put, so if we already have it then skip.
        let mut still_add = Vec::with_capacity(blocks.len());
        for block in blocks {
            if let Ok(true) = self.has(block.key()) {
                continue; // already stored
            }
            still_add.push(block);
        }
        if still_add.is_empty() {
            return Ok(());
        }
        self.mounts[0].blocks.put_many(still_add)
    }

    fn delete_block(&self, key: &Key) -> Result<()> {
        self.mounts[0].blocks.delete_block(key)
    }

    fn all_keys(&self, cancel: &CancelToken) -> Result<KeyStream> {
        // Begin every mount's own enumeration first; if any fails, the
        // whole call fails before a single producer starts.
        let mut sources = Vec::with_capacity(self.mounts.len());
        for m in &self.mounts {
            sources.push(m.blocks.all_keys(cancel)?);
        }

        let (tx, rx) = bounded(KEYS_BUF);
        let mut handles = Vec::with_capacity(sources.len());
        for source in sources {
            let tx = tx.clone();
            let cancel = cancel.clone();
            handles.push(thread::spawn(move || {
                for key in source {
                    if !stream_send(&tx, &cancel, key) {
                        return;
                    }
                }
            }));
        }

        // Join thread: the output closes only after every producer has
        // finished, because this thread holds the last sender.
        thread::spawn(move || {
            for handle in handles {
                let _ = handle.join();
            }
            drop(tx);
        });

        Ok(KeyStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemBlockstore;
    use std::collections::HashSet;

    fn two_mount_store() -> (Arc<MemBlockstore>, Arc<MemBlockstore>, MultiBlockstore) {
        let cache = Arc::new(MemBlockstore::new());
        let backing = Arc::new(MemBlockstore::new());
        let multi = MultiBlockstore::new(vec![
            Mount::new("cache", cache.clone() as Arc<dyn BlockStore>),
            Mount::new("filestore", backing.clone() as Arc<dyn BlockStore>),
        ])
        .unwrap();
        (cache, backing, multi)
    }

    #[test]
    fn test_requires_a_mount() {
        assert!(MultiBlockstore::new(vec![]).is_err());
    }

    #[test]
    fn test_get_prefers_earlier_mount() {
        let (cache, backing, multi) = two_mount_store();

        // Same key in both mounts with different (trusted) payloads.
        let key = Key::hash_bytes(b"shadowed");
        cache.put(Block::with_key(key, b"from cache".to_vec())).unwrap();
        backing
            .put(Block::with_key(key, b"from backing".to_vec()))
            .unwrap();

        assert_eq!(multi.get(&key).unwrap().data(), b"from cache");
    }

    #[test]
    fn test_get_falls_through_to_later_mount() {
        let (_cache, backing, multi) = two_mount_store();

        let block = Block::new(b"only in backing".to_vec());
        let key = *block.key();
        backing.put(block).unwrap();

        assert_eq!(multi.get(&key).unwrap().data(), b"only in backing");
        assert!(multi.has(&key).unwrap());
    }

    #[test]
    fn test_get_missing_everywhere() {
        let (_cache, _backing, multi) = two_mount_store();
        let err = multi.get(&Key::hash_bytes(b"nowhere")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_put_targets_first_mount() {
        let (cache, backing, multi) = two_mount_store();

        let block = Block::new(b"new block".to_vec());
        let key = *block.key();
        multi.put(block).unwrap();

        assert!(cache.has(&key).unwrap());
        assert!(!backing.has(&key).unwrap());
    }

    #[test]
    fn test_put_skips_existing_block() {
        let (cache, backing, multi) = two_mount_store();

        // Block already present in a later mount; Put must not write it
        // again anywhere.
        let block = Block::new(b"already there".to_vec());
        let key = *block.key();
        backing.put(block.clone()).unwrap();

        multi.put(block).unwrap();
        assert!(!cache.has(&key).unwrap());
    }

    #[test]
    fn test_put_many_writes_only_new_blocks() {
        let (cache, backing, multi) = two_mount_store();

        let existing = Block::new(b"old".to_vec());
        let fresh = Block::new(b"fresh".to_vec());
        backing.put(existing.clone()).unwrap();

        multi.put_many(vec![existing.clone(), fresh.clone()]).unwrap();

        assert!(!cache.has(existing.key()).unwrap());
        assert!(cache.has(fresh.key()).unwrap());
    }

    #[test]
    fn test_delete_targets_first_mount_only() {
        let (cache, backing, multi) = two_mount_store();

        let key = Key::hash_bytes(b"both");
        cache.put(Block::with_key(key, b"both".to_vec())).unwrap();
        backing.put(Block::with_key(key, b"both".to_vec())).unwrap();

        multi.delete_block(&key).unwrap();
        assert!(!cache.has(&key).unwrap());
        assert!(backing.has(&key).unwrap());
    }

    #[test]
    fn test_mount_lookup() {
        let (_cache, _backing, multi) = two_mount_store();
        assert_eq!(multi.mounts(), vec!["cache", "filestore"]);
        assert!(multi.mount("filestore").is_some());
        assert!(multi.mount("missing").is_none());
    }

    #[test]
    fn test_locate_reports_per_mount() {
        let (_cache, backing, multi) = two_mount_store();

        let block = Block::new(b"locate me".to_vec());
        let key = *block.key();
        backing.put(block).unwrap();

        let infos = multi.locate(&key);
        assert_eq!(infos.len(), 2);
        assert!(!infos[0].present);
        assert!(infos[0].error.is_none());
        assert!(infos[1].present);
    }

    #[test]
    fn test_all_keys_merges_all_mounts() {
        let (cache, backing, multi) = two_mount_store();

        let mut expected = HashSet::new();
        for i in 0..4 {
            let block = Block::new(format!("cache {}", i).into_bytes());
            expected.insert(*block.key());
            cache.put(block).unwrap();
        }
        for i in 0..4 {
            let block = Block::new(format!("backing {}", i).into_bytes());
            expected.insert(*block.key());
            backing.put(block).unwrap();
        }

        let cancel = CancelToken::new();
        let got: HashSet<Key> = multi.all_keys(&cancel).unwrap().collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_all_keys_cancellation_stops_producers() {
        let (cache, backing, multi) = two_mount_store();

        for i in 0..500 {
            cache.put(Block::new(format!("c{}", i).into_bytes())).unwrap();
            backing
                .put(Block::new(format!("b{}", i).into_bytes()))
                .unwrap();
        }

        let cancel = CancelToken::new();
        let mut stream = multi.all_keys(&cancel).unwrap();
        for _ in 0..5 {
            assert!(stream.next().is_some());
        }
        cancel.cancel();

        // Producers stop promptly; only already-buffered keys drain.
        let remaining = stream.count();
        assert!(remaining <= 3 * KEYS_BUF);
    }

    #[test]
    fn test_gc_lock_excludes_writers() {
        let (_cache, _backing, multi) = two_mount_store();
        let multi = Arc::new(multi);

        let guard = multi.gc_lock();

        let multi2 = multi.clone();
        let handle = thread::spawn(move || {
            // Blocks until the guard is dropped.
            multi2.put(Block::new(b"waits for gc".to_vec())).unwrap();
        });

        // Give the writer a moment to block on the lock.
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!handle.is_finished());

        drop(guard);
        handle.join().unwrap();
        assert!(multi.has(Block::new(b"waits for gc".to_vec()).key()).unwrap());
    }
}
