//! Mark-and-sweep garbage collection.

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::key::Key;
use crate::multi::MultiBlockstore;
use crate::node::LinkService;
use crate::pin::Pinner;
use crate::store::{BlockStore, KEYS_BUF, KeyStream, stream_send};
use crossbeam_channel::bounded;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tracing::debug;

/// Run a mark-and-sweep garbage collection of the blocks in the store.
///
/// First builds the colored set: all recursively pinned blocks plus their
/// descendants, `best_effort_roots` plus their descendants, all directly
/// pinned blocks, and all blocks used internally by the pinner. It then
/// iterates every block in the first (cache) mount and deletes any block
/// not in the set, emitting each deleted key.
///
/// The store's exclusion lock is held until the sweep finishes, is
/// cancelled, or fails. Traversal from recursive and internal pins is
/// strict: a failure there aborts the run, since an incomplete reachability
/// set would risk deleting live data. The first delete failure also stops
/// the run.
pub fn gc(
    cancel: &CancelToken,
    store: &Arc<MultiBlockstore>,
    links: &dyn LinkService,
    pinner: &dyn Pinner,
    best_effort_roots: &[Key],
) -> Result<KeyStream> {
    let guard = store.gc_lock();

    // No link resolution beyond local data during GC.
    let links = links.offline();

    let colored = colored_set(pinner, links.as_ref(), best_effort_roots)?;

    // Only delete blocks in the first (cache) mount.
    let keys = store.first_mount().all_keys(cancel)?;

    let (tx, rx) = bounded(KEYS_BUF);
    let store = store.clone();
    let cancel = cancel.clone();
    thread::spawn(move || {
        let _guard = guard; // released when the sweep ends
        for key in keys {
            if cancel.is_cancelled() {
                return;
            }
            if colored.contains(&key) {
                continue;
            }
            if let Err(err) = store.delete_block(&key) {
                debug!(key = %key, error = %err, "error removing key from blockstore");
                return;
            }
            if !stream_send(&tx, &cancel, key) {
                return;
            }
        }
    });

    Ok(KeyStream::new(rx))
}

/// Compute the set of keys reachable from all pin roots.
///
/// Recursive and internal pins are traversed strictly; `best_effort_roots`
/// tolerate missing links. Computed fresh per GC run, never persisted.
pub fn colored_set(
    pinner: &dyn Pinner,
    links: &dyn LinkService,
    best_effort_roots: &[Key],
) -> Result<HashSet<Key>> {
    let mut set = HashSet::new();

    descendants(links, &mut set, &pinner.recursive_keys()?, false)?;
    descendants(links, &mut set, best_effort_roots, true)?;

    for key in pinner.direct_keys()? {
        set.insert(key);
    }

    descendants(links, &mut set, &pinner.internal_pins()?, false)?;

    Ok(set)
}

/// Add the roots and all their link-reachable descendants to the set.
///
/// A key already in the set is not re-descended, which both bounds work on
/// shared substructure and terminates cyclic link graphs. With
/// `best_effort`, failures to resolve a node are swallowed and the walk
/// continues.
pub fn descendants(
    links: &dyn LinkService,
    set: &mut HashSet<Key>,
    roots: &[Key],
    best_effort: bool,
) -> Result<()> {
    for root in roots {
        set.insert(*root);
        enumerate_children(links, set, root, best_effort)?;
    }
    Ok(())
}

fn enumerate_children(
    links: &dyn LinkService,
    set: &mut HashSet<Key>,
    key: &Key,
    best_effort: bool,
) -> Result<()> {
    let children = match links.links(key) {
        Ok(children) => children,
        Err(_) if best_effort => return Ok(()),
        Err(err) => return Err(err),
    };
    for child in children {
        if set.contains(&child) {
            continue;
        }
        set.insert(child);
        enumerate_children(links, set, &child, best_effort)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::error::Error;
    use crate::multi::Mount;
    use crate::node::{DagNode, StoreLinkService};
    use crate::pin::{MemPinner, PinKind};
    use crate::store::MemBlockstore;
    use std::collections::HashMap;

    /// Link service over an explicit link table, for graphs (like cycles)
    /// that content hashing cannot produce.
    struct MapLinkService {
        table: HashMap<Key, Vec<Key>>,
    }

    impl LinkService for MapLinkService {
        fn links(&self, key: &Key) -> Result<Vec<Key>> {
            match self.table.get(key) {
                Some(links) => Ok(links.clone()),
                None => Err(Error::not_found(key.to_hex())),
            }
        }

        fn offline(&self) -> Box<dyn LinkService> {
            Box::new(MapLinkService {
                table: self.table.clone(),
            })
        }
    }

    /// Mount-0 store whose deletes always fail.
    struct NoDeleteStore {
        inner: MemBlockstore,
    }

    impl BlockStore for NoDeleteStore {
        fn has(&self, key: &Key) -> Result<bool> {
            self.inner.has(key)
        }
        fn get(&self, key: &Key) -> Result<Block> {
            self.inner.get(key)
        }
        fn put(&self, block: Block) -> Result<()> {
            self.inner.put(block)
        }
        fn put_many(&self, blocks: Vec<Block>) -> Result<()> {
            self.inner.put_many(blocks)
        }
        fn delete_block(&self, _key: &Key) -> Result<()> {
            Err(Error::database("delete refused"))
        }
        fn all_keys(&self, cancel: &CancelToken) -> Result<KeyStream> {
            self.inner.all_keys(cancel)
        }
    }

    fn store_with_cache(cache: Arc<dyn BlockStore>) -> Arc<MultiBlockstore> {
        let backing = Arc::new(MemBlockstore::new());
        Arc::new(
            MultiBlockstore::new(vec![
                Mount::new("cache", cache),
                Mount::new("filestore", backing as Arc<dyn BlockStore>),
            ])
            .unwrap(),
        )
    }

    fn put_node(store: &MemBlockstore, links: Vec<Key>) -> Key {
        let block = Block::new(DagNode::new(links, vec![]).encode());
        let key = *block.key();
        store.put(block).unwrap();
        key
    }

    fn put_leaf(store: &MemBlockstore, data: &[u8]) -> Key {
        let block = Block::new(data.to_vec());
        let key = *block.key();
        store.put(block).unwrap();
        key
    }

    #[test]
    fn test_gc_deletes_unreferenced_blocks() {
        let cache = Arc::new(MemBlockstore::new());
        let store = store_with_cache(cache.clone() as Arc<dyn BlockStore>);
        let links = StoreLinkService::new(store.clone() as Arc<dyn BlockStore>);
        let pinner = MemPinner::new();

        let orphan = put_leaf(&cache, b"orphan data");

        let cancel = CancelToken::new();
        let deleted: Vec<Key> = gc(&cancel, &store, &links, &pinner, &[]).unwrap().collect();

        assert_eq!(deleted, vec![orphan]);
        assert!(!cache.has(&orphan).unwrap());
    }

    #[test]
    fn test_gc_preserves_recursive_pins_and_descendants() {
        let cache = Arc::new(MemBlockstore::new());
        let store = store_with_cache(cache.clone() as Arc<dyn BlockStore>);
        let links = StoreLinkService::new(store.clone() as Arc<dyn BlockStore>);

        let leaf1 = put_leaf(&cache, b"file1");
        let leaf2 = put_leaf(&cache, b"file2");
        let root = put_node(&cache, vec![leaf1, leaf2]);
        let orphan = put_leaf(&cache, b"orphan");

        let pinner = MemPinner::new();
        pinner.pin(PinKind::Recursive, root);

        let cancel = CancelToken::new();
        let deleted: Vec<Key> = gc(&cancel, &store, &links, &pinner, &[]).unwrap().collect();

        assert_eq!(deleted, vec![orphan]);
        assert!(cache.has(&root).unwrap());
        assert!(cache.has(&leaf1).unwrap());
        assert!(cache.has(&leaf2).unwrap());
    }

    #[test]
    fn test_gc_preserves_direct_and_internal_pins() {
        let cache = Arc::new(MemBlockstore::new());
        let store = store_with_cache(cache.clone() as Arc<dyn BlockStore>);
        let links = StoreLinkService::new(store.clone() as Arc<dyn BlockStore>);

        let direct = put_leaf(&cache, b"direct");
        let internal = put_leaf(&cache, b"internal");
        let doomed = put_leaf(&cache, b"doomed");

        let pinner = MemPinner::new();
        pinner.pin(PinKind::Direct, direct);
        pinner.pin(PinKind::Internal, internal);

        let cancel = CancelToken::new();
        let deleted: HashSet<Key> = gc(&cancel, &store, &links, &pinner, &[])
            .unwrap()
            .collect();

        assert_eq!(deleted, HashSet::from([doomed]));
        assert!(cache.has(&direct).unwrap());
        assert!(cache.has(&internal).unwrap());
    }

    #[test]
    fn test_gc_preserves_best_effort_roots() {
        let cache = Arc::new(MemBlockstore::new());
        let store = store_with_cache(cache.clone() as Arc<dyn BlockStore>);
        let links = StoreLinkService::new(store.clone() as Arc<dyn BlockStore>);
        let pinner = MemPinner::new();

        let missing_child = Key::hash_bytes(b"never stored");
        let kept_leaf = put_leaf(&cache, b"kept leaf");
        let root = put_node(&cache, vec![kept_leaf, missing_child]);
        let orphan = put_leaf(&cache, b"collectable");

        // The missing link must not fail the run in best-effort mode.
        let cancel = CancelToken::new();
        let deleted: Vec<Key> = gc(&cancel, &store, &links, &pinner, &[root])
            .unwrap()
            .collect();

        assert_eq!(deleted, vec![orphan]);
        assert!(cache.has(&root).unwrap());
        assert!(cache.has(&kept_leaf).unwrap());
    }

    #[test]
    fn test_gc_strict_traversal_failure_aborts() {
        let cache = Arc::new(MemBlockstore::new());
        let store = store_with_cache(cache.clone() as Arc<dyn BlockStore>);
        let links = StoreLinkService::new(store.clone() as Arc<dyn BlockStore>);

        // Recursive pin of a key the link service cannot resolve.
        let pinner = MemPinner::new();
        pinner.pin(PinKind::Recursive, Key::hash_bytes(b"unresolvable"));

        let survivor = put_leaf(&cache, b"must survive the abort");

        let cancel = CancelToken::new();
        assert!(gc(&cancel, &store, &links, &pinner, &[]).is_err());
        assert!(cache.has(&survivor).unwrap());
    }

    #[test]
    fn test_gc_never_deletes_from_other_mounts() {
        let cache = Arc::new(MemBlockstore::new());
        let backing = Arc::new(MemBlockstore::new());
        let store = Arc::new(
            MultiBlockstore::new(vec![
                Mount::new("cache", cache.clone() as Arc<dyn BlockStore>),
                Mount::new("filestore", backing.clone() as Arc<dyn BlockStore>),
            ])
            .unwrap(),
        );
        let links = StoreLinkService::new(store.clone() as Arc<dyn BlockStore>);
        let pinner = MemPinner::new();

        let unreachable = put_leaf(&backing, b"unreachable but not ours");

        let cancel = CancelToken::new();
        let deleted: Vec<Key> = gc(&cancel, &store, &links, &pinner, &[]).unwrap().collect();

        assert!(deleted.is_empty());
        assert!(backing.has(&unreachable).unwrap());
    }

    #[test]
    fn test_gc_delete_failure_stops_the_run() {
        let failing = Arc::new(NoDeleteStore {
            inner: MemBlockstore::new(),
        });
        failing.inner.put(Block::new(b"a".to_vec())).unwrap();
        failing.inner.put(Block::new(b"b".to_vec())).unwrap();

        let store = store_with_cache(failing.clone() as Arc<dyn BlockStore>);
        let links = StoreLinkService::new(store.clone() as Arc<dyn BlockStore>);
        let pinner = MemPinner::new();

        let cancel = CancelToken::new();
        let deleted: Vec<Key> = gc(&cancel, &store, &links, &pinner, &[]).unwrap().collect();

        // Fail-fast: nothing emitted, both blocks still present.
        assert!(deleted.is_empty());
        assert_eq!(failing.inner.len(), 2);
    }

    #[test]
    fn test_gc_releases_lock_after_sweep() {
        let cache = Arc::new(MemBlockstore::new());
        let store = store_with_cache(cache.clone() as Arc<dyn BlockStore>);
        let links = StoreLinkService::new(store.clone() as Arc<dyn BlockStore>);
        let pinner = MemPinner::new();

        put_leaf(&cache, b"swept");

        let cancel = CancelToken::new();
        let stream = gc(&cancel, &store, &links, &pinner, &[]).unwrap();
        let _ = stream.count(); // drain to completion

        // The exclusion lock must be free again.
        drop(store.gc_lock());
    }

    #[test]
    fn test_colored_set_closure_and_cycle_termination() {
        let a = Key::hash_bytes(b"node a");
        let b = Key::hash_bytes(b"node b");
        let c = Key::hash_bytes(b"node c");

        // a -> b -> c -> a, a cyclic graph.
        let links = MapLinkService {
            table: HashMap::from([(a, vec![b]), (b, vec![c]), (c, vec![a])]),
        };

        let pinner = MemPinner::new();
        pinner.pin(PinKind::Recursive, a);

        let set = colored_set(&pinner, &links, &[]).unwrap();
        assert_eq!(set, HashSet::from([a, b, c]));
    }

    #[test]
    fn test_colored_set_shared_substructure() {
        let shared = Key::hash_bytes(b"shared");
        let r1 = Key::hash_bytes(b"root one");
        let r2 = Key::hash_bytes(b"root two");

        let links = MapLinkService {
            table: HashMap::from([(r1, vec![shared]), (r2, vec![shared]), (shared, vec![])]),
        };

        let pinner = MemPinner::new();
        pinner.pin(PinKind::Recursive, r1);
        pinner.pin(PinKind::Recursive, r2);

        let set = colored_set(&pinner, &links, &[]).unwrap();
        assert_eq!(set, HashSet::from([r1, r2, shared]));
    }
}
