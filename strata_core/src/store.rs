//! The block store contract and the in-process writable store.

use crate::block::Block;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::key::Key;
use crossbeam_channel::{Receiver, Sender, bounded, select};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::thread;

/// Buffer size for key enumeration channels.
pub(crate) const KEYS_BUF: usize = 128;

/// Send an item on a result stream, returning false when the run is
/// cancelled or the consumer dropped the stream.
pub(crate) fn stream_send<T>(tx: &Sender<T>, cancel: &CancelToken, item: T) -> bool {
    select! {
        recv(cancel.receiver()) -> _ => false,
        send(tx, item) -> res => res.is_ok(),
    }
}

/// A lazy, finite, non-restartable sequence of keys.
///
/// Produced by background enumeration; closed only after every producer has
/// finished. Consuming it drains the producers.
pub struct KeyStream {
    rx: Receiver<Key>,
}

impl KeyStream {
    pub(crate) fn new(rx: Receiver<Key>) -> Self {
        Self { rx }
    }
}

impl Iterator for KeyStream {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        self.rx.recv().ok()
    }
}

/// Minimal block store contract.
///
/// `Error::NotFound` is the reserved absence signal: `get` on an absent key
/// returns it, and callers distinguish it from real failures with
/// [`Error::is_not_found`].
pub trait BlockStore: Send + Sync {
    /// Whether the store holds the key.
    fn has(&self, key: &Key) -> Result<bool>;

    /// Fetch a block by key.
    fn get(&self, key: &Key) -> Result<Block>;

    /// Store a block.
    fn put(&self, block: Block) -> Result<()>;

    /// Store several blocks.
    fn put_many(&self, blocks: Vec<Block>) -> Result<()>;

    /// Delete a block by key.
    fn delete_block(&self, key: &Key) -> Result<()>;

    /// Lazily enumerate every key in the store.
    ///
    /// The producer observes `cancel` promptly; it never outlives
    /// cancellation by more than one pending send.
    fn all_keys(&self, cancel: &CancelToken) -> Result<KeyStream>;
}

/// An in-process writable block store backed by a map.
#[derive(Default)]
pub struct MemBlockstore {
    blocks: RwLock<HashMap<Key, Vec<u8>>>,
}

impl MemBlockstore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks held.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// True if the store holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl BlockStore for MemBlockstore {
    fn has(&self, key: &Key) -> Result<bool> {
        Ok(self.blocks.read().contains_key(key))
    }

    fn get(&self, key: &Key) -> Result<Block> {
        match self.blocks.read().get(key) {
            Some(data) => Ok(Block::with_key(*key, data.clone())),
            None => Err(Error::not_found(key.to_hex())),
        }
    }

    fn put(&self, block: Block) -> Result<()> {
        let key = *block.key();
        self.blocks.write().insert(key, block.into_data());
        Ok(())
    }

    fn put_many(&self, blocks: Vec<Block>) -> Result<()> {
        let mut map = self.blocks.write();
        for block in blocks {
            let key = *block.key();
            map.insert(key, block.into_data());
        }
        Ok(())
    }

    fn delete_block(&self, key: &Key) -> Result<()> {
        match self.blocks.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(key.to_hex())),
        }
    }

    fn all_keys(&self, cancel: &CancelToken) -> Result<KeyStream> {
        let keys: Vec<Key> = self.blocks.read().keys().copied().collect();
        let (tx, rx) = bounded(KEYS_BUF);
        let cancel = cancel.clone();
        thread::spawn(move || {
            for key in keys {
                if !stream_send(&tx, &cancel, key) {
                    return;
                }
            }
        });
        Ok(KeyStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let store = MemBlockstore::new();
        let block = Block::new(b"hello".to_vec());
        let key = *block.key();

        store.put(block).unwrap();
        assert!(store.has(&key).unwrap());

        let fetched = store.get(&key).unwrap();
        assert_eq!(fetched.data(), b"hello");
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let store = MemBlockstore::new();
        let key = Key::hash_bytes(b"absent");

        let err = store.get(&key).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_block() {
        let store = MemBlockstore::new();
        let block = Block::new(b"doomed".to_vec());
        let key = *block.key();

        store.put(block).unwrap();
        store.delete_block(&key).unwrap();
        assert!(!store.has(&key).unwrap());

        // Deleting again reports absence.
        assert!(store.delete_block(&key).unwrap_err().is_not_found());
    }

    #[test]
    fn test_put_many() {
        let store = MemBlockstore::new();
        let blocks: Vec<Block> = (0..5)
            .map(|i| Block::new(format!("block {}", i).into_bytes()))
            .collect();
        let keys: Vec<Key> = blocks.iter().map(|b| *b.key()).collect();

        store.put_many(blocks).unwrap();
        for key in &keys {
            assert!(store.has(key).unwrap());
        }
    }

    #[test]
    fn test_all_keys_drains_everything() {
        let store = MemBlockstore::new();
        let mut expected = std::collections::HashSet::new();
        for i in 0..10 {
            let block = Block::new(format!("k{}", i).into_bytes());
            expected.insert(*block.key());
            store.put(block).unwrap();
        }

        let cancel = CancelToken::new();
        let got: std::collections::HashSet<Key> = store.all_keys(&cancel).unwrap().collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_all_keys_observes_cancellation() {
        let store = MemBlockstore::new();
        for i in 0..1000 {
            store
                .put(Block::new(format!("blk{}", i).into_bytes()))
                .unwrap();
        }

        let cancel = CancelToken::new();
        let mut stream = store.all_keys(&cancel).unwrap();
        // Take a few, then cancel; the producer must stop instead of
        // draining the rest.
        for _ in 0..3 {
            assert!(stream.next().is_some());
        }
        cancel.cancel();

        // The stream closes after at most the buffered sends.
        let remaining = stream.count();
        assert!(remaining <= KEYS_BUF + 1);
    }
}
