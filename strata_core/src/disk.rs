//! Persistent on-disk block store used as the writable cache mount.

use crate::block::Block;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::store::{BlockStore, KEYS_BUF, KeyStream, stream_send};
use crossbeam_channel::bounded;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;

/// A block store keeping each block in its own file, sharded by the first
/// hex byte of the key: `<root>/<prefix>/<suffix>`.
///
/// Writes are atomic (tempfile then persist) and reads verify the content
/// hash against the key, so corruption is detected at the read site.
#[derive(Debug)]
pub struct DiskBlockstore {
    root: PathBuf,
}

impl DiskBlockstore {
    /// Open a store rooted at the given directory, creating it if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Get the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding a block.
    pub fn block_path(&self, key: &Key) -> PathBuf {
        self.root.join(key.prefix()).join(key.suffix())
    }
}

impl BlockStore for DiskBlockstore {
    fn has(&self, key: &Key) -> Result<bool> {
        Ok(self.block_path(key).exists())
    }

    fn get(&self, key: &Key) -> Result<Block> {
        let path = self.block_path(key);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(key.to_hex()));
            }
            Err(err) => return Err(err.into()),
        };

        // Verify hash matches (corruption detection).
        let computed = Key::hash_bytes(&data);
        if computed != *key {
            return Err(Error::corrupt(
                key.to_hex(),
                format!("content hash mismatch: got {}", computed.to_hex()),
            ));
        }

        Ok(Block::with_key(*key, data))
    }

    fn put(&self, block: Block) -> Result<()> {
        let path = self.block_path(block.key());
        if path.exists() {
            return Ok(());
        }

        let parent = match path.parent() {
            Some(parent) => parent,
            None => return Err(Error::invalid_store(&self.root, "block path has no parent")),
        };
        fs::create_dir_all(parent)?;

        // Write atomically using tempfile.
        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        temp_file.write_all(block.data())?;
        temp_file.flush()?;
        temp_file.persist(&path)?;

        Ok(())
    }

    fn put_many(&self, blocks: Vec<Block>) -> Result<()> {
        for block in blocks {
            self.put(block)?;
        }
        Ok(())
    }

    fn delete_block(&self, key: &Key) -> Result<()> {
        let path = self.block_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(key.to_hex()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn all_keys(&self, cancel: &CancelToken) -> Result<KeyStream> {
        Ok(shard_keys(self.root.clone(), cancel))
    }
}

/// Background producer draining a sharded object directory into a stream.
///
/// Shared by the disk blockstore and the filestore record database, which
/// use the same `<prefix>/<suffix>` layout. Unparseable names are skipped.
pub(crate) fn shard_keys(root: PathBuf, cancel: &CancelToken) -> KeyStream {
    let (tx, rx) = bounded(KEYS_BUF);
    let cancel = cancel.clone();
    thread::spawn(move || {
        let shards = match fs::read_dir(&root) {
            Ok(shards) => shards,
            Err(_) => return,
        };
        for shard_entry in shards.flatten() {
            let shard_path = shard_entry.path();
            if !shard_path.is_dir() {
                continue;
            }
            let prefix = match shard_path.file_name().and_then(|n| n.to_str()) {
                Some(prefix) => prefix.to_string(),
                None => continue,
            };

            let entries = match fs::read_dir(&shard_path) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let suffix = match path.file_name().and_then(|n| n.to_str()) {
                    Some(suffix) => suffix,
                    None => continue,
                };
                let key = match Key::from_hex(&format!("{}{}", prefix, suffix)) {
                    Ok(key) => key,
                    Err(_) => continue,
                };
                if !stream_send(&tx, &cancel, key) {
                    return;
                }
            }
        }
    });
    KeyStream::new(rx)
}
