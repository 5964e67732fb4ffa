//! The filestore: a record database whose values describe blocks backed by
//! byte ranges of external files instead of duplicated content.

use crate::block::Block;
use crate::cancel::CancelToken;
use crate::dataobj::{DataObj, flags};
use crate::disk::shard_keys;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::store::{BlockStore, KeyStream};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// The filestore's metadata database.
///
/// One record file per key at `<root>/<prefix>/<suffix>`, written
/// atomically. A single write mutex serializes mutations; reads are
/// lock-free.
pub struct Filestore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl Filestore {
    /// Open a filestore rooted at the given directory, creating it if
    /// needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the root directory of the record database.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &Key) -> PathBuf {
        self.root.join(key.prefix()).join(key.suffix())
    }

    /// Raw encoded record bytes for a key.
    pub fn get_raw(&self, key: &Key) -> Result<Vec<u8>> {
        match fs::read(self.record_path(key)) {
            Ok(raw) => Ok(raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(key.to_hex()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch and decode a record.
    pub fn get(&self, key: &Key) -> Result<DataObj> {
        DataObj::decode(&self.get_raw(key)?).map_err(|e| Error::corrupt(key.to_hex(), e.to_string()))
    }

    /// Fetch a record without its inline bytes (fast scanning).
    pub fn get_light(&self, key: &Key) -> Result<DataObj> {
        DataObj::decode_light(&self.get_raw(key)?)
            .map_err(|e| Error::corrupt(key.to_hex(), e.to_string()))
    }

    /// Whether a record exists for the key.
    pub fn exists(&self, key: &Key) -> Result<bool> {
        Ok(self.record_path(key).exists())
    }

    /// Store a record.
    pub fn put(&self, key: &Key, obj: &DataObj) -> Result<()> {
        let encoded = obj.encode()?;
        let _write = self.write_lock.lock();
        self.write_raw(key, &encoded)
    }

    fn write_raw(&self, key: &Key, encoded: &[u8]) -> Result<()> {
        let path = self.record_path(key);
        let parent = match path.parent() {
            Some(parent) => parent,
            None => return Err(Error::invalid_store(&self.root, "record path has no parent")),
        };
        fs::create_dir_all(parent)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        temp_file.write_all(encoded)?;
        temp_file.flush()?;
        temp_file.persist(&path)?;
        Ok(())
    }

    /// Delete a record.
    pub fn delete(&self, key: &Key) -> Result<()> {
        let _write = self.write_lock.lock();
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(key.to_hex()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Lazily enumerate every record key.
    pub fn keys(&self, cancel: &CancelToken) -> Result<KeyStream> {
        Ok(shard_keys(self.root.clone(), cancel))
    }

    /// Content bytes for a record, see [`DataObj::content`].
    pub fn get_data(&self, key: &Key, obj: &DataObj, verify: bool) -> Result<Vec<u8>> {
        obj.content(key, verify)
    }

    /// Take an immutable point-in-time view of the raw record data.
    ///
    /// Holds the write mutex during capture so no mutation can interleave.
    /// Used as the scan source for verification and solely for conflict
    /// detection during clean.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let _write = self.write_lock.lock();
        let mut records = BTreeMap::new();

        let shards = match fs::read_dir(&self.root) {
            Ok(shards) => shards,
            Err(err) => return Err(err.into()),
        };
        for shard_entry in shards {
            let shard_path = shard_entry?.path();
            if !shard_path.is_dir() {
                continue;
            }
            let prefix = match shard_path.file_name().and_then(|n| n.to_str()) {
                Some(prefix) => prefix.to_string(),
                None => continue,
            };
            for entry in fs::read_dir(&shard_path)? {
                let path = entry?.path();
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
                records.insert(key, fs::read(&path)?);
            }
        }

        Ok(Snapshot { records })
    }

    /// Optimistic-concurrency update primitive.
    ///
    /// Under the write mutex: when `expected` is given and the current raw
    /// value differs, nothing is applied and `Error::Conflict` is
    /// returned. A key that no longer exists is not an error; deleting it
    /// is a success. `new` of `None` deletes the record, otherwise it is
    /// replaced.
    pub fn update(&self, key: &Key, expected: Option<&[u8]>, new: Option<&DataObj>) -> Result<()> {
        let encoded = match new {
            Some(obj) => Some(obj.encode()?),
            None => None,
        };

        let _write = self.write_lock.lock();
        let path = self.record_path(key);
        let current = match fs::read(&path) {
            Ok(raw) => Some(raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        if let (Some(expected), Some(current)) = (expected, current.as_deref()) {
            if expected != current {
                debug!(key = %key, "update refused, value changed");
                return Err(Error::conflict(key.to_hex()));
            }
        }

        match (current, encoded) {
            (None, None) => Ok(()), // already gone
            (Some(_), None) => {
                fs::remove_file(&path)?;
                Ok(())
            }
            (_, Some(encoded)) => self.write_raw(key, &encoded),
        }
    }
}

/// An immutable point-in-time view of the filestore's raw record data.
pub struct Snapshot {
    records: BTreeMap<Key, Vec<u8>>,
}

impl Snapshot {
    /// Raw record bytes captured for a key.
    pub fn get_raw(&self, key: &Key) -> Option<&[u8]> {
        self.records.get(key).map(Vec::as_slice)
    }

    /// Iterate captured records in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &[u8])> {
        self.records.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Number of captured records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no records were captured.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Blockstore view over the filestore.
///
/// Values in the underlying database are metadata records; `get`
/// reconstructs block content from them (reading backing files as needed).
pub struct FilestoreBlockstore {
    fs: Arc<Filestore>,
}

impl FilestoreBlockstore {
    /// Create a blockstore view over the given filestore.
    pub fn new(fs: Arc<Filestore>) -> Self {
        Self { fs }
    }

    /// The underlying record database.
    pub fn filestore(&self) -> &Arc<Filestore> {
        &self.fs
    }

    fn record_for(block: &Block) -> Result<DataObj> {
        let backing = match block.backing() {
            Some(backing) => backing,
            None => {
                return Err(Error::invalid_arg(
                    "filestore only accepts file-backed blocks",
                ));
            }
        };

        let obj = if let Some(alt) = &backing.alt_data {
            // Alternate bytes override whatever the file range holds.
            DataObj {
                flags: if backing.whole_file {
                    flags::WHOLE_FILE
                } else {
                    0
                },
                file_path: backing.file_path.clone(),
                offset: backing.offset,
                size: backing.size,
                mod_time: backing.mod_time,
                data: None,
                alt_data: Some(alt.clone()),
            }
        } else if backing.whole_file {
            // Top-level block of a file-backed DAG; node bytes are stored
            // inline.
            DataObj {
                flags: flags::WHOLE_FILE | flags::FILE_ROOT,
                file_path: backing.file_path.clone(),
                offset: backing.offset,
                size: backing.size,
                mod_time: backing.mod_time,
                data: Some(block.data().to_vec()),
                alt_data: None,
            }
        } else {
            // Leaf: content is exactly the recorded file range.
            DataObj {
                flags: flags::NO_BLOCK_DATA,
                file_path: backing.file_path.clone(),
                offset: backing.offset,
                size: backing.size,
                mod_time: backing.mod_time,
                data: None,
                alt_data: None,
            }
        };
        Ok(obj)
    }
}

impl BlockStore for FilestoreBlockstore {
    fn has(&self, key: &Key) -> Result<bool> {
        self.fs.exists(key)
    }

    fn get(&self, key: &Key) -> Result<Block> {
        let obj = self.fs.get(key)?;
        let data = self.fs.get_data(key, &obj, true)?;
        Ok(Block::with_key(*key, data))
    }

    fn put(&self, block: Block) -> Result<()> {
        let obj = Self::record_for(&block)?;
        self.fs.put(block.key(), &obj)
    }

    fn put_many(&self, blocks: Vec<Block>) -> Result<()> {
        for block in blocks {
            self.put(block)?;
        }
        Ok(())
    }

    fn delete_block(&self, key: &Key) -> Result<()> {
        self.fs.delete(key)
    }

    fn all_keys(&self, cancel: &CancelToken) -> Result<KeyStream> {
        self.fs.keys(cancel)
    }
}

/// Extends a base store with filestore-aware write logic.
///
/// Wraps and forwards to the base store, overriding only `put`/`put_many`:
/// file-backed blocks become filestore records, everything else goes to the
/// base store untouched.
pub struct FilestoreAwareStore {
    base: Arc<dyn BlockStore>,
    records: FilestoreBlockstore,
}

impl FilestoreAwareStore {
    /// Wrap a base store.
    pub fn new(base: Arc<dyn BlockStore>, fs: Arc<Filestore>) -> Self {
        Self {
            base,
            records: FilestoreBlockstore::new(fs),
        }
    }
}

impl BlockStore for FilestoreAwareStore {
    fn has(&self, key: &Key) -> Result<bool> {
        self.base.has(key)
    }

    fn get(&self, key: &Key) -> Result<Block> {
        self.base.get(key)
    }

    fn put(&self, block: Block) -> Result<()> {
        if block.backing().is_some() {
            return self.records.put(block);
        }
        // Has is cheaper than Put, so see if we already have it.
        if let Ok(true) = self.base.has(block.key()) {
            return Ok(());
        }
        self.base.put(block)
    }

    fn put_many(&self, blocks: Vec<Block>) -> Result<()> {
        let mut plain = Vec::new();
        for block in blocks {
            if block.backing().is_some() {
                self.records.put(block)?;
            } else if !matches!(self.base.has(block.key()), Ok(true)) {
                plain.push(block);
            }
        }
        if plain.is_empty() {
            return Ok(());
        }
        self.base.put_many(plain)
    }

    fn delete_block(&self, key: &Key) -> Result<()> {
        self.base.delete_block(key)
    }

    fn all_keys(&self, cancel: &CancelToken) -> Result<KeyStream> {
        self.base.all_keys(cancel)
    }
}
