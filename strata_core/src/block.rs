//! Blocks: immutable byte sequences identified by their content key.

use crate::key::Key;

/// Provenance of a block whose bytes live in an external file.
///
/// Carried alongside the block through filestore-aware put paths so the
/// write ends up as a metadata record instead of a copied payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBacking {
    /// Path of the backing file.
    pub file_path: String,
    /// Byte offset of the block content within the file.
    pub offset: u64,
    /// Byte size of the block content.
    pub size: u64,
    /// Modification time of the file when the block was created
    /// (unix nanoseconds).
    pub mod_time: i64,
    /// True when the record spans the entire file.
    pub whole_file: bool,
    /// Alternate bytes overriding the file-derived content.
    pub alt_data: Option<Vec<u8>>,
}

/// An immutable block of data with its content key.
///
/// A block is never mutated once written; the key is the BLAKE3 hash of the
/// data and is computed once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    key: Key,
    data: Vec<u8>,
    backing: Option<FileBacking>,
}

impl Block {
    /// Create a block, computing its key from the data.
    pub fn new(data: Vec<u8>) -> Self {
        let key = Key::hash_bytes(&data);
        Self {
            key,
            data,
            backing: None,
        }
    }

    /// Create a block with a caller-supplied key.
    ///
    /// The key is trusted, not recomputed. Used when reconstructing blocks
    /// from stores that already verified the content.
    pub fn with_key(key: Key, data: Vec<u8>) -> Self {
        Self {
            key,
            data,
            backing: None,
        }
    }

    /// Attach file-range provenance to this block.
    pub fn with_backing(mut self, backing: FileBacking) -> Self {
        self.backing = Some(backing);
        self
    }

    /// The block's content key.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The block's bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// File-range provenance, if any.
    pub fn backing(&self) -> Option<&FileBacking> {
        self.backing.as_ref()
    }

    /// Consume the block, returning its bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
