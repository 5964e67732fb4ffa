//! DAG node encoding and link resolution.
//!
//! Intermediate blocks carry a list of child keys plus an opaque payload:
//!
//! ```text
//! 0x00  4   "SDAG" magic
//! 0x04  1   version (u8) = 1
//! 0x05  3   reserved (must be 0)
//! 0x08  4   link_count (u32 LE)
//! 0x0C  8   data_len (u64 LE)
//! 0x14  ... links (32 bytes each), data
//! ```
//!
//! Leaf blocks are raw bytes and never start with the magic.

use crate::error::{Error, Result};
use crate::key::{KEY_SIZE, Key};
use crate::store::BlockStore;
use std::sync::Arc;

/// Magic bytes at the start of every encoded node.
pub const NODE_MAGIC: &[u8; 4] = b"SDAG";

/// Current node format version.
pub const NODE_VERSION: u8 = 1;

/// Size of the node header in bytes.
pub const NODE_HEADER_SIZE: usize = 20;

/// An intermediate block: child links plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DagNode {
    /// Child link keys, in order.
    pub links: Vec<Key>,
    /// Opaque payload.
    pub data: Vec<u8>,
}

impl DagNode {
    /// Create a node from links and payload.
    pub fn new(links: Vec<Key>, data: Vec<u8>) -> Self {
        Self { links, data }
    }

    /// Encode the node.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(NODE_HEADER_SIZE + self.links.len() * KEY_SIZE + self.data.len());
        buf.extend_from_slice(NODE_MAGIC);
        buf.push(NODE_VERSION);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&(self.links.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u64).to_le_bytes());
        for link in &self.links {
            buf.extend_from_slice(link.as_bytes());
        }
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode a node, requiring the magic to be present.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        match Self::maybe_decode(buf)? {
            Some(node) => Ok(node),
            None => Err(Error::invalid_arg("not an encoded node (missing magic)")),
        }
    }

    /// Decode bytes that may be a node.
    ///
    /// Returns `Ok(None)` for leaf bytes (no magic), the node for a
    /// well-formed encoding, and an error for bytes that carry the magic
    /// but fail to parse.
    pub fn maybe_decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < 4 || &buf[0..4] != NODE_MAGIC {
            return Ok(None);
        }
        if buf.len() < NODE_HEADER_SIZE {
            return Err(Error::invalid_arg(format!(
                "node too short: {} bytes (expected at least {})",
                buf.len(),
                NODE_HEADER_SIZE
            )));
        }
        if buf[4] != NODE_VERSION {
            return Err(Error::invalid_arg(format!(
                "unsupported node version: {}",
                buf[4]
            )));
        }

        let link_count = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let mut data_len_bytes = [0u8; 8];
        data_len_bytes.copy_from_slice(&buf[12..20]);
        let data_len = u64::from_le_bytes(data_len_bytes) as usize;

        let links_end = NODE_HEADER_SIZE + link_count * KEY_SIZE;
        if buf.len() != links_end + data_len {
            return Err(Error::invalid_arg(format!(
                "node length mismatch: {} bytes for {} links and {} payload bytes",
                buf.len(),
                link_count,
                data_len
            )));
        }

        let mut links = Vec::with_capacity(link_count);
        for i in 0..link_count {
            let at = NODE_HEADER_SIZE + i * KEY_SIZE;
            let mut bytes = [0u8; KEY_SIZE];
            bytes.copy_from_slice(&buf[at..at + KEY_SIZE]);
            links.push(Key::from_bytes(bytes));
        }

        Ok(Some(Self {
            links,
            data: buf[links_end..].to_vec(),
        }))
    }
}

/// Lazily enumerates child link identifiers of a block.
pub trait LinkService: Send + Sync {
    /// Child links of the given block. Leaf blocks have none.
    ///
    /// `Error::NotFound` means the block is not resolvable here.
    fn links(&self, key: &Key) -> Result<Vec<Key>>;

    /// A resolver restricted to already-local data.
    ///
    /// GC switches to this before traversal so only locally present links
    /// are followed.
    fn offline(&self) -> Box<dyn LinkService>;
}

/// Link service resolving nodes from a block store.
pub struct StoreLinkService {
    store: Arc<dyn BlockStore>,
}

impl StoreLinkService {
    /// Create a link service over the given store.
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }
}

impl LinkService for StoreLinkService {
    fn links(&self, key: &Key) -> Result<Vec<Key>> {
        let block = self.store.get(key)?;
        match DagNode::maybe_decode(block.data())? {
            Some(node) => Ok(node.links),
            None => Ok(Vec::new()),
        }
    }

    fn offline(&self) -> Box<dyn LinkService> {
        // Resolution already only touches the local store.
        Box::new(Self {
            store: self.store.clone(),
        })
    }
}
