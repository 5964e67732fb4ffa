//! # Strata Core
//!
//! The storage-consistency core of a layered, content-addressed block
//! store.
//!
//! A [`MultiBlockstore`] composes a writable cache mount with read-only
//! mounts, including a filestore mount whose records reference byte ranges
//! of external files rather than duplicating them. A mark-and-sweep
//! garbage collector reclaims blocks unreachable from any pin root, and
//! the verification/clean pipeline detects and repairs divergence between
//! records and the real filesystem.
//!
//! ## Features
//!
//! - Union blockstore: ordered mounts, first mount writable
//! - Filestore records describing file-backed blocks
//! - Mark-and-sweep GC from recursive, direct, and internal pin roots
//! - Multi-level verification with byte-exact listing output
//! - Clean: safe removal of invalid records with pin protection and
//!   optimistic conflict detection
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata_core::{
//!     Block, BlockStore, CancelToken, DiskBlockstore, Filestore, FilestoreBlockstore,
//!     MemPinner, Mount, MultiBlockstore, StoreLinkService, gc,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Arc::new(DiskBlockstore::open("./store/cache")?);
//! let records = Arc::new(Filestore::open("./store/filestore")?);
//! let store = Arc::new(MultiBlockstore::new(vec![
//!     Mount::new("cache", cache as Arc<dyn BlockStore>),
//!     Mount::new(
//!         "filestore",
//!         Arc::new(FilestoreBlockstore::new(records)) as Arc<dyn BlockStore>,
//!     ),
//! ])?);
//!
//! store.put(Block::new(b"some data".to_vec()))?;
//!
//! // Collect everything no pin root reaches.
//! let links = StoreLinkService::new(store.clone() as Arc<dyn BlockStore>);
//! let pinner = MemPinner::new();
//! let cancel = CancelToken::new();
//! for key in gc(&cancel, &store, &links, &pinner, &[])? {
//!     println!("deleted {}", key);
//! }
//! # Ok(())
//! # }
//! ```

mod block;
mod cancel;
mod clean;
mod dataobj;
mod disk;
mod error;
mod filestore;
mod gc;
mod key;
mod multi;
mod node;
mod path;
mod pin;
mod store;
mod verify;

pub use block::{Block, FileBacking};
pub use cancel::CancelToken;
pub use clean::{LineStream, clean, parse_kinds};
pub use dataobj::{DataObj, FileState, flags, mod_time_of, unix_nanos};
pub use disk::DiskBlockstore;
pub use error::{Error, Result};
pub use filestore::{Filestore, FilestoreAwareStore, FilestoreBlockstore, Snapshot};
pub use gc::{colored_set, descendants, gc};
pub use key::{KEY_SIZE, Key};
pub use multi::{GcGuard, LocateInfo, Mount, MultiBlockstore};
pub use node::{DagNode, LinkService, StoreLinkService};
pub use path::clean_path;
pub use pin::{FilePinner, MemPinner, PinKind, Pinner};
pub use store::{BlockStore, KeyStream, MemBlockstore};
pub use verify::{
    Kind, LEVEL_UNLIMITED, ListRes, ListStream, Status, StatusFamily, VerifyParams, list, list_all,
    list_by_key, list_keys, list_whole_file, verify_basic, verify_full, verify_post_orphan,
};
