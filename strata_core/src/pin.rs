//! Pinning: root keys protected from garbage collection.

use crate::error::{Error, Result};
use crate::key::Key;
use crate::node::LinkService;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The three disjoint pin root collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinKind {
    /// Pinned together with all link-reachable descendants.
    Recursive,
    /// Pinned by itself.
    Direct,
    /// Used internally by the pinner.
    Internal,
}

impl PinKind {
    /// File/name of this pin collection.
    pub fn as_str(&self) -> &'static str {
        match self {
            PinKind::Recursive => "recursive",
            PinKind::Direct => "direct",
            PinKind::Internal => "internal",
        }
    }
}

/// Read-only view of pin roots, consumed by GC's colored-set computation
/// and by clean's pin-check step.
pub trait Pinner: Send + Sync {
    /// Recursively-pinned root keys.
    fn recursive_keys(&self) -> Result<Vec<Key>>;

    /// Directly-pinned keys.
    fn direct_keys(&self) -> Result<Vec<Key>>;

    /// Keys used internally by the pinner.
    fn internal_pins(&self) -> Result<Vec<Key>>;

    /// Whether the key is protected, with a human-readable reason.
    ///
    /// Covers direct, recursive, and internal pins, plus descendants of
    /// recursive pins when a link service is available.
    fn is_pinned(&self, key: &Key) -> Result<Option<String>>;
}

/// Reason a key is protected as a descendant of a recursive root, if it is.
///
/// Unresolvable links are tolerated; a pin check never fails because a link
/// cannot be followed.
fn indirect_reason(links: &dyn LinkService, roots: &[Key], target: &Key) -> Option<String> {
    let mut visited = HashSet::new();
    for root in roots {
        if walk_contains(links, root, target, &mut visited) {
            return Some(format!("indirect through {}", root));
        }
    }
    None
}

fn walk_contains(
    links: &dyn LinkService,
    at: &Key,
    target: &Key,
    visited: &mut HashSet<Key>,
) -> bool {
    let children = match links.links(at) {
        Ok(children) => children,
        Err(_) => return false,
    };
    for child in children {
        if child == *target {
            return true;
        }
        if visited.insert(child) && walk_contains(links, &child, target, visited) {
            return true;
        }
    }
    false
}

/// An in-process pinner.
#[derive(Default)]
pub struct MemPinner {
    recursive: RwLock<HashSet<Key>>,
    direct: RwLock<HashSet<Key>>,
    internal: RwLock<HashSet<Key>>,
    links: Option<Arc<dyn LinkService>>,
}

impl MemPinner {
    /// Create an empty pinner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a link service so `is_pinned` covers descendants of
    /// recursive pins.
    pub fn with_link_service(mut self, links: Arc<dyn LinkService>) -> Self {
        self.links = Some(links);
        self
    }

    /// Add a pin.
    pub fn pin(&self, kind: PinKind, key: Key) {
        match kind {
            PinKind::Recursive => self.recursive.write().insert(key),
            PinKind::Direct => self.direct.write().insert(key),
            PinKind::Internal => self.internal.write().insert(key),
        };
    }

    /// Remove a pin. Returns whether it was present.
    pub fn unpin(&self, kind: PinKind, key: &Key) -> bool {
        match kind {
            PinKind::Recursive => self.recursive.write().remove(key),
            PinKind::Direct => self.direct.write().remove(key),
            PinKind::Internal => self.internal.write().remove(key),
        }
    }
}

impl Pinner for MemPinner {
    fn recursive_keys(&self) -> Result<Vec<Key>> {
        Ok(self.recursive.read().iter().copied().collect())
    }

    fn direct_keys(&self) -> Result<Vec<Key>> {
        Ok(self.direct.read().iter().copied().collect())
    }

    fn internal_pins(&self) -> Result<Vec<Key>> {
        Ok(self.internal.read().iter().copied().collect())
    }

    fn is_pinned(&self, key: &Key) -> Result<Option<String>> {
        if self.direct.read().contains(key) {
            return Ok(Some("direct".to_string()));
        }
        if self.recursive.read().contains(key) {
            return Ok(Some("recursive".to_string()));
        }
        if self.internal.read().contains(key) {
            return Ok(Some("internal".to_string()));
        }
        if let Some(links) = &self.links {
            let roots: Vec<Key> = self.recursive.read().iter().copied().collect();
            return Ok(indirect_reason(links.as_ref(), &roots, key));
        }
        Ok(None)
    }
}

/// Pin collections persisted as hash-per-line files under a directory.
///
/// Each collection is one append-only file; blank lines, comments, and
/// unparseable lines are ignored on read.
pub struct FilePinner {
    root: PathBuf,
    links: Option<Arc<dyn LinkService>>,
}

impl FilePinner {
    /// Open the pin directory, creating it if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root, links: None })
    }

    /// Attach a link service so `is_pinned` covers descendants of
    /// recursive pins.
    pub fn with_link_service(mut self, links: Arc<dyn LinkService>) -> Self {
        self.links = Some(links);
        self
    }

    fn kind_path(&self, kind: PinKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    /// Add a pin by appending to the collection file.
    pub fn add(&self, kind: PinKind, key: &Key) -> Result<()> {
        let path = self.kind_path(kind);
        let line = format!("{}\n", key.to_hex());

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        use std::io::Write;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Remove a pin, rewriting the collection file without it.
    pub fn remove(&self, kind: PinKind, key: &Key) -> Result<()> {
        let keys = self.list(kind)?;
        if !keys.contains(key) {
            return Err(Error::not_found(key.to_hex()));
        }
        let remaining: String = keys
            .iter()
            .filter(|k| *k != key)
            .map(|k| format!("{}\n", k.to_hex()))
            .collect();
        fs::write(self.kind_path(kind), remaining)?;
        Ok(())
    }

    /// List a pin collection, first-seen order, duplicates removed.
    pub fn list(&self, kind: PinKind) -> Result<Vec<Key>> {
        let path = self.kind_path(kind);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)?;
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Key::from_hex(line) {
                Ok(key) => {
                    if seen.insert(key) {
                        keys.push(key);
                    }
                }
                Err(_) => continue, // Ignore invalid lines
            }
        }
        Ok(keys)
    }
}

impl Pinner for FilePinner {
    fn recursive_keys(&self) -> Result<Vec<Key>> {
        self.list(PinKind::Recursive)
    }

    fn direct_keys(&self) -> Result<Vec<Key>> {
        self.list(PinKind::Direct)
    }

    fn internal_pins(&self) -> Result<Vec<Key>> {
        self.list(PinKind::Internal)
    }

    fn is_pinned(&self, key: &Key) -> Result<Option<String>> {
        if self.list(PinKind::Direct)?.contains(key) {
            return Ok(Some("direct".to_string()));
        }
        let recursive = self.list(PinKind::Recursive)?;
        if recursive.contains(key) {
            return Ok(Some("recursive".to_string()));
        }
        if self.list(PinKind::Internal)?.contains(key) {
            return Ok(Some("internal".to_string()));
        }
        if let Some(links) = &self.links {
            return Ok(indirect_reason(links.as_ref(), &recursive, key));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::node::{DagNode, StoreLinkService};
    use crate::store::{BlockStore, MemBlockstore};
    use tempfile::TempDir;

    #[test]
    fn test_mem_pinner_sets() {
        let pinner = MemPinner::new();
        let key = Key::hash_bytes(b"pinned");

        pinner.pin(PinKind::Direct, key);
        assert_eq!(pinner.direct_keys().unwrap(), vec![key]);
        assert_eq!(pinner.is_pinned(&key).unwrap(), Some("direct".to_string()));

        assert!(pinner.unpin(PinKind::Direct, &key));
        assert_eq!(pinner.is_pinned(&key).unwrap(), None);
        assert!(!pinner.unpin(PinKind::Direct, &key));
    }

    #[test]
    fn test_mem_pinner_indirect() {
        let store = Arc::new(MemBlockstore::new());

        let leaf = Block::new(b"leaf".to_vec());
        let leaf_key = *leaf.key();
        store.put(leaf).unwrap();

        let root = Block::new(DagNode::new(vec![leaf_key], vec![]).encode());
        let root_key = *root.key();
        store.put(root).unwrap();

        let links = Arc::new(StoreLinkService::new(store as Arc<dyn BlockStore>));
        let pinner = MemPinner::new().with_link_service(links);
        pinner.pin(PinKind::Recursive, root_key);

        let reason = pinner.is_pinned(&leaf_key).unwrap().unwrap();
        assert!(reason.contains("indirect"));
        assert!(reason.contains(&root_key.to_hex()));

        let unrelated = Key::hash_bytes(b"unrelated");
        assert_eq!(pinner.is_pinned(&unrelated).unwrap(), None);
    }

    #[test]
    fn test_file_pinner_add_list_remove() {
        let temp_dir = TempDir::new().unwrap();
        let pinner = FilePinner::open(temp_dir.path()).unwrap();

        let key1 = Key::hash_bytes(b"one");
        let key2 = Key::hash_bytes(b"two");

        pinner.add(PinKind::Recursive, &key1).unwrap();
        pinner.add(PinKind::Recursive, &key2).unwrap();
        pinner.add(PinKind::Recursive, &key1).unwrap(); // duplicate

        assert_eq!(pinner.list(PinKind::Recursive).unwrap(), vec![key1, key2]);

        pinner.remove(PinKind::Recursive, &key1).unwrap();
        assert_eq!(pinner.list(PinKind::Recursive).unwrap(), vec![key2]);

        let err = pinner.remove(PinKind::Recursive, &key1).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_file_pinner_ignores_junk_lines() {
        let temp_dir = TempDir::new().unwrap();
        let pinner = FilePinner::open(temp_dir.path()).unwrap();

        let key = Key::hash_bytes(b"valid");
        fs::write(
            temp_dir.path().join("direct"),
            format!("# comment\n\nnot-a-key\n{}\n", key.to_hex()),
        )
        .unwrap();

        assert_eq!(pinner.list(PinKind::Direct).unwrap(), vec![key]);
        assert_eq!(pinner.is_pinned(&key).unwrap(), Some("direct".to_string()));
    }

    #[test]
    fn test_file_pinner_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let key = Key::hash_bytes(b"durable");

        {
            let pinner = FilePinner::open(temp_dir.path()).unwrap();
            pinner.add(PinKind::Internal, &key).unwrap();
        }

        let pinner = FilePinner::open(temp_dir.path()).unwrap();
        assert_eq!(pinner.internal_pins().unwrap(), vec![key]);
    }
}
