//! Radix-tree keydir backend

use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};

use crate::error::CaskResult;
use crate::format::RecordPosition;

use super::{Keydir, KeydirIter, SnapshotIter};

/// Keydir over a radix trie guarded by a reader-writer lock.
///
/// Shares key prefixes structurally, which pays off for workloads with
/// long common prefixes (namespaced keys).
pub struct RadixKeydir {
    tree: RwLock<Trie<Vec<u8>, RecordPosition>>,
}

impl RadixKeydir {
    pub fn new() -> Self {
        Self { tree: RwLock::new(Trie::new()) }
    }
}

impl Default for RadixKeydir {
    fn default() -> Self {
        Self::new()
    }
}

impl Keydir for RadixKeydir {
    fn put(&self, key: &[u8], pos: RecordPosition) -> CaskResult<Option<RecordPosition>> {
        Ok(self.tree.write().insert(key.to_vec(), pos))
    }

    fn get(&self, key: &[u8]) -> CaskResult<Option<RecordPosition>> {
        Ok(self.tree.read().get(&key.to_vec()).copied())
    }

    fn delete(&self, key: &[u8]) -> CaskResult<(Option<RecordPosition>, bool)> {
        let old = self.tree.write().remove(&key.to_vec());
        let existed = old.is_some();
        Ok((old, existed))
    }

    fn len(&self) -> CaskResult<usize> {
        Ok(self.tree.read().len())
    }

    fn iterator(&self, reverse: bool) -> CaskResult<Box<dyn KeydirIter>> {
        let tree = self.tree.read();
        let mut entries: Vec<(Vec<u8>, RecordPosition)> =
            tree.iter().map(|(k, v)| (k.clone(), *v)).collect();
        if reverse {
            entries.reverse();
        }
        Ok(Box::new(SnapshotIter::new(entries, reverse)))
    }

    fn close(&self) -> CaskResult<()> {
        Ok(())
    }
}
