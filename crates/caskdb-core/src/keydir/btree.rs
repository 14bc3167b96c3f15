//! Ordered-tree keydir backend

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::CaskResult;
use crate::format::RecordPosition;

use super::{Keydir, KeydirIter, SnapshotIter};

/// Keydir over a std BTreeMap guarded by a reader-writer lock.
///
/// The default backend: ordered, predictable, nothing on disk.
pub struct BTreeKeydir {
    tree: RwLock<BTreeMap<Vec<u8>, RecordPosition>>,
}

impl BTreeKeydir {
    pub fn new() -> Self {
        Self { tree: RwLock::new(BTreeMap::new()) }
    }
}

impl Default for BTreeKeydir {
    fn default() -> Self {
        Self::new()
    }
}

impl Keydir for BTreeKeydir {
    fn put(&self, key: &[u8], pos: RecordPosition) -> CaskResult<Option<RecordPosition>> {
        Ok(self.tree.write().insert(key.to_vec(), pos))
    }

    fn get(&self, key: &[u8]) -> CaskResult<Option<RecordPosition>> {
        Ok(self.tree.read().get(key).copied())
    }

    fn delete(&self, key: &[u8]) -> CaskResult<(Option<RecordPosition>, bool)> {
        let old = self.tree.write().remove(key);
        let existed = old.is_some();
        Ok((old, existed))
    }

    fn len(&self) -> CaskResult<usize> {
        Ok(self.tree.read().len())
    }

    fn iterator(&self, reverse: bool) -> CaskResult<Box<dyn KeydirIter>> {
        let tree = self.tree.read();
        let entries: Vec<(Vec<u8>, RecordPosition)> = if reverse {
            tree.iter().rev().map(|(k, v)| (k.clone(), *v)).collect()
        } else {
            tree.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        Ok(Box::new(SnapshotIter::new(entries, reverse)))
    }

    fn close(&self) -> CaskResult<()> {
        Ok(())
    }
}
