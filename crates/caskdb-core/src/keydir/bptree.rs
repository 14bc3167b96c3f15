//! On-disk B+ tree keydir backend
//!
//! Positions live in a redb database file (`bptree-index`) inside the data
//! directory, so the index survives restarts and the engine can skip log
//! replay on open. Values are varint-packed record positions.

use std::ops::Bound;
use std::path::{Path, PathBuf};

use redb::{Database, Durability, ReadableTableMetadata, TableDefinition};

use crate::error::{CaskError, CaskResult};
use crate::format::{decode_position, encode_position, RecordPosition};

use super::{Keydir, KeydirIter};

/// File holding the persistent keydir
pub const BPTREE_INDEX_FILE_NAME: &str = "bptree-index";

const KEYDIR_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("keydir");

/// Keydir persisted in a redb B-tree file.
pub struct BPlusTreeKeydir {
    db: Database,
    path: PathBuf,
    sync_writes: bool,
}

impl BPlusTreeKeydir {
    /// Open or create the index file in the data directory.
    pub fn open(dir: &Path, sync_writes: bool) -> CaskResult<Self> {
        let path = dir.join(BPTREE_INDEX_FILE_NAME);
        let db = Database::create(&path).map_err(|e| index_err(&path, e))?;

        // Make sure the table exists so reads on a fresh index succeed
        let txn = db.begin_write().map_err(|e| index_err(&path, e))?;
        txn.open_table(KEYDIR_TABLE).map_err(|e| index_err(&path, e))?;
        txn.commit().map_err(|e| index_err(&path, e))?;

        Ok(Self { db, path, sync_writes })
    }
}

fn index_err<E: std::fmt::Display>(path: &Path, e: E) -> CaskError {
    CaskError::Io {
        path: Some(path.to_path_buf()),
        kind: std::io::ErrorKind::Other,
        message: format!("bptree index error: {}", e),
    }
}

impl Keydir for BPlusTreeKeydir {
    fn put(&self, key: &[u8], pos: RecordPosition) -> CaskResult<Option<RecordPosition>> {
        let mut txn = self.db.begin_write().map_err(|e| index_err(&self.path, e))?;
        if !self.sync_writes {
            txn.set_durability(Durability::Eventual);
        }
        let old = {
            let mut table = txn.open_table(KEYDIR_TABLE).map_err(|e| index_err(&self.path, e))?;
            let encoded = encode_position(&pos);
            let guard = table
                .insert(key, encoded.as_slice())
                .map_err(|e| index_err(&self.path, e))?;
            match guard {
                Some(g) => Some(decode_position(g.value())?),
                None => None,
            }
        };
        txn.commit().map_err(|e| index_err(&self.path, e))?;
        Ok(old)
    }

    fn get(&self, key: &[u8]) -> CaskResult<Option<RecordPosition>> {
        let txn = self.db.begin_read().map_err(|e| index_err(&self.path, e))?;
        let table = txn.open_table(KEYDIR_TABLE).map_err(|e| index_err(&self.path, e))?;
        match table.get(key).map_err(|e| index_err(&self.path, e))? {
            Some(g) => Ok(Some(decode_position(g.value())?)),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &[u8]) -> CaskResult<(Option<RecordPosition>, bool)> {
        let mut txn = self.db.begin_write().map_err(|e| index_err(&self.path, e))?;
        if !self.sync_writes {
            txn.set_durability(Durability::Eventual);
        }
        let old = {
            let mut table = txn.open_table(KEYDIR_TABLE).map_err(|e| index_err(&self.path, e))?;
            let guard = table.remove(key).map_err(|e| index_err(&self.path, e))?;
            match guard {
                Some(g) => Some(decode_position(g.value())?),
                None => None,
            }
        };
        txn.commit().map_err(|e| index_err(&self.path, e))?;
        let existed = old.is_some();
        Ok((old, existed))
    }

    fn len(&self) -> CaskResult<usize> {
        let txn = self.db.begin_read().map_err(|e| index_err(&self.path, e))?;
        let table = txn.open_table(KEYDIR_TABLE).map_err(|e| index_err(&self.path, e))?;
        let len = table.len().map_err(|e| index_err(&self.path, e))?;
        Ok(len as usize)
    }

    fn iterator(&self, reverse: bool) -> CaskResult<Box<dyn KeydirIter>> {
        let txn = self.db.begin_read().map_err(|e| index_err(&self.path, e))?;
        let table = txn.open_table(KEYDIR_TABLE).map_err(|e| index_err(&self.path, e))?;
        let mut iter = BPlusTreeIter { _txn: txn, table, reverse, current: None };
        iter.rewind();
        Ok(Box::new(iter))
    }

    fn close(&self) -> CaskResult<()> {
        // Committed transactions are already on disk; dropping releases the file
        Ok(())
    }
}

/// Cursor over the persistent keydir.
///
/// Holds its read transaction open for its whole lifetime, so the cursor
/// sees one consistent version of the tree regardless of concurrent
/// writes. Each positioning operation is a bounded range query against
/// that version.
struct BPlusTreeIter {
    _txn: redb::ReadTransaction,
    table: redb::ReadOnlyTable<&'static [u8], &'static [u8]>,
    reverse: bool,
    current: Option<(Vec<u8>, RecordPosition)>,
}

impl BPlusTreeIter {
    fn edge(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        from_back: bool,
    ) -> Option<(Vec<u8>, RecordPosition)> {
        let mut range = self.table.range::<&[u8]>((lower, upper)).ok()?;
        let item = if from_back { range.next_back() } else { range.next() };
        let (k, v) = item?.ok()?;
        let pos = decode_position(v.value()).ok()?;
        Some((k.value().to_vec(), pos))
    }
}

impl KeydirIter for BPlusTreeIter {
    fn rewind(&mut self) {
        self.current = self.edge(Bound::Unbounded, Bound::Unbounded, self.reverse);
    }

    fn seek(&mut self, key: &[u8]) {
        self.current = if self.reverse {
            self.edge(Bound::Unbounded, Bound::Included(key), true)
        } else {
            self.edge(Bound::Included(key), Bound::Unbounded, false)
        };
    }

    fn next(&mut self) {
        let Some((key, _)) = self.current.take() else { return };
        self.current = if self.reverse {
            self.edge(Bound::Unbounded, Bound::Excluded(key.as_slice()), true)
        } else {
            self.edge(Bound::Excluded(key.as_slice()), Bound::Unbounded, false)
        };
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator cursor is not valid").0
    }

    fn value(&self) -> RecordPosition {
        self.current.as_ref().expect("iterator cursor is not valid").1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pos(offset: u64) -> RecordPosition {
        RecordPosition { file_id: 1, offset, size: 20 }
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let keydir = BPlusTreeKeydir::open(dir.path(), false).unwrap();

        assert_eq!(keydir.put(b"k", pos(0)).unwrap(), None);
        assert_eq!(keydir.put(b"k", pos(64)).unwrap(), Some(pos(0)));
        assert_eq!(keydir.get(b"k").unwrap(), Some(pos(64)));

        let (old, existed) = keydir.delete(b"k").unwrap();
        assert_eq!(old, Some(pos(64)));
        assert!(existed);
        let (_, existed) = keydir.delete(b"k").unwrap();
        assert!(!existed);
        assert_eq!(keydir.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let keydir = BPlusTreeKeydir::open(dir.path(), true).unwrap();
            keydir.put(b"persisted", pos(128)).unwrap();
            keydir.close().unwrap();
        }

        let keydir = BPlusTreeKeydir::open(dir.path(), true).unwrap();
        assert_eq!(keydir.get(b"persisted").unwrap(), Some(pos(128)));
        assert_eq!(keydir.len().unwrap(), 1);
        assert!(dir.path().join(BPTREE_INDEX_FILE_NAME).exists());
    }

    #[test]
    fn test_iterator_order_and_seek() {
        let dir = TempDir::new().unwrap();
        let keydir = BPlusTreeKeydir::open(dir.path(), false).unwrap();
        for key in [b"cc".as_ref(), b"aa".as_ref(), b"bb".as_ref()] {
            keydir.put(key, pos(0)).unwrap();
        }

        let mut it = keydir.iterator(false).unwrap();
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(it.key().to_vec());
            it.next();
        }
        assert_eq!(keys, vec![b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()]);

        let mut it = keydir.iterator(true).unwrap();
        it.seek(b"bz");
        assert_eq!(it.key(), b"bb");
        it.next();
        assert_eq!(it.key(), b"aa");
        it.next();
        assert!(!it.valid());
    }

    #[test]
    fn test_iterator_pins_its_version() {
        let dir = TempDir::new().unwrap();
        let keydir = BPlusTreeKeydir::open(dir.path(), false).unwrap();
        keydir.put(b"old", pos(0)).unwrap();

        let mut it = keydir.iterator(false).unwrap();
        keydir.put(b"new", pos(1)).unwrap();

        let mut keys = Vec::new();
        while it.valid() {
            keys.push(it.key().to_vec());
            it.next();
        }
        assert_eq!(keys, vec![b"old".to_vec()]);
    }
}
