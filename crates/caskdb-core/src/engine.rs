//! Core storage engine — the heart of CaskDB.
//!
//! CaskEngine combines append-only data files with an in-memory keydir.
//! Writes append an encoded record to the single active file and then point
//! the keydir at it; reads consult the keydir and fetch the record with one
//! positional read. On open the engine rebuilds the keydir by replaying the
//! log (or loading the hint file a merge left behind).
//!
//! **Write path**: disk first, keydir second; the keydir never references
//! bytes that are not in the log.
//! **Read path**: keydir lookup, then one read at the recorded offset.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fs2::FileExt;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::batch::{key_with_seq, parse_record_key, NON_TXN_SEQ};
use crate::blockfile::IoKind;
use crate::config::{Config, IndexType};
use crate::datafile::{self, DataFile, HINT_FILE_NAME, SEQ_NUM_FILE_NAME};
use crate::error::{CaskError, CaskResult};
use crate::format::{
    decode_position, encode_record, LogRecord, RecordPosition, RecordType,
};
use crate::fsutil;
use crate::keydir::{new_keydir, Keydir};
use crate::merge;

/// Advisory lock file guarding the directory against a second process
pub const LOCK_FILE_NAME: &str = "flock";

/// The open data files: one active append target plus frozen read-only files.
pub(crate) struct FileSet {
    pub(crate) active: Option<DataFile>,
    pub(crate) frozen: HashMap<u32, Arc<DataFile>>,
    /// Bytes appended since the last sync, drives bytes_per_sync
    pub(crate) bytes_write: u64,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct Stat {
    /// Live keys in the keydir
    pub key_num: usize,
    /// Open data files, active included
    pub data_file_num: usize,
    /// Bytes a merge could reclaim
    pub reclaimable_size: u64,
    /// Bytes the data directory occupies on disk
    pub disk_size: u64,
}

/// Bitcask-model storage engine instance.
///
/// All public methods take `&self`; readers run concurrently under the
/// read side of the file lock while writers serialize on the write side.
pub struct CaskEngine {
    pub(crate) config: Config,
    pub(crate) files: RwLock<FileSet>,
    pub(crate) keydir: Box<dyn Keydir>,
    /// Last allocated transaction sequence number
    pub(crate) seq_num: AtomicU64,
    /// Set for the lifetime of a merge; only one may run
    pub(crate) merging: AtomicBool,
    /// Bytes in the log superseded or tombstoned since the last merge
    pub(crate) reclaim_size: AtomicU64,
    /// Whether a seq-num file was consumed at open (B+ tree keydir)
    pub(crate) seq_file_exists: bool,
    /// Whether this open initialized the data directory
    pub(crate) is_initial: bool,
    lock_file: std::fs::File,
}

impl CaskEngine {
    /// Open or create a store in the configured directory.
    ///
    /// Acquires the directory lock, applies a pending merge swap, then
    /// rebuilds the keydir: from the persistent B+ tree index, or from the
    /// hint file plus a replay of every data file at or above the merge
    /// boundary.
    pub fn open(config: Config) -> CaskResult<CaskEngine> {
        config.validate()?;
        let dir = config.dir_path.clone();

        if !dir.is_dir() {
            std::fs::create_dir_all(&dir).map_err(|e| CaskError::Io {
                path: Some(dir.clone()),
                kind: e.kind(),
                message: format!("failed to create data directory: {}", e),
            })?;
        }
        let is_initial = fsutil::dir_is_empty(&dir, &[LOCK_FILE_NAME])?;

        let lock_path = dir.join(LOCK_FILE_NAME);
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| CaskError::Io {
                path: Some(lock_path.clone()),
                kind: e.kind(),
                message: format!("failed to open lock file: {}", e),
            })?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| CaskError::DatabaseInUse { path: dir.clone() })?;

        // A finished merge left in the scratch directory is swapped in
        // before anything reads the data files
        merge::apply_pending_merge(&dir)?;

        let keydir = new_keydir(config.index_type, &dir, config.sync_writes)?;

        let mut engine = CaskEngine {
            files: RwLock::new(FileSet {
                active: None,
                frozen: HashMap::new(),
                bytes_write: 0,
            }),
            keydir,
            seq_num: AtomicU64::new(NON_TXN_SEQ),
            merging: AtomicBool::new(false),
            reclaim_size: AtomicU64::new(0),
            seq_file_exists: false,
            is_initial,
            lock_file,
            config,
        };

        let file_ids = engine.load_data_files()?;

        if engine.config.index_type == IndexType::BPlusTree {
            // The persistent index already holds every key; no replay.
            engine.load_seq_num()?;
            engine.load_index_from_hint_file(true)?;
            let mut files = engine.files.write();
            if let Some(active) = files.active.as_mut() {
                active.write_off = active.size()?;
            }
        } else {
            engine.load_index_from_hint_file(false)?;
            engine.load_index_from_data_files(&file_ids)?;
        }

        if engine.config.mmap_at_startup {
            engine.reset_io_kind()?;
        }

        // Replay may have stopped before the physical end of the active file
        // (torn tail). Appends always land at the physical end, so the torn
        // bytes must go or the keydir and the file would disagree.
        {
            let mut files = engine.files.write();
            if let Some(active) = files.active.as_mut() {
                let size = active.size()?;
                if active.write_off < size {
                    log::warn!(
                        "truncating torn tail of data file {:09}: {} -> {} bytes",
                        active.file_id,
                        size,
                        active.write_off
                    );
                    let keep = active.write_off;
                    active.truncate(keep)?;
                }
            }
        }

        log::info!(
            "opened {} with {} data file(s), {} live key(s)",
            engine.config.dir_path.display(),
            file_ids.len(),
            engine.keydir.len()?
        );
        Ok(engine)
    }

    /// Store a key-value pair. Neither side may be empty.
    pub fn put(&self, key: &[u8], value: &[u8]) -> CaskResult<()> {
        if key.is_empty() {
            return Err(CaskError::KeyEmpty);
        }
        if value.is_empty() {
            return Err(CaskError::ValueEmpty);
        }

        let record = LogRecord {
            key: key_with_seq(key, NON_TXN_SEQ),
            value: value.to_vec(),
            rec_type: RecordType::Normal,
        };

        let pos = {
            let mut files = self.files.write();
            self.append_record(&mut files, &record)?
        };

        if let Some(old) = self.keydir.put(key, pos)? {
            self.reclaim_size.fetch_add(old.size, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Fetch the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> CaskResult<Vec<u8>> {
        if key.is_empty() {
            return Err(CaskError::KeyEmpty);
        }

        let pos = self.keydir.get(key)?.ok_or(CaskError::KeyNotFound)?;
        let files = self.files.read();
        self.read_value_at(&files, &pos)
    }

    /// Remove `key`. Removing an absent key succeeds without writing a
    /// tombstone, so repeated deletes do not grow the log.
    pub fn delete(&self, key: &[u8]) -> CaskResult<()> {
        if key.is_empty() {
            return Err(CaskError::KeyEmpty);
        }
        if self.keydir.get(key)?.is_none() {
            return Ok(());
        }

        let record = LogRecord {
            key: key_with_seq(key, NON_TXN_SEQ),
            value: Vec::new(),
            rec_type: RecordType::Deleted,
        };
        let pos = {
            let mut files = self.files.write();
            self.append_record(&mut files, &record)?
        };
        // The tombstone itself is dead weight from birth
        self.reclaim_size.fetch_add(pos.size, Ordering::Relaxed);

        let (old, existed) = self.keydir.delete(key)?;
        if !existed {
            return Err(CaskError::IndexUpdateFailed);
        }
        if let Some(old) = old {
            self.reclaim_size.fetch_add(old.size, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Flush the active file to persistent storage.
    pub fn sync(&self) -> CaskResult<()> {
        let files = self.files.write();
        if let Some(active) = &files.active {
            active.sync()?;
        }
        Ok(())
    }

    /// Close the store: flush files, persist the sequence number when the
    /// B+ tree keydir is in use, and release the directory lock.
    pub fn close(&self) -> CaskResult<()> {
        self.keydir.close()?;

        let mut files = self.files.write();
        if files.active.is_none() {
            return self.unlock_dir();
        }

        if self.config.index_type == IndexType::BPlusTree {
            // The only cross-run home of the sequence counter for this backend
            let mut seq_file = DataFile::open_seq_num_file(&self.config.dir_path)?;
            let record = LogRecord {
                key: SEQ_NUM_FILE_NAME.as_bytes().to_vec(),
                value: self.seq_num.load(Ordering::SeqCst).to_string().into_bytes(),
                rec_type: RecordType::Normal,
            };
            let (encoded, _) = encode_record(&record);
            seq_file.append(&encoded)?;
            seq_file.sync()?;
        }

        if let Some(active) = &files.active {
            active.sync()?;
        }
        files.active = None;
        files.frozen.clear();

        self.unlock_dir()
    }

    /// Engine statistics: live keys, file count, reclaimable bytes, disk use.
    pub fn stat(&self) -> CaskResult<Stat> {
        let files = self.files.read();
        let mut data_file_num = files.frozen.len();
        if files.active.is_some() {
            data_file_num += 1;
        }
        Ok(Stat {
            key_num: self.keydir.len()?,
            data_file_num,
            reclaimable_size: self.reclaim_size.load(Ordering::Relaxed),
            disk_size: fsutil::dir_size(&self.config.dir_path)?,
        })
    }

    /// Copy the data directory into `target_dir`, skipping the lock file.
    pub fn backup(&self, target_dir: &Path) -> CaskResult<()> {
        let _files = self.files.read();
        fsutil::copy_dir(&self.config.dir_path, target_dir, &[LOCK_FILE_NAME])
    }

    /// All keys, in ascending order.
    pub fn list_keys(&self) -> CaskResult<Vec<Vec<u8>>> {
        let mut iter = self.keydir.iterator(false)?;
        let mut keys = Vec::with_capacity(self.keydir.len()?);
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next();
        }
        Ok(keys)
    }

    /// Visit every key-value pair in ascending key order until `f` returns
    /// false. Holds the read side of the engine lock for the whole walk.
    pub fn fold<F>(&self, mut f: F) -> CaskResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let files = self.files.read();
        let mut iter = self.keydir.iterator(false)?;
        while iter.valid() {
            let value = self.read_value_at(&files, &iter.value())?;
            if !f(iter.key(), &value) {
                break;
            }
            iter.next();
        }
        Ok(())
    }

    /// Read and decode the value a keydir position points at.
    pub(crate) fn read_value_at(
        &self,
        files: &FileSet,
        pos: &RecordPosition,
    ) -> CaskResult<Vec<u8>> {
        let read = match &files.active {
            Some(active) if active.file_id == pos.file_id => active.read_record(pos.offset)?,
            _ => {
                let frozen = files
                    .frozen
                    .get(&pos.file_id)
                    .ok_or(CaskError::DataFileNotFound { file_id: pos.file_id })?;
                frozen.read_record(pos.offset)?
            }
        };

        let (record, _) = read.ok_or_else(|| CaskError::DataDirCorrupted {
            path: datafile::data_file_path(&self.config.dir_path, pos.file_id),
            reason: format!("keydir points past the end of the file (offset {})", pos.offset),
        })?;

        if record.rec_type == RecordType::Deleted {
            return Err(CaskError::KeyNotFound);
        }
        Ok(record.value)
    }

    /// Append an encoded record to the active file. Callers hold the write
    /// side of the engine lock.
    pub(crate) fn append_record(
        &self,
        files: &mut FileSet,
        record: &LogRecord,
    ) -> CaskResult<RecordPosition> {
        if files.active.is_none() {
            files.active = Some(DataFile::open(&self.config.dir_path, 0, IoKind::Standard)?);
        }

        let (encoded, size) = encode_record(record);

        // A record never spans two files
        if files.active.as_ref().unwrap().write_off + size > self.config.data_file_size {
            self.freeze_active(files)?;
        }

        let active = files.active.as_mut().unwrap();
        let write_off = active.write_off;
        active.append(&encoded)?;
        files.bytes_write += size;

        let need_sync = self.config.sync_writes
            || (self.config.bytes_per_sync > 0
                && files.bytes_write >= self.config.bytes_per_sync);
        if need_sync {
            files.active.as_ref().unwrap().sync()?;
            files.bytes_write = 0;
        }

        Ok(RecordPosition {
            file_id: files.active.as_ref().unwrap().file_id,
            offset: write_off,
            size,
        })
    }

    /// Sync the active file, move it into the frozen set, and open its
    /// successor. Callers hold the write side of the engine lock.
    pub(crate) fn freeze_active(&self, files: &mut FileSet) -> CaskResult<()> {
        if let Some(active) = files.active.take() {
            active.sync()?;
            let next_id = active.file_id + 1;
            files.frozen.insert(active.file_id, Arc::new(active));
            files.active =
                Some(DataFile::open(&self.config.dir_path, next_id, IoKind::Standard)?);
        }
        Ok(())
    }

    fn unlock_dir(&self) -> CaskResult<()> {
        self.lock_file.unlock().map_err(|e| CaskError::Io {
            path: Some(self.config.dir_path.join(LOCK_FILE_NAME)),
            kind: e.kind(),
            message: format!("failed to release directory lock: {}", e),
        })
    }

    /// Open every data file in the directory; the highest id is the active
    /// file, the rest are frozen.
    fn load_data_files(&mut self) -> CaskResult<Vec<u32>> {
        let ids = datafile::list_data_file_ids(&self.config.dir_path)?;
        let kind = if self.config.mmap_at_startup {
            IoKind::MmapReadOnly
        } else {
            IoKind::Standard
        };

        let mut files = self.files.write();
        for (i, &id) in ids.iter().enumerate() {
            let data_file = DataFile::open(&self.config.dir_path, id, kind)?;
            if i == ids.len() - 1 {
                files.active = Some(data_file);
            } else {
                files.frozen.insert(id, Arc::new(data_file));
            }
        }
        Ok(ids)
    }

    /// Install positions from the hint file a merge wrote.
    ///
    /// With a fresh in-memory keydir every hint record is authoritative.
    /// With the persistent B+ tree keydir only keys still pointing below
    /// the merge boundary are re-pointed; keys rewritten or deleted after
    /// the merge keep their newer state.
    fn load_index_from_hint_file(&mut self, only_below_boundary: bool) -> CaskResult<()> {
        let hint_path = self.config.dir_path.join(HINT_FILE_NAME);
        if !hint_path.exists() {
            return Ok(());
        }

        let boundary = if only_below_boundary {
            merge::non_merge_boundary(&self.config.dir_path)?.unwrap_or(0)
        } else {
            0
        };

        let hint = DataFile::open_hint_file(&self.config.dir_path)?;
        let mut offset = 0u64;
        while let Some((record, size)) = hint.read_record(offset)? {
            let pos = decode_position(&record.value)?;
            if only_below_boundary {
                if let Some(current) = self.keydir.get(&record.key)? {
                    if current.file_id < boundary {
                        self.keydir.put(&record.key, pos)?;
                    }
                }
            } else {
                self.keydir.put(&record.key, pos)?;
            }
            offset += size;
        }
        Ok(())
    }

    /// Rebuild the keydir by replaying every data file at or above the
    /// merge boundary, honoring transaction terminators.
    fn load_index_from_data_files(&mut self, file_ids: &[u32]) -> CaskResult<()> {
        if file_ids.is_empty() {
            return Ok(());
        }

        let boundary = merge::non_merge_boundary(&self.config.dir_path)?.unwrap_or(0);

        // Records of an open transaction wait here until its terminator
        let mut pending: HashMap<u64, Vec<(Vec<u8>, RecordType, RecordPosition)>> =
            HashMap::new();
        let mut max_seq = NON_TXN_SEQ;

        let mut files = self.files.write();
        for (i, &file_id) in file_ids.iter().enumerate() {
            if file_id < boundary {
                // Everything below the boundary was loaded from the hint file
                continue;
            }
            let is_active = i == file_ids.len() - 1;

            let mut offset = 0u64;
            loop {
                let file: &DataFile = if is_active {
                    files.active.as_ref().expect("active file is open during replay")
                } else {
                    files
                        .frozen
                        .get(&file_id)
                        .map(|shared| shared.as_ref())
                        .ok_or(CaskError::DataFileNotFound { file_id })?
                };

                let Some((record, size)) = file.read_record(offset)? else {
                    break;
                };
                let pos = RecordPosition { file_id, offset, size };
                let (real_key, seq) = parse_record_key(&record.key).map_err(|_| {
                    CaskError::DataDirCorrupted {
                        path: datafile::data_file_path(&self.config.dir_path, file_id),
                        reason: format!("record key at offset {} has no seq prefix", offset),
                    }
                })?;

                if seq == NON_TXN_SEQ {
                    self.apply_replayed_record(&real_key, record.rec_type, pos)?;
                } else if record.rec_type == RecordType::TxnFinished {
                    // The terminator commits everything buffered for this seq
                    if let Some(bucket) = pending.remove(&seq) {
                        for (key, rec_type, pos) in bucket {
                            self.apply_replayed_record(&key, rec_type, pos)?;
                        }
                    }
                } else {
                    pending.entry(seq).or_default().push((real_key, record.rec_type, pos));
                }

                if seq > max_seq {
                    max_seq = seq;
                }
                offset += size;
            }

            if is_active {
                files.active.as_mut().unwrap().write_off = offset;
            }
        }

        if !pending.is_empty() {
            log::warn!(
                "discarded {} unfinished transaction(s) found during replay",
                pending.len()
            );
        }

        self.seq_num.store(max_seq, Ordering::SeqCst);
        Ok(())
    }

    fn apply_replayed_record(
        &self,
        key: &[u8],
        rec_type: RecordType,
        pos: RecordPosition,
    ) -> CaskResult<()> {
        let old = match rec_type {
            RecordType::Normal => self.keydir.put(key, pos)?,
            RecordType::Deleted => {
                self.reclaim_size.fetch_add(pos.size, Ordering::Relaxed);
                self.keydir.delete(key)?.0
            }
            RecordType::TxnFinished => None,
        };
        if let Some(old) = old {
            self.reclaim_size.fetch_add(old.size, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Load the persisted sequence number (B+ tree keydir only) and delete
    /// the file; it is rewritten on the next clean close.
    fn load_seq_num(&mut self) -> CaskResult<()> {
        let path = self.config.dir_path.join(SEQ_NUM_FILE_NAME);
        if !path.exists() {
            return Ok(());
        }

        let seq_file = DataFile::open_seq_num_file(&self.config.dir_path)?;
        let (record, _) =
            seq_file.read_record(0)?.ok_or_else(|| CaskError::DataDirCorrupted {
                path: path.clone(),
                reason: "seq-num file holds no record".to_string(),
            })?;
        if record.key != SEQ_NUM_FILE_NAME.as_bytes() {
            return Err(CaskError::DataDirCorrupted {
                path: path.clone(),
                reason: "seq-num record carries the wrong key".to_string(),
            });
        }

        let seq = std::str::from_utf8(&record.value)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| CaskError::DataDirCorrupted {
                path: path.clone(),
                reason: "seq-num value is not a decimal number".to_string(),
            })?;

        self.seq_num.store(seq, Ordering::SeqCst);
        self.seq_file_exists = true;

        std::fs::remove_file(&path).map_err(|e| CaskError::Io {
            path: Some(path),
            kind: e.kind(),
            message: format!("failed to remove consumed seq-num file: {}", e),
        })?;
        Ok(())
    }

    /// Swap every mmap handle back to standard I/O after recovery.
    fn reset_io_kind(&self) -> CaskResult<()> {
        let mut files = self.files.write();
        if let Some(active) = files.active.as_mut() {
            active.set_io_kind(IoKind::Standard)?;
        }

        let frozen = std::mem::take(&mut files.frozen);
        for (id, data_file) in frozen {
            match Arc::try_unwrap(data_file) {
                Ok(mut data_file) => {
                    data_file.set_io_kind(IoKind::Standard)?;
                    files.frozen.insert(id, Arc::new(data_file));
                }
                Err(shared) => {
                    files.frozen.insert(id, shared);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    pub(crate) fn test_config(dir: &std::path::Path) -> Config {
        Config {
            dir_path: dir.to_path_buf(),
            data_file_size: 4 * 1024 * 1024,
            sync_writes: false,
            bytes_per_sync: 0,
            index_type: IndexType::BTree,
            mmap_at_startup: false,
            data_file_merge_ratio: 0.0,
        }
    }

    #[test]
    fn test_put_get_delete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let engine = CaskEngine::open(test_config(dir.path())).unwrap();

        engine.put(b"name", b"bitcask").unwrap();
        assert_eq!(engine.get(b"name").unwrap(), b"bitcask");

        engine.delete(b"name").unwrap();
        assert!(matches!(engine.get(b"name"), Err(CaskError::KeyNotFound)));
    }

    #[test]
    fn test_empty_key_and_value_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = CaskEngine::open(test_config(dir.path())).unwrap();

        assert!(matches!(engine.put(b"", b"v"), Err(CaskError::KeyEmpty)));
        assert!(matches!(engine.put(b"k", b""), Err(CaskError::ValueEmpty)));
        assert!(matches!(engine.get(b""), Err(CaskError::KeyEmpty)));
        assert!(matches!(engine.delete(b""), Err(CaskError::KeyEmpty)));
    }

    #[test]
    fn test_delete_absent_key_is_noop() {
        let dir = TempDir::new().unwrap();
        let engine = CaskEngine::open(test_config(dir.path())).unwrap();

        engine.delete(b"never-existed").unwrap();
        let stat = engine.stat().unwrap();
        // No tombstone was written, so nothing is reclaimable
        assert_eq!(stat.reclaimable_size, 0);
        assert_eq!(stat.data_file_num, 0);
    }

    #[test]
    fn test_overwrite_law() {
        let dir = TempDir::new().unwrap();
        let engine = CaskEngine::open(test_config(dir.path())).unwrap();

        engine.put(b"k", b"v1").unwrap();
        let first_size = {
            let files = engine.files.read();
            files.active.as_ref().unwrap().write_off
        };
        engine.put(b"k", b"v2").unwrap();

        assert_eq!(engine.get(b"k").unwrap(), b"v2");
        assert_eq!(engine.reclaim_size.load(Ordering::Relaxed), first_size);
    }

    #[test]
    fn test_rotation_keeps_everything_readable() {
        let dir = TempDir::new().unwrap();
        let config = Config { data_file_size: 64, ..test_config(dir.path()) };
        let engine = CaskEngine::open(config).unwrap();

        for i in 0..10u32 {
            engine.put(format!("key-{:03}", i).as_bytes(), b"ten-bytes!").unwrap();
        }

        let stat = engine.stat().unwrap();
        assert!(stat.data_file_num >= 2, "expected rotation, got {} file(s)", stat.data_file_num);
        for i in 0..10u32 {
            assert_eq!(engine.get(format!("key-{:03}", i).as_bytes()).unwrap(), b"ten-bytes!");
        }
    }

    #[test]
    fn test_reopen_matches_pre_close_state() {
        let dir = TempDir::new().unwrap();
        let keys_before;
        {
            let engine = CaskEngine::open(test_config(dir.path())).unwrap();
            for i in 0..100u32 {
                engine
                    .put(format!("key-{:04}", i).as_bytes(), format!("val-{:04}", i).as_bytes())
                    .unwrap();
            }
            engine.delete(b"key-0042").unwrap();
            keys_before = engine.list_keys().unwrap();
            engine.close().unwrap();
        }

        let engine = CaskEngine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.list_keys().unwrap(), keys_before);
        assert_eq!(engine.stat().unwrap().key_num, 99);
        for i in 0..100u32 {
            let key = format!("key-{:04}", i);
            if key == "key-0042" {
                assert!(matches!(engine.get(key.as_bytes()), Err(CaskError::KeyNotFound)));
            } else {
                assert_eq!(engine.get(key.as_bytes()).unwrap(), format!("val-{:04}", i).as_bytes());
            }
        }
    }

    #[test]
    fn test_crash_reopen_without_close() {
        let dir = TempDir::new().unwrap();
        {
            let engine = CaskEngine::open(test_config(dir.path())).unwrap();
            engine.put(b"survives", b"yes").unwrap();
            // Dropped without close: the crash case
        }
        let engine = CaskEngine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.get(b"survives").unwrap(), b"yes");
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let _engine = CaskEngine::open(test_config(dir.path())).unwrap();
        assert!(matches!(
            CaskEngine::open(test_config(dir.path())),
            Err(CaskError::DatabaseInUse { .. })
        ));
    }

    #[test]
    fn test_close_releases_the_lock() {
        let dir = TempDir::new().unwrap();
        let engine = CaskEngine::open(test_config(dir.path())).unwrap();
        engine.put(b"k", b"v").unwrap();
        engine.close().unwrap();

        let engine = CaskEngine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), b"v");
    }

    #[test]
    fn test_torn_tail_drops_only_the_last_record() {
        let dir = TempDir::new().unwrap();
        {
            let engine = CaskEngine::open(test_config(dir.path())).unwrap();
            engine.put(b"first", b"value-1").unwrap();
            engine.put(b"second", b"value-2").unwrap();
            engine.put(b"third", b"value-3").unwrap();
            engine.close().unwrap();
        }

        // Flip a byte inside the last record
        let path = datafile::data_file_path(dir.path(), 0);
        let len = std::fs::metadata(&path).unwrap().len();
        let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(len - 1)).unwrap();
        f.write_all(&[0xFF]).unwrap();
        drop(f);

        {
            let engine = CaskEngine::open(test_config(dir.path())).unwrap();
            assert_eq!(engine.get(b"first").unwrap(), b"value-1");
            assert_eq!(engine.get(b"second").unwrap(), b"value-2");
            assert!(matches!(engine.get(b"third"), Err(CaskError::KeyNotFound)));

            // The torn bytes were cut off, so new appends line up again
            engine.put(b"fourth", b"value-4").unwrap();
            engine.close().unwrap();
        }

        let engine = CaskEngine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.get(b"second").unwrap(), b"value-2");
        assert_eq!(engine.get(b"fourth").unwrap(), b"value-4");
    }

    #[test]
    fn test_mid_file_corruption_fails_open() {
        let dir = TempDir::new().unwrap();
        let second_offset;
        {
            let engine = CaskEngine::open(test_config(dir.path())).unwrap();
            engine.put(b"first", b"value-1").unwrap();
            second_offset = engine.files.read().active.as_ref().unwrap().write_off;
            engine.put(b"second", b"value-2").unwrap();
            engine.put(b"third", b"value-3").unwrap();
            engine.close().unwrap();
        }

        // Flip the last value byte of the middle record
        let path = datafile::data_file_path(dir.path(), 0);
        let third_offset = {
            let file = DataFile::open(dir.path(), 0, IoKind::Standard).unwrap();
            let (_, size) = file.read_record(second_offset).unwrap().unwrap();
            second_offset + size
        };
        let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(third_offset - 1)).unwrap();
        f.write_all(&[0xAA]).unwrap();
        drop(f);

        assert!(matches!(
            CaskEngine::open(test_config(dir.path())),
            Err(CaskError::InvalidCrc { .. })
        ));
    }

    #[test]
    fn test_list_keys_and_fold() {
        let dir = TempDir::new().unwrap();
        let engine = CaskEngine::open(test_config(dir.path())).unwrap();
        engine.put(b"b", b"2").unwrap();
        engine.put(b"a", b"1").unwrap();
        engine.put(b"c", b"3").unwrap();

        assert_eq!(
            engine.list_keys().unwrap(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );

        let mut visited = Vec::new();
        engine
            .fold(|key, value| {
                visited.push((key.to_vec(), value.to_vec()));
                key != b"b"
            })
            .unwrap();
        assert_eq!(
            visited,
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]
        );
    }

    #[test]
    fn test_backup_excludes_lock_file() {
        let dir = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let engine = CaskEngine::open(test_config(dir.path())).unwrap();
        engine.put(b"carry", b"over").unwrap();
        engine.sync().unwrap();

        let backup_dir = target.path().join("backup");
        engine.backup(&backup_dir).unwrap();
        engine.close().unwrap();

        assert!(!backup_dir.join(LOCK_FILE_NAME).exists());
        let restored = CaskEngine::open(test_config(&backup_dir)).unwrap();
        assert_eq!(restored.get(b"carry").unwrap(), b"over");
    }

    #[test]
    fn test_mmap_at_startup_recovery() {
        let dir = TempDir::new().unwrap();
        {
            let engine = CaskEngine::open(test_config(dir.path())).unwrap();
            for i in 0..50u32 {
                engine.put(format!("key-{}", i).as_bytes(), b"value").unwrap();
            }
            engine.close().unwrap();
        }

        let config = Config { mmap_at_startup: true, ..test_config(dir.path()) };
        let engine = CaskEngine::open(config).unwrap();
        assert_eq!(engine.stat().unwrap().key_num, 50);
        // Handles were reset to standard, so writes keep working
        engine.put(b"after-mmap", b"works").unwrap();
        assert_eq!(engine.get(b"after-mmap").unwrap(), b"works");
    }

    #[test]
    fn test_bptree_index_skips_replay_and_persists() {
        let dir = TempDir::new().unwrap();
        let config = Config { index_type: IndexType::BPlusTree, ..test_config(dir.path()) };
        {
            let engine = CaskEngine::open(config.clone()).unwrap();
            engine.put(b"durable", b"index").unwrap();
            engine.put(b"gone", b"soon").unwrap();
            engine.delete(b"gone").unwrap();
            engine.close().unwrap();
        }

        let engine = CaskEngine::open(config).unwrap();
        assert_eq!(engine.get(b"durable").unwrap(), b"index");
        assert!(matches!(engine.get(b"gone"), Err(CaskError::KeyNotFound)));
        assert_eq!(engine.stat().unwrap().key_num, 1);
        assert!(engine.seq_file_exists);
        engine.put(b"still", b"writable").unwrap();
        assert_eq!(engine.get(b"still").unwrap(), b"writable");
    }

    #[test]
    fn test_concurrent_readers() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(CaskEngine::open(test_config(dir.path())).unwrap());
        for i in 0..200u32 {
            engine
                .put(format!("k{}", i).as_bytes(), format!("v{}", i).as_bytes())
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(std::thread::spawn(move || {
                for i in 0..200u32 {
                    let value = engine.get(format!("k{}", i).as_bytes()).unwrap();
                    assert_eq!(value, format!("v{}", i).as_bytes());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_stat_counts() {
        let dir = TempDir::new().unwrap();
        let engine = CaskEngine::open(test_config(dir.path())).unwrap();
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();
        engine.put(b"a", b"replaced").unwrap();

        let stat = engine.stat().unwrap();
        assert_eq!(stat.key_num, 2);
        assert_eq!(stat.data_file_num, 1);
        assert!(stat.reclaimable_size > 0);
        assert!(stat.disk_size > 0);
    }
}
