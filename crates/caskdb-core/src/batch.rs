//! Atomic batch writes
//!
//! A WriteBatch buffers puts and deletes in memory, keyed by user key (the
//! latest operation per key wins). Commit appends every buffered record
//! tagged with one freshly allocated transaction sequence number, then a
//! terminator record of type TxnFinished. Recovery treats records of a seq
//! without a terminator as an aborted transaction and discards them, which
//! is what makes the batch atomic across crashes.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;

use crate::config::{BatchConfig, IndexType};
use crate::engine::CaskEngine;
use crate::error::{CaskError, CaskResult};
use crate::format::{put_uvarint, uvarint, LogRecord, RecordPosition, RecordType};

/// Sequence number marking a record as non-transactional
pub(crate) const NON_TXN_SEQ: u64 = 0;

/// Reserved key of the terminator record. A user key equal to this is not
/// guaranteed safe across transactional commits; commit recognition keys
/// off the record type, not these bytes.
pub(crate) const TXN_FIN_KEY: &[u8] = b"txn-fin";

/// Prefix `key` with its transaction sequence number as a varint.
pub(crate) fn key_with_seq(key: &[u8], seq: u64) -> Vec<u8> {
    let mut tagged = Vec::with_capacity(key.len() + 10);
    put_uvarint(&mut tagged, seq);
    tagged.extend_from_slice(key);
    tagged
}

/// Split a stored key into the user key and its sequence number.
pub(crate) fn parse_record_key(key: &[u8]) -> CaskResult<(Vec<u8>, u64)> {
    let (seq, n) = uvarint(key).ok_or_else(|| CaskError::DataDirCorrupted {
        path: std::path::PathBuf::new(),
        reason: "record key lacks a sequence prefix".to_string(),
    })?;
    Ok((key[n..].to_vec(), seq))
}

/// Buffered atomic multi-operation write.
pub struct WriteBatch<'a> {
    config: BatchConfig,
    engine: &'a CaskEngine,
    pending: Mutex<HashMap<Vec<u8>, LogRecord>>,
}

impl CaskEngine {
    /// Start a batch against this engine.
    ///
    /// With the B+ tree keydir the sequence counter only survives runs via
    /// the seq-num file; on a pre-existing directory without one the batch
    /// writer refuses to start rather than risk reusing sequence numbers.
    pub fn new_batch(&self, config: BatchConfig) -> CaskResult<WriteBatch<'_>> {
        if self.config.index_type == IndexType::BPlusTree
            && !self.seq_file_exists
            && !self.is_initial
        {
            return Err(CaskError::SeqNumFileMissing);
        }
        Ok(WriteBatch { config, engine: self, pending: Mutex::new(HashMap::new()) })
    }
}

impl WriteBatch<'_> {
    /// Stage a put. Nothing reaches disk until commit.
    pub fn put(&self, key: &[u8], value: &[u8]) -> CaskResult<()> {
        if key.is_empty() {
            return Err(CaskError::KeyEmpty);
        }
        if value.is_empty() {
            return Err(CaskError::ValueEmpty);
        }

        let mut pending = self.pending.lock();
        pending.insert(
            key.to_vec(),
            LogRecord { key: key.to_vec(), value: value.to_vec(), rec_type: RecordType::Normal },
        );
        Ok(())
    }

    /// Stage a delete. Deleting a key absent from both the store and the
    /// batch just drops any staged write for it.
    pub fn delete(&self, key: &[u8]) -> CaskResult<()> {
        if key.is_empty() {
            return Err(CaskError::KeyEmpty);
        }

        let mut pending = self.pending.lock();
        if self.engine.keydir.get(key)?.is_none() {
            pending.remove(key);
            return Ok(());
        }
        pending.insert(
            key.to_vec(),
            LogRecord { key: key.to_vec(), value: Vec::new(), rec_type: RecordType::Deleted },
        );
        Ok(())
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether the batch stages nothing.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Write every staged operation atomically.
    ///
    /// Appends all records under one sequence number, then the terminator;
    /// only after the terminator is on disk does the keydir change. A crash
    /// anywhere before the terminator leaves the store as if the batch
    /// never happened.
    pub fn commit(&self) -> CaskResult<()> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Ok(());
        }
        if pending.len() > self.config.max_batch_num {
            return Err(CaskError::ExceededMaxBatch {
                pending: pending.len(),
                max: self.config.max_batch_num,
            });
        }

        // Serialize commits against each other and against single writes
        let mut files = self.engine.files.write();

        let seq = self.engine.seq_num.fetch_add(1, Ordering::SeqCst) + 1;

        let mut positions: HashMap<Vec<u8>, RecordPosition> =
            HashMap::with_capacity(pending.len());
        for (key, record) in pending.iter() {
            let pos = self.engine.append_record(
                &mut files,
                &LogRecord {
                    key: key_with_seq(key, seq),
                    value: record.value.clone(),
                    rec_type: record.rec_type,
                },
            )?;
            positions.insert(key.clone(), pos);
        }

        let terminator = LogRecord {
            key: key_with_seq(TXN_FIN_KEY, seq),
            value: Vec::new(),
            rec_type: RecordType::TxnFinished,
        };
        self.engine.append_record(&mut files, &terminator)?;

        if self.config.sync_writes {
            if let Some(active) = &files.active {
                active.sync()?;
            }
        }

        // All records are durable; the keydir may now see them
        for (key, record) in pending.iter() {
            let pos = positions[key];
            let old = match record.rec_type {
                RecordType::Normal => self.engine.keydir.put(key, pos)?,
                RecordType::Deleted => self.engine.keydir.delete(key)?.0,
                RecordType::TxnFinished => None,
            };
            if let Some(old) = old {
                self.engine.reclaim_size.fetch_add(old.size, Ordering::Relaxed);
            }
        }

        pending.clear();
        Ok(())
    }
}
