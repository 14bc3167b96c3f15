//! Merge — reclaim dead log space and build the hint index
//!
//! Merge streams every frozen data file and rewrites only the records the
//! keydir still points at into a scratch sibling directory (`<dir>-merge`),
//! stripped of their transaction tags, together with a hint file mapping
//! each key to its new position. A synced `merge-finished` marker makes the
//! scratch directory authoritative; the next open swaps it in atomically.
//!
//! Crash safety follows from writing nothing in the main directory until
//! the swap: a scratch directory without the marker is discarded on open,
//! and the swap itself only deletes files whose live records are already in
//! the merged generation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::batch::{key_with_seq, parse_record_key, NON_TXN_SEQ};
use crate::blockfile::IoKind;
use crate::datafile::{self, DataFile, MERGE_FINISHED_FILE_NAME};
use crate::engine::CaskEngine;
use crate::error::{CaskError, CaskResult};
use crate::format::{encode_record, LogRecord, RecordPosition, RecordType};
use crate::fsutil;
use crate::platform_durability::sync_dir;

/// Scratch sibling directory a merge writes into.
pub(crate) fn merge_scratch_path(dir: &Path) -> PathBuf {
    let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push("-merge");
    match dir.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Smallest file id that was not merged, read from the merge-finished
/// marker in `dir`. None when no marker exists.
pub(crate) fn non_merge_boundary(dir: &Path) -> CaskResult<Option<u32>> {
    let path = dir.join(MERGE_FINISHED_FILE_NAME);
    if !path.exists() {
        return Ok(None);
    }

    let file = DataFile::open_merge_finished_file(dir)?;
    let (record, _) = file.read_record(0)?.ok_or_else(|| CaskError::DataDirCorrupted {
        path: path.clone(),
        reason: "merge-finished marker holds no record".to_string(),
    })?;

    let boundary = std::str::from_utf8(&record.value)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| CaskError::DataDirCorrupted {
            path,
            reason: "merge-finished value is not a file id".to_string(),
        })?;
    Ok(Some(boundary))
}

/// Swap a completed merge into the main directory. Runs on open, before
/// data files are enumerated.
pub(crate) fn apply_pending_merge(dir: &Path) -> CaskResult<()> {
    let scratch = merge_scratch_path(dir);
    if !scratch.is_dir() {
        return Ok(());
    }

    let rm_err = |e: std::io::Error| CaskError::Io {
        path: Some(scratch.clone()),
        kind: e.kind(),
        message: format!("failed to remove merge scratch directory: {}", e),
    };

    // No marker means the merge never finished; the scratch contents are
    // not trustworthy and the main directory is still complete
    if !scratch.join(MERGE_FINISHED_FILE_NAME).exists() {
        log::warn!("discarding unfinished merge at {}", scratch.display());
        fs::remove_dir_all(&scratch).map_err(rm_err)?;
        return Ok(());
    }

    let boundary = non_merge_boundary(&scratch)?.unwrap_or(0);

    // Every live record below the boundary exists in the merged files
    for id in datafile::list_data_file_ids(dir)? {
        if id < boundary {
            let path = datafile::data_file_path(dir, id);
            fs::remove_file(&path).map_err(|e| CaskError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("failed to remove merged-away data file: {}", e),
            })?;
        }
    }

    for entry in fs::read_dir(&scratch).map_err(rm_err)? {
        let entry = entry.map_err(rm_err)?;
        let target = dir.join(entry.file_name());
        fs::rename(entry.path(), &target).map_err(|e| CaskError::Io {
            path: Some(target),
            kind: e.kind(),
            message: format!("failed to move merged file into place: {}", e),
        })?;
    }
    fs::remove_dir_all(&scratch).map_err(rm_err)?;

    sync_dir(dir).map_err(|e| CaskError::Io {
        path: Some(dir.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to sync data directory after merge swap: {}", e),
    })?;

    log::info!("merge swap applied, data files below id {} replaced", boundary);
    Ok(())
}

impl CaskEngine {
    /// Compact the log: rewrite live records below the current active file
    /// into a fresh generation and produce the hint index.
    ///
    /// Refuses while another merge runs. When `data_file_merge_ratio` is
    /// nonzero, also refuses until that fraction of the directory is
    /// reclaimable. Writers may keep writing while the merge streams.
    pub fn merge(&self) -> CaskResult<()> {
        {
            let files = self.files.read();
            if files.active.is_none() {
                return Ok(());
            }
        }

        if self
            .merging
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CaskError::MergeInProgress);
        }

        let result = self.run_merge();
        self.merging.store(false, Ordering::SeqCst);
        result
    }

    fn run_merge(&self) -> CaskResult<()> {
        let total_size = fsutil::dir_size(&self.config.dir_path)?;
        let reclaimable = self.reclaim_size.load(Ordering::Relaxed);

        if self.config.data_file_merge_ratio > 0.0 && total_size > 0 {
            let current = reclaimable as f32 / total_size as f32;
            if current < self.config.data_file_merge_ratio {
                return Err(CaskError::MergeRatioUnreached {
                    current,
                    threshold: self.config.data_file_merge_ratio,
                });
            }
        }

        let surviving = total_size.saturating_sub(reclaimable);
        let available = fsutil::available_disk_size(&self.config.dir_path)?;
        if surviving >= available {
            return Err(CaskError::InsufficientDiskSpace { needed: surviving, available });
        }

        // Freeze the current active file under the engine lock so the
        // merge set is fixed; writers continue into the new active file
        let (eligible, boundary) = {
            let mut files = self.files.write();
            self.freeze_active(&mut files)?;
            let boundary = files
                .active
                .as_ref()
                .expect("freeze_active always leaves an active file")
                .file_id;
            let mut eligible: Vec<Arc<DataFile>> = files.frozen.values().cloned().collect();
            eligible.sort_by_key(|file| file.file_id);
            (eligible, boundary)
        };

        let scratch = merge_scratch_path(&self.config.dir_path);
        if scratch.exists() {
            fs::remove_dir_all(&scratch).map_err(|e| CaskError::Io {
                path: Some(scratch.clone()),
                kind: e.kind(),
                message: format!("failed to clear stale merge scratch: {}", e),
            })?;
        }
        fs::create_dir_all(&scratch).map_err(|e| CaskError::Io {
            path: Some(scratch.clone()),
            kind: e.kind(),
            message: format!("failed to create merge scratch: {}", e),
        })?;

        let mut merge_active = DataFile::open(&scratch, 0, IoKind::Standard)?;
        let mut hint = DataFile::open_hint_file(&scratch)?;
        let mut rewritten = 0u64;

        for file in &eligible {
            let mut offset = 0u64;
            while let Some((record, size)) = file.read_record(offset)? {
                let (real_key, _) = parse_record_key(&record.key)?;

                // A record is live iff the keydir still points exactly here;
                // tombstones and superseded versions fail the comparison
                let live = match self.keydir.get(&real_key)? {
                    Some(pos) => pos.file_id == file.file_id && pos.offset == offset,
                    None => false,
                };
                if live {
                    // Merge discards history: the rewrite is non-transactional
                    let clean = LogRecord {
                        key: key_with_seq(&real_key, NON_TXN_SEQ),
                        value: record.value,
                        rec_type: record.rec_type,
                    };
                    let (encoded, rec_size) = encode_record(&clean);

                    if merge_active.write_off + rec_size > self.config.data_file_size {
                        merge_active.sync()?;
                        let next_id = merge_active.file_id + 1;
                        merge_active = DataFile::open(&scratch, next_id, IoKind::Standard)?;
                    }

                    let new_pos = RecordPosition {
                        file_id: merge_active.file_id,
                        offset: merge_active.write_off,
                        size: rec_size,
                    };
                    merge_active.append(&encoded)?;
                    hint.append_hint_record(&real_key, &new_pos)?;
                    rewritten += 1;
                }

                offset += size;
            }
        }

        merge_active.sync()?;
        hint.sync()?;

        // The marker certifies the scratch directory; it goes in last
        let mut finished = DataFile::open_merge_finished_file(&scratch)?;
        let marker = LogRecord {
            key: MERGE_FINISHED_FILE_NAME.as_bytes().to_vec(),
            value: boundary.to_string().into_bytes(),
            rec_type: RecordType::Normal,
        };
        let (encoded, _) = encode_record(&marker);
        finished.append(&encoded)?;
        finished.sync()?;

        sync_dir(&scratch).map_err(|e| CaskError::Io {
            path: Some(scratch.clone()),
            kind: e.kind(),
            message: format!("failed to sync merge scratch: {}", e),
        })?;

        log::info!(
            "merge rewrote {} live record(s) from {} file(s) below id {}",
            rewritten,
            eligible.len(),
            boundary
        );
        Ok(())
    }
}
