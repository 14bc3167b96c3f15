//! Data files and their sidecars
//!
//! A data file is an append-only sequence of encoded log records named by a
//! nine-digit zero-padded id (`000000012.data`). Exactly one file per
//! directory is active (the append target); files below it are frozen and
//! read-only. The hint, merge-finished, and seq-num sidecars reuse the same
//! record stream format under fixed names.

use std::path::{Path, PathBuf};

use crate::blockfile::{open_block_file, BlockFile, IoKind};
use crate::error::{CaskError, CaskResult};
use crate::format::{
    decode_record_header, encode_position, encode_record, record_crc, LogRecord, RecordPosition,
    RecordType, CRC_SIZE, MAX_HEADER_SIZE,
};

/// Suffix of rotating data files
pub const DATA_FILE_SUFFIX: &str = ".data";

/// Compact key-to-position index written by merge
pub const HINT_FILE_NAME: &str = "hint-index";

/// Marker certifying a completed merge; holds the non-merge boundary id
pub const MERGE_FINISHED_FILE_NAME: &str = "merge-finished";

/// Last allocated transaction sequence number (B+ tree keydir only)
pub const SEQ_NUM_FILE_NAME: &str = "seq-num";

/// Path of the data file with the given id.
pub fn data_file_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(format!("{:09}{}", file_id, DATA_FILE_SUFFIX))
}

/// List the ids of all data files in `dir`, ascending.
///
/// A `.data` entry whose stem is not a number means the directory holds
/// something that is not ours.
pub fn list_data_file_ids(dir: &Path) -> CaskResult<Vec<u32>> {
    let entries = std::fs::read_dir(dir).map_err(|e| CaskError::Io {
        path: Some(dir.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to read data directory: {}", e),
    })?;

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CaskError::Io {
            path: Some(dir.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to read directory entry: {}", e),
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(DATA_FILE_SUFFIX) {
            let id = stem.parse::<u32>().map_err(|_| CaskError::DataDirCorrupted {
                path: entry.path(),
                reason: "data file name is not a numeric id".to_string(),
            })?;
            ids.push(id);
        }
    }

    ids.sort_unstable();
    Ok(ids)
}

/// One log file: its id, its write cursor, and its I/O handle.
pub struct DataFile {
    /// File id; sidecars use 0
    pub file_id: u32,
    /// Offset one past the last written byte
    pub write_off: u64,
    path: PathBuf,
    io: Box<dyn BlockFile>,
}

impl DataFile {
    /// Open the data file with the given id, creating it if absent.
    pub fn open(dir: &Path, file_id: u32, kind: IoKind) -> CaskResult<Self> {
        let path = data_file_path(dir, file_id);
        Self::open_at(path, file_id, kind)
    }

    /// Open the hint sidecar.
    pub fn open_hint_file(dir: &Path) -> CaskResult<Self> {
        Self::open_at(dir.join(HINT_FILE_NAME), 0, IoKind::Standard)
    }

    /// Open the merge-finished sidecar.
    pub fn open_merge_finished_file(dir: &Path) -> CaskResult<Self> {
        Self::open_at(dir.join(MERGE_FINISHED_FILE_NAME), 0, IoKind::Standard)
    }

    /// Open the seq-num sidecar.
    pub fn open_seq_num_file(dir: &Path) -> CaskResult<Self> {
        Self::open_at(dir.join(SEQ_NUM_FILE_NAME), 0, IoKind::Standard)
    }

    fn open_at(path: PathBuf, file_id: u32, kind: IoKind) -> CaskResult<Self> {
        let io = open_block_file(&path, kind)?;
        Ok(Self { file_id, write_off: 0, path, io })
    }

    /// Append raw encoded bytes and advance the write cursor.
    pub fn append(&mut self, buf: &[u8]) -> CaskResult<()> {
        let n = self.io.append(buf)?;
        self.write_off += n as u64;
        Ok(())
    }

    /// Append a hint record mapping a user key to its merged position.
    pub fn append_hint_record(&mut self, key: &[u8], pos: &RecordPosition) -> CaskResult<()> {
        let record = LogRecord {
            key: key.to_vec(),
            value: encode_position(pos),
            rec_type: RecordType::Normal,
        };
        let (encoded, _) = encode_record(&record);
        self.append(&encoded)
    }

    /// Push written data to persistent storage.
    pub fn sync(&self) -> CaskResult<()> {
        self.io.sync()
    }

    /// Size of the file on disk.
    pub fn size(&self) -> CaskResult<u64> {
        self.io.size()
    }

    /// Replace the I/O handle, e.g. mmap during recovery back to standard.
    pub fn set_io_kind(&mut self, kind: IoKind) -> CaskResult<()> {
        self.io = open_block_file(&self.path, kind)?;
        Ok(())
    }

    /// Cut the file down to `len` bytes and clamp the write cursor.
    pub fn truncate(&mut self, len: u64) -> CaskResult<()> {
        self.io.truncate(len)?;
        if self.write_off > len {
            self.write_off = len;
        }
        Ok(())
    }

    /// Read the record starting at `offset`.
    ///
    /// Returns the record and its encoded size, or None at a clean end of
    /// the stream: end of file, a zeroed or truncated header, a record whose
    /// bytes run past the file, or a CRC-invalid record ending exactly at
    /// the tail (a torn write). A CRC mismatch strictly inside the file is
    /// real corruption and surfaces as an error.
    pub fn read_record(&self, offset: u64) -> CaskResult<Option<(LogRecord, u64)>> {
        let file_size = self.io.size()?;
        if offset >= file_size {
            return Ok(None);
        }

        let header_avail = (MAX_HEADER_SIZE as u64).min(file_size - offset) as usize;
        let mut header_buf = vec![0u8; header_avail];
        let n = self.io.read_at(&mut header_buf, offset)?;

        let Some((header, header_len)) = decode_record_header(&header_buf[..n]) else {
            return Ok(None);
        };
        // Zeroed header: reading into preallocated or torn space
        if header.crc == 0 && header.type_byte == 0 && header.key_size == 0 && header.value_size == 0
        {
            return Ok(None);
        }

        let key_size = header.key_size as u64;
        let value_size = header.value_size as u64;
        let record_size = header_len as u64 + key_size + value_size;
        if offset + record_size > file_size {
            return Ok(None);
        }

        let mut kv = vec![0u8; (key_size + value_size) as usize];
        let n = self.io.read_at(&mut kv, offset + header_len as u64)?;
        if n < kv.len() {
            return Ok(None);
        }

        let (key, value) = kv.split_at(header.key_size as usize);
        let crc = record_crc(&header_buf[CRC_SIZE..header_len], key, value);
        if crc != header.crc {
            if offset + record_size >= file_size {
                // Torn tail: the crashed append is the last thing in the file
                return Ok(None);
            }
            return Err(CaskError::InvalidCrc {
                path: self.path.clone(),
                offset,
                expected: header.crc,
                actual: crc,
            });
        }

        let rec_type =
            RecordType::from_u8(header.type_byte).ok_or_else(|| CaskError::DataDirCorrupted {
                path: self.path.clone(),
                reason: format!("unknown record type {} at offset {}", header.type_byte, offset),
            })?;

        Ok(Some((
            LogRecord { key: key.to_vec(), value: value.to_vec(), rec_type },
            record_size,
        )))
    }
}
