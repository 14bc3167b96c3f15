//! Error types for CaskDB operations
//!
//! All CaskDB errors are represented by the CaskError enum, which provides
//! detailed context for debugging and recovery.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// CaskDB error types with detailed context
#[derive(Debug, Clone)]
pub enum CaskError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// The key of a put/get/delete was empty
    KeyEmpty,

    /// The value of a put was empty (reserved for tombstones)
    ValueEmpty,

    /// Key is not present in the store
    KeyNotFound,

    /// The keydir references a data file that is not open
    DataFileNotFound {
        /// File id the keydir pointed at
        file_id: u32,
    },

    /// A keydir update that must succeed did not
    IndexUpdateFailed,

    /// The data directory contains something that is not ours
    DataDirCorrupted {
        /// Offending path
        path: PathBuf,
        /// Description of what was found
        reason: String,
    },

    /// A batch holds more pending operations than allowed
    ExceededMaxBatch {
        /// Operations buffered in the batch
        pending: usize,
        /// Configured maximum
        max: usize,
    },

    /// Another merge is already running on this engine
    MergeInProgress,

    /// Reclaimable bytes have not reached the configured merge ratio
    MergeRatioUnreached {
        /// Current reclaimable fraction of the directory
        current: f32,
        /// Configured threshold
        threshold: f32,
    },

    /// The filesystem cannot hold the post-merge data set
    InsufficientDiskSpace {
        /// Bytes the merged data set needs
        needed: u64,
        /// Bytes available on the volume
        available: u64,
    },

    /// Another process holds the directory lock
    DatabaseInUse {
        /// The locked data directory
        path: PathBuf,
    },

    /// Stored CRC does not match the recomputed CRC
    InvalidCrc {
        /// File being read
        path: PathBuf,
        /// Byte offset of the record
        offset: u64,
        /// CRC stored in the record header
        expected: u32,
        /// CRC computed over the record bytes
        actual: u32,
    },

    /// Write or sync attempted on a read-only (mmap) handle
    ReadOnlyIo {
        /// File the operation targeted
        path: PathBuf,
        /// The rejected operation
        op: &'static str,
    },

    /// Configuration: the data directory path is empty
    EmptyDirPath,

    /// Configuration: merge ratio outside [0, 1]
    InvalidMergeRatio {
        /// The rejected ratio
        ratio: f32,
    },

    /// Configuration: data file size must be positive
    InvalidDataFileSize {
        /// The rejected size
        size: u64,
    },

    /// Batch writes need the seq-num file with the B+ tree keydir
    SeqNumFileMissing,
}

impl fmt::Display for CaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaskError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            CaskError::KeyEmpty => write!(f, "key must not be empty"),

            CaskError::ValueEmpty => write!(f, "value must not be empty"),

            CaskError::KeyNotFound => write!(f, "key not found in store"),

            CaskError::DataFileNotFound { file_id } => {
                write!(f, "data file {:09}.data referenced by the keydir is not open", file_id)
            }

            CaskError::IndexUpdateFailed => write!(f, "failed to update the keydir"),

            CaskError::DataDirCorrupted { path, reason } => {
                write!(f, "data directory entry {} is corrupted: {}", path.display(), reason)
            }

            CaskError::ExceededMaxBatch { pending, max } => {
                write!(f, "batch holds {} operations, configured maximum is {}", pending, max)
            }

            CaskError::MergeInProgress => {
                write!(f, "merge is in progress, try again later")
            }

            CaskError::MergeRatioUnreached { current, threshold } => {
                write!(
                    f,
                    "reclaimable ratio {:.3} below merge threshold {:.3}",
                    current, threshold
                )
            }

            CaskError::InsufficientDiskSpace { needed, available } => {
                write!(
                    f,
                    "merge needs {} bytes but only {} bytes are available",
                    needed, available
                )
            }

            CaskError::DatabaseInUse { path } => {
                write!(f, "data directory {} is locked by another process", path.display())
            }

            CaskError::InvalidCrc { path, offset, expected, actual } => {
                write!(
                    f,
                    "CRC mismatch in {} at offset {}: expected 0x{:08x}, got 0x{:08x}",
                    path.display(),
                    offset,
                    expected,
                    actual
                )
            }

            CaskError::ReadOnlyIo { path, op } => {
                write!(f, "{} is not supported on read-only handle {}", op, path.display())
            }

            CaskError::EmptyDirPath => write!(f, "data directory path is empty"),

            CaskError::InvalidMergeRatio { ratio } => {
                write!(f, "merge ratio {} must be between 0 and 1", ratio)
            }

            CaskError::InvalidDataFileSize { size } => {
                write!(f, "data file size {} must be greater than 0", size)
            }

            CaskError::SeqNumFileMissing => {
                write!(f, "batch writes are unavailable: the seq-num file was not found")
            }
        }
    }
}

impl Error for CaskError {}

/// Convert std::io::Error to CaskError::Io
impl From<std::io::Error> for CaskError {
    fn from(err: std::io::Error) -> Self {
        CaskError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for CaskDB operations
pub type CaskResult<T> = Result<T, CaskError>;
