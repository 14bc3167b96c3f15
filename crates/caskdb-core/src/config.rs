//! Configuration for the engine, batches, and iterators

use std::path::PathBuf;

use crate::error::{CaskError, CaskResult};

/// Keydir backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    /// In-memory ordered tree (std BTreeMap)
    BTree,
    /// In-memory radix tree
    Radix,
    /// On-disk B+ tree; the keydir survives restarts
    BPlusTree,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory; created if absent
    pub dir_path: PathBuf,
    /// Maximum bytes per data file before rotation
    pub data_file_size: u64,
    /// Fsync after every append
    pub sync_writes: bool,
    /// If nonzero and sync_writes is off, fsync every N written bytes
    pub bytes_per_sync: u64,
    /// Keydir backend
    pub index_type: IndexType,
    /// Use mmap reads for the recovery scan
    pub mmap_at_startup: bool,
    /// Reclaimable fraction of the directory that gates merge; 0 disables the gate
    pub data_file_merge_ratio: f32,
}

impl Config {
    /// Validate all configuration parameters
    pub fn validate(&self) -> CaskResult<()> {
        if self.dir_path.as_os_str().is_empty() {
            return Err(CaskError::EmptyDirPath);
        }
        if self.data_file_size == 0 {
            return Err(CaskError::InvalidDataFileSize { size: self.data_file_size });
        }
        if !(0.0..=1.0).contains(&self.data_file_merge_ratio) {
            return Err(CaskError::InvalidMergeRatio { ratio: self.data_file_merge_ratio });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir_path: std::env::temp_dir().join("caskdb"),
            data_file_size: 256 * 1024 * 1024,
            sync_writes: false,
            bytes_per_sync: 0,
            index_type: IndexType::BTree,
            mmap_at_startup: true,
            data_file_merge_ratio: 0.5,
        }
    }
}

/// Batch writer configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum operations one batch may hold
    pub max_batch_num: usize,
    /// Fsync the active file when the batch commits
    pub sync_writes: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_batch_num: 10_000, sync_writes: true }
    }
}

/// Engine iterator configuration
#[derive(Debug, Clone, Default)]
pub struct IteratorConfig {
    /// Only visit keys beginning with this prefix; empty visits everything
    pub prefix: Vec<u8>,
    /// Traverse in descending key order
    pub reverse: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_empty_dir_rejected() {
        let config = Config { dir_path: PathBuf::new(), ..Config::default() };
        assert!(matches!(config.validate(), Err(CaskError::EmptyDirPath)));
    }

    #[test]
    fn test_zero_file_size_rejected() {
        let config = Config { data_file_size: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(CaskError::InvalidDataFileSize { size: 0 })));
    }

    #[test]
    fn test_merge_ratio_bounds() {
        let config = Config { data_file_merge_ratio: 1.5, ..Config::default() };
        assert!(matches!(config.validate(), Err(CaskError::InvalidMergeRatio { .. })));

        let config = Config { data_file_merge_ratio: -0.1, ..Config::default() };
        assert!(matches!(config.validate(), Err(CaskError::InvalidMergeRatio { .. })));

        let config = Config { data_file_merge_ratio: 0.0, ..Config::default() };
        assert!(config.validate().is_ok());
        let config = Config { data_file_merge_ratio: 1.0, ..Config::default() };
        assert!(config.validate().is_ok());
    }
}
