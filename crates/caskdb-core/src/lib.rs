//! CaskDB Core — Bitcask-model embedded key-value store
//!
//! An append-only log of records on disk with a fully in-memory keydir
//! mapping each live key to the position of its newest value.
//!
//! # Architecture
//!
//! - **Write path**: encode record, append to the active data file, then
//!   point the keydir at it (disk first, memory second)
//! - **Read path**: keydir lookup + one positional read
//! - **Recovery**: replay the log on open, or load the hint file a merge
//!   left behind; torn tails are truncated away, unfinished transactions
//!   are discarded
//! - **Merge**: rewrite live records into a fresh generation in a scratch
//!   directory, swapped in atomically on the next open
//!
//! # Atomic batches
//!
//! A [`WriteBatch`] commits any number of puts and deletes under one
//! transaction sequence number; a terminator record makes them visible
//! atomically, even across a crash.

pub mod batch;
pub mod blockfile;
pub mod config;
pub mod datafile;
pub mod engine;
pub mod error;
pub mod format;
pub mod fsutil;
pub mod iterator;
pub mod keydir;
pub mod merge;
pub mod platform_durability;

// Re-export key types for convenience
pub use batch::WriteBatch;
pub use config::{BatchConfig, Config, IndexType, IteratorConfig};
pub use engine::{CaskEngine, Stat};
pub use error::{CaskError, CaskResult};
pub use format::{LogRecord, RecordPosition, RecordType};
pub use iterator::EngineIterator;
