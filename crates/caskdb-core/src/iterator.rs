//! Engine-level iteration
//!
//! Wraps a keydir iterator with an optional key-prefix filter and resolves
//! positions to values through the engine. The underlying cursor walks a
//! snapshot (or, for the B+ tree keydir, a pinned read transaction), so
//! traversal never blocks writers.

use crate::config::IteratorConfig;
use crate::engine::CaskEngine;
use crate::error::CaskResult;
use crate::keydir::KeydirIter;

/// Ordered cursor over the store's live keys.
pub struct EngineIterator<'a> {
    engine: &'a CaskEngine,
    inner: Box<dyn KeydirIter>,
    config: IteratorConfig,
}

impl CaskEngine {
    /// Open an iterator positioned at the first matching key.
    pub fn iterator(&self, config: IteratorConfig) -> CaskResult<EngineIterator<'_>> {
        let inner = self.keydir.iterator(config.reverse)?;
        let mut iter = EngineIterator { engine: self, inner, config };
        iter.skip_to_prefix();
        Ok(iter)
    }
}

impl EngineIterator<'_> {
    /// Go back to the first matching key.
    pub fn rewind(&mut self) {
        self.inner.rewind();
        self.skip_to_prefix();
    }

    /// Position at the first key >= `key` (ascending) or <= `key`
    /// (descending), then skip to the prefix if one is configured.
    pub fn seek(&mut self, key: &[u8]) {
        self.inner.seek(key);
        self.skip_to_prefix();
    }

    /// Advance to the next matching key.
    pub fn next(&mut self) {
        self.inner.next();
        self.skip_to_prefix();
    }

    /// Whether the cursor addresses a key.
    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    /// Key under the cursor. Panics when the cursor is not valid.
    pub fn key(&self) -> &[u8] {
        self.inner.key()
    }

    /// Value under the cursor, read from its data file.
    pub fn value(&self) -> CaskResult<Vec<u8>> {
        let pos = self.inner.value();
        let files = self.engine.files.read();
        self.engine.read_value_at(&files, &pos)
    }

    /// Advance until the cursor key carries the configured prefix.
    fn skip_to_prefix(&mut self) {
        if self.config.prefix.is_empty() {
            return;
        }
        while self.inner.valid() && !self.inner.key().starts_with(&self.config.prefix) {
            self.inner.next();
        }
    }
}
