//! Metadata Index
//!
//! Maps cache keys to the location of their durable record and keeps the
//! registry of live cache files. An entry is only ever inserted by the
//! writer after the bytes it points at are on disk.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::file::CacheFile;
use super::key::CacheKey;
use super::shard::ShardedMap;
use super::METADATA_SHARDS;

/// Location of a record on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub file_id: u32,
    /// Offset of the record header
    pub offset: u64,
    /// Encoded record length
    pub size: u64,
}

impl BlockInfo {
    pub fn new(file_id: u32, offset: u64, size: u64) -> Self {
        Self {
            file_id,
            offset,
            size,
        }
    }

    /// Whether this record was appended after `other`.
    ///
    /// File ids only grow and offsets only grow within a file.
    pub fn is_newer_than(&self, other: &BlockInfo) -> bool {
        (self.file_id, self.offset) > (other.file_id, other.offset)
    }
}

/// Key index plus file registry
pub struct MetadataIndex {
    blocks: ShardedMap<BlockInfo, METADATA_SHARDS>,
    files: DashMap<u32, Arc<CacheFile>>,
}

impl Default for MetadataIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self {
            blocks: ShardedMap::new(),
            files: DashMap::new(),
        }
    }

    /// Point `key` at `info`, replacing any older location
    pub fn insert(&self, key: CacheKey, info: BlockInfo) -> Option<BlockInfo> {
        self.blocks.insert(key, info)
    }

    /// Point `key` at a freshly flushed record unless it already points at
    /// a newer one. Writers flush buffers of different files concurrently,
    /// so publishes can arrive out of append order.
    pub fn publish(&self, key: CacheKey, info: BlockInfo) -> bool {
        self.blocks
            .insert_unless(key, info, |current| current.is_newer_than(&info))
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<BlockInfo> {
        self.blocks.get(key)
    }

    /// Remove `key`; returns true if it was present
    pub fn erase(&self, key: &CacheKey) -> bool {
        self.blocks.remove(key).is_some()
    }

    /// Remove `key` only while it still points into file `file_id`
    pub fn erase_if_in_file(&self, key: &CacheKey, file_id: u32) -> bool {
        self.blocks
            .remove_if(key, |info| info.file_id == file_id)
            .is_some()
    }

    /// Number of indexed keys
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Remove every entry that still points into `file`.
    ///
    /// Keys that were re-inserted into a newer file are left alone.
    pub fn remove_file_entries(&self, file: &CacheFile) -> usize {
        let id = file.id();
        let removed = file
            .published_keys()
            .iter()
            .filter(|key| self.erase_if_in_file(key, id))
            .count();
        debug!(file_id = id, removed, "Removed index entries for cache file");
        removed
    }

    pub fn register_file(&self, file: Arc<CacheFile>) {
        self.files.insert(file.id(), file);
    }

    pub fn file(&self, id: u32) -> Option<Arc<CacheFile>> {
        self.files.get(&id).map(|f| f.value().clone())
    }

    pub fn remove_file(&self, id: u32) -> Option<Arc<CacheFile>> {
        self.files.remove(&id).map(|(_, f)| f)
    }

    /// Registered files ordered by id
    pub fn files(&self) -> Vec<Arc<CacheFile>> {
        let mut files: Vec<_> = self.files.iter().map(|f| f.value().clone()).collect();
        files.sort_by_key(|f| f.id());
        files
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Drop every entry and forget every file
    pub fn clear(&self) {
        self.blocks.clear();
        self.files.clear();
    }
}
