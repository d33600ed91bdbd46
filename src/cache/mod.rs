//! Persistent Block Cache Tier
//!
//! Disk-backed secondary cache that turns unordered, arbitrarily sized
//! block inserts into large sequential writes on bounded cache files.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             BlockCache                                   │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  insert ─▶ Reserve ─▶ BoundedQueue ─▶ insert thread ─▶ CacheFile.append  │
//! │                                                          │               │
//! │                          BufferAllocator ◀───────────────┤ full buffers  │
//! │                                 ▲                        ▼               │
//! │                                 └──── release ◀── ThreadedWriter         │
//! │                                                          │ publish       │
//! │  lookup ─────────────────────────────────────────▶ MetadataIndex         │
//! │                                                   (64-way sharded)       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - A key is only visible to lookups once its record is on disk
//! - Inserts never block on disk I/O; a full backlog or buffer pool fails fast
//! - Reserved bytes never exceed the configured capacity
//! - Space is reclaimed a whole file at a time, oldest file first by default

mod allocator;
mod block_cache;
mod eviction;
mod file;
mod key;
mod metadata;
mod queue;
mod record;
mod shard;
mod stats;
mod tier;
mod writer;

pub use allocator::{BufferAllocator, WriteBuffer};
pub use block_cache::BlockCache;
pub use eviction::{EvictionPolicy, LargestFileFirst, OldestFileFirst};
pub use file::{AppendOutcome, AppendedRecord, CacheFile, FileSummary, CACHE_FILE_EXTENSION};
pub use key::CacheKey;
pub use metadata::{BlockInfo, MetadataIndex};
pub use queue::{BoundedQueue, InsertOp, Weighted};
pub use record::{
    DecodeError, Record, RecordHeader, MAX_KEY_SIZE, MAX_VALUE_SIZE, RECORD_HEADER_SIZE,
    RECORD_MAGIC,
};
pub use shard::{Shard, ShardedMap};
pub use stats::{CacheStats, HistogramSnapshot, StatsSnapshot};
pub use tier::CacheTier;
pub use writer::{ThreadedWriter, WriteJob, WriterConfig};

/// Record codec functions
pub mod codec {
    pub use super::record::{decode, encode, encoded_len};
}

/// Default number of metadata index shards
pub const METADATA_SHARDS: usize = 64;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_is_power_of_two() {
        assert!(METADATA_SHARDS.is_power_of_two());
        let map: ShardedMap<u8> = ShardedMap::new();
        assert_eq!(map.shard_count(), METADATA_SHARDS);
    }

    #[test]
    fn test_block_cache_is_a_tier_object() {
        let config = crate::config::BlockCacheConfig::new("/nonexistent/blockcache");
        let tiers: Vec<Box<dyn CacheTier>> = vec![Box::new(BlockCache::new(config).unwrap())];
        assert_eq!(tiers[0].name(), "block-cache");
        assert!(!tiers[0].erase(&CacheKey::from("k")));
    }
}
