//! blockcache - Persistent Block Cache Tier
//!
//! A disk-backed secondary cache for a key-value storage engine. Blocks
//! evicted from an in-memory cache are inserted here, batched into large
//! sequential writes on bounded cache files, and looked up again by key.
//!
//! # Architecture
//!
//! ```text
//! caller ─▶ BlockCache ─▶ insert thread ─▶ CacheFile ─▶ ThreadedWriter ─▶ disk
//!              │                                              │
//!              └──────── lookup ─▶ MetadataIndex ◀── publish ─┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Cache tiers, write pipeline and metadata index
//! - [`config`] - Cache configuration
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```no_run
//! use blockcache::{BlockCache, BlockCacheConfig, CacheKey, CacheTier};
//! use bytes::Bytes;
//!
//! # fn main() -> blockcache::Result<()> {
//! let cache = BlockCache::open_with(BlockCacheConfig::new("/var/cache/blockcache"))?;
//! cache.insert(CacheKey::from("block-1"), Bytes::from_static(b"payload"))?;
//! cache.flush_all()?;
//! assert!(cache.lookup(&CacheKey::from("block-1"))?.is_some());
//! cache.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{BlockCache, CacheKey, CacheStats, CacheTier, StatsSnapshot};
pub use config::BlockCacheConfig;
pub use error::{Error, Result};
