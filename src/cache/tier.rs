//! Cache tier capability set
//!
//! A tier is one level of a cache hierarchy. Whatever composes tiers only
//! talks to them through this trait.

use bytes::Bytes;

use super::key::CacheKey;
use crate::error::Result;

/// Operations every cache tier supports
pub trait CacheTier: Send + Sync {
    /// Bring the tier up; an open tier rejects a second `open`
    fn open(&self) -> Result<()>;

    /// Flush and stop the tier; closing twice is a no-op
    fn close(&self) -> Result<()>;

    /// Accept `data` under `key`.
    ///
    /// Returning `Ok` means the block was accepted, not that it is visible
    /// to lookups yet.
    fn insert(&self, key: CacheKey, data: Bytes) -> Result<()>;

    /// Fetch the block stored under `key`; a miss is `Ok(None)`
    fn lookup(&self, key: &CacheKey) -> Result<Option<Bytes>>;

    /// Forget `key`; returns true if it was indexed
    fn erase(&self, key: &CacheKey) -> bool;

    /// Claim `size` bytes of capacity, evicting if needed
    fn reserve(&self, size: u64) -> bool;

    /// Human readable statistics
    fn print_stats(&self) -> String;

    /// Make every accepted insert visible to lookups
    fn flush_all(&self) -> Result<()>;

    /// Tier name for logs
    fn name(&self) -> &str;
}
