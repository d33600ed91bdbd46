//! Cache key type

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;

/// Opaque cache key supplied by the caller
///
/// Keys compare and order by their bytes. The hash is computed once at
/// construction and reused for shard selection.
#[derive(Clone)]
pub struct CacheKey {
    hash: u64,
    bytes: Bytes,
}

impl CacheKey {
    /// Create a key from any byte source
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            hash: Self::fx_hash(&bytes),
            bytes,
        }
    }

    /// Copy a borrowed slice into a key
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(bytes))
    }

    /// Fast non-cryptographic hash (FxHash algorithm)
    #[inline]
    fn fx_hash(bytes: &[u8]) -> u64 {
        const SEED: u64 = 0x517cc1b727220a95;
        let mut hash = SEED;
        for &byte in bytes {
            hash = hash.rotate_left(5) ^ (byte as u64);
            hash = hash.wrapping_mul(SEED);
        }
        hash
    }

    /// Shard index for this key; `shard_count` must be a power of two
    #[inline]
    pub fn shard_index(&self, shard_count: usize) -> usize {
        (self.hash as usize) & (shard_count - 1)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bytes == other.bytes
    }
}

impl Eq for CacheKey {}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.bytes) {
            Ok(s) => write!(f, "CacheKey({:?})", s),
            Err(_) => write!(f, "CacheKey({:02x?})", &self.bytes[..]),
        }
    }
}

impl From<&[u8]> for CacheKey {
    fn from(bytes: &[u8]) -> Self {
        Self::copy_from_slice(bytes)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::copy_from_slice(s.as_bytes())
    }
}

impl From<Vec<u8>> for CacheKey {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_order_by_bytes() {
        let a = CacheKey::from("a");
        let b = CacheKey::from("b");
        let ab = CacheKey::from("ab");
        assert!(a < ab);
        assert!(ab < b);
        assert_eq!(a, CacheKey::copy_from_slice(b"a"));
    }

    #[test]
    fn test_shard_index_in_range() {
        for i in 0..1000 {
            let key = CacheKey::from(format!("key-{}", i).as_str());
            assert!(key.shard_index(64) < 64);
        }
    }

    #[test]
    fn test_debug_formats_binary_keys() {
        let key = CacheKey::from(vec![0xff, 0x00]);
        assert!(format!("{:?}", key).contains("ff"));
        assert_eq!(format!("{:?}", CacheKey::from("k")), "CacheKey(\"k\")");
    }
}
