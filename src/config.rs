//! Block cache configuration
//!
//! All options are plain values with serde defaults so a partial YAML file
//! only needs to name what it overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default write buffer size (1MB)
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Default number of write buffers
pub const DEFAULT_WRITE_BUFFER_COUNT: usize = 200;

/// Default buffer pool limit (256MB)
pub const DEFAULT_BUFFERPOOL_LIMIT: u64 = 256 * 1024 * 1024;

/// Default write pipeline backlog (1GB)
pub const DEFAULT_PIPELINE_BACKLOG: u64 = 1024 * 1024 * 1024;

/// Default cache file size (100MB)
pub const DEFAULT_CACHE_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Default cache capacity (10GB)
pub const DEFAULT_CACHE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Block cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockCacheConfig {
    /// Cache root; files live under `<path>/cache`
    pub path: PathBuf,
    /// Size of each write buffer in bytes
    pub write_buffer_size: usize,
    /// Maximum number of write buffers
    pub write_buffer_count: usize,
    /// Byte ceiling for the whole buffer pool
    pub bufferpool_limit: u64,
    /// Maximum bytes waiting in the insert queue
    pub max_write_pipeline_backlog_size: u64,
    /// Number of writer threads
    pub writer_qdepth: usize,
    /// Size limit of a single cache file
    pub cache_file_size: u64,
    /// Overall cache capacity in bytes
    pub cache_size: u64,
    /// Route inserts through the insert thread (false appends on the caller)
    pub pipeline_writes: bool,
    /// Write attempts retried before a file is marked failed
    pub writer_max_retries: u32,
    /// Delay between write retries
    pub writer_retry_delay_ms: u64,
    /// Buffer allocation retries before an insert is dropped
    pub insert_max_retries: u32,
    /// fdatasync every flushed buffer before publishing it
    pub sync_writes: bool,
    /// Idle time after which a partially filled buffer is flushed (0 disables)
    pub idle_flush_interval_ms: u64,
    /// Re-index existing cache files at open instead of deleting them
    pub recover_on_open: bool,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/cache/blockcache"),
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            write_buffer_count: DEFAULT_WRITE_BUFFER_COUNT,
            bufferpool_limit: DEFAULT_BUFFERPOOL_LIMIT,
            max_write_pipeline_backlog_size: DEFAULT_PIPELINE_BACKLOG,
            writer_qdepth: 1,
            cache_file_size: DEFAULT_CACHE_FILE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            pipeline_writes: true,
            writer_max_retries: 3,
            writer_retry_delay_ms: 10,
            insert_max_retries: 3,
            sync_writes: true,
            idle_flush_interval_ms: 100,
            recover_on_open: true,
        }
    }
}

impl BlockCacheConfig {
    /// Create a configuration rooted at `path` with default values
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse a configuration from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Directory holding the cache files
    pub fn cache_dir(&self) -> PathBuf {
        self.path.join("cache")
    }

    /// Number of buffers the pool may hold at once
    pub fn max_buffers(&self) -> usize {
        if self.write_buffer_size == 0 {
            return 0;
        }
        let by_limit = self.bufferpool_limit / self.write_buffer_size as u64;
        self.write_buffer_count.min(by_limit as usize)
    }

    pub fn writer_retry_delay(&self) -> Duration {
        Duration::from_millis(self.writer_retry_delay_ms)
    }

    pub fn idle_flush_interval(&self) -> Option<Duration> {
        (self.idle_flush_interval_ms > 0)
            .then(|| Duration::from_millis(self.idle_flush_interval_ms))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::Config("path must not be empty".into()));
        }
        if self.write_buffer_size == 0 {
            return Err(Error::Config("write_buffer_size must be > 0".into()));
        }
        if self.write_buffer_count == 0 {
            return Err(Error::Config("write_buffer_count must be > 0".into()));
        }
        if self.max_buffers() == 0 {
            return Err(Error::Config(format!(
                "bufferpool_limit {} cannot hold a single {} byte buffer",
                self.bufferpool_limit, self.write_buffer_size
            )));
        }
        if self.writer_qdepth == 0 {
            return Err(Error::Config("writer_qdepth must be > 0".into()));
        }
        if self.cache_file_size < self.write_buffer_size as u64 {
            return Err(Error::Config(
                "cache_file_size must be >= write_buffer_size".into(),
            ));
        }
        if self.cache_size < self.cache_file_size {
            return Err(Error::Config("cache_size must be >= cache_file_size".into()));
        }
        if self.max_write_pipeline_backlog_size == 0 {
            return Err(Error::Config(
                "max_write_pipeline_backlog_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BlockCacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_buffers(), 200);
    }

    #[test]
    fn test_max_buffers_bounded_by_pool_limit() {
        let config = BlockCacheConfig {
            write_buffer_size: 4096,
            write_buffer_count: 100,
            bufferpool_limit: 10 * 4096,
            ..Default::default()
        };
        assert_eq!(config.max_buffers(), 10);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = BlockCacheConfig {
            writer_qdepth: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BlockCacheConfig {
            cache_size: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BlockCacheConfig {
            bufferpool_limit: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "path: /tmp/bc\nwrite_buffer_size: 8192\nwriter_qdepth: 4\n";
        let config = BlockCacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.path, PathBuf::from("/tmp/bc"));
        assert_eq!(config.write_buffer_size, 8192);
        assert_eq!(config.writer_qdepth, 4);
        assert_eq!(config.cache_file_size, DEFAULT_CACHE_FILE_SIZE);
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/bc/cache"));
    }

    #[test]
    fn test_idle_flush_interval_disabled_at_zero() {
        let config = BlockCacheConfig {
            idle_flush_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.idle_flush_interval().is_none());
    }
}
