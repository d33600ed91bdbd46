//! Error types for the block cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the block cache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Insert queue full, buffer pool exhausted or capacity unavailable
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Key longer than the record format allows
    #[error("Key of {len} bytes exceeds the {max} byte limit")]
    KeyTooLarge { len: usize, max: usize },

    /// Value longer than the record format allows
    #[error("Value of {len} bytes exceeds the {max} byte limit")]
    ValueTooLarge { len: usize, max: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A stored record failed validation
    #[error("Corrupt record in cache file {file_id} at offset {offset}: {reason}")]
    Corruption {
        file_id: u32,
        offset: u64,
        reason: String,
    },

    /// Operation on a cache that is not open
    #[error("Cache is not open")]
    NotOpen,

    /// Open called on a cache that is already open
    #[error("Cache is already open")]
    AlreadyOpen,

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for backpressure conditions the caller may retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_))
    }

    pub(crate) fn corruption(file_id: u32, offset: u64, reason: impl Into<String>) -> Self {
        Error::Corruption {
            file_id,
            offset,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ResourceExhausted("queue full".into()).is_retryable());
        assert!(!Error::NotOpen.is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
    }

    #[test]
    fn test_corruption_display() {
        let err = Error::corruption(7, 4096, "checksum mismatch");
        assert_eq!(
            err.to_string(),
            "Corrupt record in cache file 7 at offset 4096: checksum mismatch"
        );
    }
}
