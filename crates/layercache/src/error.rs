//! Error types for the layering cache.

use std::time::Duration;

use crate::store::StoreError;

/// Boxed error returned by caller-supplied loaders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by cache operations.
///
/// Store failures are usually absorbed at the [`LayeringCache`](crate::LayeringCache)
/// boundary and only logged; `Backend` reaches the caller from the tier
/// types themselves or from administrative operations such as stats listing.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The caller's loader returned an error.
    #[error("loader failed for key '{key}': {source}")]
    Load {
        key: String,
        #[source]
        source: BoxError,
    },

    /// The caller's loader did not finish within the configured timeout.
    #[error("loader for key '{key}' timed out after {timeout:?}")]
    LoadTimeout { key: String, timeout: Duration },

    /// The distributed store could not serve the request.
    #[error("distributed store error: {0}")]
    Backend(#[from] StoreError),

    /// A value could not be encoded or decoded by the configured serializer.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid settings or a cache registered under a conflicting type.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CacheError {
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error means the distributed tier is unreachable, in which
    /// case callers degrade instead of failing.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_keeps_source() {
        let err = CacheError::Load {
            key: "user:1".to_string(),
            source: "db down".into(),
        };
        assert_eq!(err.to_string(), "loader failed for key 'user:1': db down");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_backend_classification() {
        let err = CacheError::from(StoreError::Unavailable);
        assert!(err.is_backend());
        assert!(!CacheError::config("bad").is_backend());
    }
}
