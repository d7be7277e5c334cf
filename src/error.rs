//! Error types for keystack
//!
//! Provides a unified error type for every data interface and layer.

use thiserror::Error;

/// Result type alias using KeystackError
pub type Result<T> = std::result::Result<T, KeystackError>;

/// Unified error type for keystack operations
#[derive(Debug, Error)]
pub enum KeystackError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Backend Errors
    // -------------------------------------------------------------------------
    /// The wrapped storage engine failed, or cannot keep up (stalled flush).
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Data corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Merge Errors
    // -------------------------------------------------------------------------
    /// A combinator refused to merge two values written to the same key.
    #[error("Merge conflict on key {key}: {reason}")]
    MergeConflict { key: i64, reason: String },

    // -------------------------------------------------------------------------
    // Bloom Filter Errors
    // -------------------------------------------------------------------------
    #[error(
        "Bloom filter rebuild of '{name}' saw {observed} keys, \
         far more than the expected {expected}"
    )]
    SizeEstimateViolation {
        name: String,
        observed: u64,
        expected: u64,
    },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Data interface '{0}' is closed")]
    Closed(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl KeystackError {
    /// Build a merge conflict for `key`
    pub fn merge_conflict(key: i64, reason: impl Into<String>) -> Self {
        KeystackError::MergeConflict {
            key,
            reason: reason.into(),
        }
    }

    pub fn is_merge_conflict(&self) -> bool {
        matches!(self, KeystackError::MergeConflict { .. })
    }
}

impl From<bincode::Error> for KeystackError {
    fn from(e: bincode::Error) -> Self {
        KeystackError::Serialization(e.to_string())
    }
}
