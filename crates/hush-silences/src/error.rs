//! Error types for the hush-silences crate.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the silence engine.
#[derive(Debug, Error)]
pub enum SilenceError {
    /// The silence or patch violates a field invariant.
    #[error("validation failed: {reason}")]
    Validation {
        /// The reason validation failed.
        reason: String,
    },

    /// No silence with the given ID exists.
    #[error("silence not found: {id}")]
    NotFound {
        /// The silence ID that was not found.
        id: String,
    },

    /// The durable store could not be reached.
    #[error("silence store unavailable: {reason}")]
    StoreUnavailable {
        /// Description of the store failure.
        reason: String,
    },

    /// The request deadline elapsed while waiting on the store.
    #[error("operation timed out after {after:?}")]
    Timeout {
        /// The deadline that was exceeded.
        after: Duration,
    },

    /// The request was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's version does not match the stored version.
    #[error("concurrent modification of silence {id}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        /// The silence ID.
        id: String,
        /// The version the caller expected.
        expected: u64,
        /// The version currently stored.
        actual: u64,
    },

    /// A bulk request carried more IDs than allowed.
    #[error("bulk request of {requested} ids exceeds the limit of {limit}")]
    BulkLimitExceeded {
        /// Number of IDs in the request.
        requested: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A configuration value could not be used.
    #[error("invalid configuration for {key}: {reason}")]
    Config {
        /// The configuration key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl SilenceError {
    /// Shorthand for a [`SilenceError::Validation`] error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`SilenceError::NotFound`] error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Shorthand for a [`SilenceError::StoreUnavailable`] error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            reason: reason.into(),
        }
    }

    /// Returns true for errors caused by the request itself.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::BulkLimitExceeded { .. })
    }

    /// Returns true if retrying the same request later may succeed.
    ///
    /// The engine never retries internally; this is a hint for the caller.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::Timeout { .. } | Self::ConcurrentModification { .. }
        )
    }

    /// Returns true if the error means the store was unreachable or too slow.
    #[must_use]
    pub const fn is_store_failure(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for SilenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SilenceError {
    fn from(err: std::io::Error) -> Self {
        Self::StoreUnavailable {
            reason: err.to_string(),
        }
    }
}

/// Result type for silence operations.
pub type Result<T> = std::result::Result<T, SilenceError>;
