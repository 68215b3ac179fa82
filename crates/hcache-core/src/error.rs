//! Error types for the hierarchical cache.
//!
//! Two families exist:
//!
//! - [`TierError`]: transient failures of a single tier. These are absorbed at
//!   the [`HierarchicalCacheService`](crate::HierarchicalCacheService) boundary
//!   and turned into misses; callers never see them.
//! - [`CacheError`]: defects that make caching unsafe (a key that cannot be
//!   derived deterministically, an invalid configuration, a value that cannot
//!   be encoded). These are surfaced to the caller.

use std::time::Duration;

/// Result type for caller-facing cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Failure of one cache tier.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TierError {
    /// The near cache could not be consulted (e.g. shard lock contention).
    #[error("L1 unavailable: {message}")]
    L1Unavailable {
        /// Description of why the near cache was unavailable.
        message: String,
    },

    /// The far cache could not be reached (connection refused, pool exhausted).
    #[error("L2 unreachable: {message}")]
    L2Unreachable {
        /// Description of the connection failure.
        message: String,
    },

    /// A far cache call did not complete within the request timeout.
    #[error("L2 timed out after {timeout:?}")]
    L2Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The far cache answered, but the exchange failed (bad reply, command error).
    #[error("L2 protocol error: {message}")]
    L2Protocol {
        /// Description of the protocol failure.
        message: String,
    },

    /// The far cache client was given settings it cannot run with.
    #[error("L2 misconfigured: {message}")]
    L2Misconfigured {
        /// Description of the invalid setting.
        message: String,
    },
}

impl TierError {
    /// Creates a new `L1Unavailable` error.
    #[must_use]
    pub fn l1_unavailable(message: impl Into<String>) -> Self {
        Self::L1Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new `L2Unreachable` error.
    #[must_use]
    pub fn l2_unreachable(message: impl Into<String>) -> Self {
        Self::L2Unreachable {
            message: message.into(),
        }
    }

    /// Creates a new `L2Timeout` error.
    #[must_use]
    pub fn l2_timeout(timeout: Duration) -> Self {
        Self::L2Timeout { timeout }
    }

    /// Creates a new `L2Protocol` error.
    #[must_use]
    pub fn l2_protocol(message: impl Into<String>) -> Self {
        Self::L2Protocol {
            message: message.into(),
        }
    }

    /// Creates a new `L2Misconfigured` error.
    #[must_use]
    pub fn l2_misconfigured(message: impl Into<String>) -> Self {
        Self::L2Misconfigured {
            message: message.into(),
        }
    }

    /// Runtime tier failures are transient: they degrade to a miss for that
    /// call. A misconfigured client fails the same way on every attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::L2Misconfigured { .. })
    }

    /// Returns `true` if this is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::L2Timeout { .. })
    }

    /// Low-cardinality label used for metrics.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::L1Unavailable { .. } => "l1_unavailable",
            Self::L2Unreachable { .. } => "unreachable",
            Self::L2Timeout { .. } => "timeout",
            Self::L2Protocol { .. } => "protocol",
            Self::L2Misconfigured { .. } => "misconfigured",
        }
    }
}

/// Errors surfaced to cache callers.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No deterministic key could be derived for the call.
    #[error("Invalid key derivation: {message}")]
    InvalidKeyDerivation {
        /// Description of why the key could not be derived.
        message: String,
    },

    /// The cache configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A value could not be encoded for storage.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the encoding failure.
        message: String,
    },
}

impl CacheError {
    /// Creates a new `InvalidKeyDerivation` error.
    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKeyDerivation {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a key derivation error.
    #[must_use]
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::InvalidKeyDerivation { .. })
    }

    /// Returns `true` if this is a configuration error.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
