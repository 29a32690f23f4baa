//! Controller error types.
//!
//! The taxonomy distinguishes errors the scheduler retries (version
//! conflicts that exhausted their local budget) from errors that are
//! absorbed at the point of occurrence (cardinality rejections, publish
//! failures). No error in this module is ever fatal to the process; the
//! one startup-time exception is a secured exporter that never receives a
//! valid certificate bundle, which refuses to start.

use thiserror::Error;

/// Controller error type.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Resource deleted between event and fetch. Not an error condition;
    /// surfaced only so callers can count it.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency collision on a status update.
    #[error("Version conflict on {key}: expected resource version {expected}")]
    VersionConflict { key: String, expected: u64 },

    /// Local retry budget for status persistence exhausted.
    #[error("Persistence failed for {key} after {attempts} attempts")]
    PersistenceFailure { key: String, attempts: u32 },

    /// Malformed, mismatched or expired certificate material.
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Metric label-set explosion; the sample was rejected and counted.
    #[error("Cardinality limit exceeded for metric {0}")]
    CardinalityExceeded(String),

    /// Publish enqueue or delivery failed. Isolated to the publisher.
    #[error("Publish failure: {0}")]
    PublishFailure(String),

    /// Publish event evicted under the drop-oldest queue policy.
    #[error("Publish event dropped")]
    PublishDropped,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Whether the external scheduler should requeue the reconcile that
    /// produced this error.
    ///
    /// `NotFound` is terminal (the resource is gone), publish-side errors
    /// never reach the scheduler, and configuration errors are caught at
    /// startup. Only persistence-path errors are worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControllerError::VersionConflict { .. } | ControllerError::PersistenceFailure { .. }
        )
    }
}
