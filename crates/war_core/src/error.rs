//! Error types shared by every component.

use thiserror::Error;

/// Result type alias using [`WarError`].
pub type Result<T> = std::result::Result<T, WarError>;

/// Top-level error type for all simulation components.
///
/// Errors are `Clone` because they travel inside result values
/// (`TransactionResult`, `CommandResult`) delivered over channels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WarError {
    /// Bad input from the caller. Never retried automatically.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced entity does not exist (or no longer exists).
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of entity (unit, resource, reservation, battle).
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Duplicate registration attempt.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Kind of entity.
        kind: &'static str,
        /// Identifier that collided.
        id: String,
    },

    /// Transient capacity exhaustion. Safe to retry or drop.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// The component is shutting down or has shut down.
    #[error("{0} is shutting down")]
    ShuttingDown(String),

    /// A bounded wait elapsed without resolution. The request had no effect.
    #[error("timed out after {millis}ms: {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Elapsed bound in milliseconds.
        millis: u64,
    },

    /// A resource transaction could not be satisfied.
    ///
    /// Only ever carried inside a `TransactionResult`, never raised.
    #[error("Insufficient resources: {}", .resources.join(", "))]
    InsufficientResources {
        /// Names of the resources that failed their bounds check.
        resources: Vec<String>,
    },

    /// Operation not legal in the entity's current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Data file parsing error.
    #[error("Failed to parse data '{source_name}': {message}")]
    DataParse {
        /// Name of the data source that failed to parse.
        source_name: String,
        /// Error message.
        message: String,
    },
}

impl WarError {
    /// Shorthand for [`WarError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for [`WarError::AlreadyExists`].
    pub fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for [`WarError::Timeout`].
    pub fn timeout(operation: impl Into<String>, bound: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            millis: bound.as_millis() as u64,
        }
    }

    /// Whether the caller may retry the same request later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Backpressure(_) | Self::Timeout { .. })
    }
}
