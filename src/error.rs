//! Error types for the Floodgate engine.

use std::time::Duration;

use thiserror::Error;

/// Classification of a [`FloodgateError`].
///
/// Callers use the kind to pick a policy (retry, fail-open, fail-closed)
/// without matching on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad configuration, bad rate string, or an unresolvable limit.
    Config,
    /// The remote store could not be reached or rejected our credentials.
    StoreConnectivity,
    /// A store operation did not complete in time.
    StoreTimeout,
    /// The engine (or its store) has been closed.
    EngineClosed,
    /// Internal invariant violation, such as unparseable persisted state.
    Algorithm,
}

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No level of the limit hierarchy yields a limit for the scope
    #[error("No rate limit configured for scope '{scope}' (entity: {entity}, tier: '{tier}')")]
    NoLimit {
        entity: String,
        tier: String,
        scope: String,
    },

    /// Remote store unreachable, connection dropped or authentication failed
    #[error("Store connectivity error: {0}")]
    StoreConnectivity(String),

    /// Store operation exceeded its deadline
    #[error("Store operation '{operation}' timed out after {timeout:?}")]
    StoreTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Operation attempted on a closed component
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Rate limiting algorithm errors
    #[error("Algorithm error: {0}")]
    Algorithm(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FloodgateError {
    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FloodgateError::Config(_) | FloodgateError::NoLimit { .. } | FloodgateError::Io(_) => {
                ErrorKind::Config
            }
            FloodgateError::StoreConnectivity(_) => ErrorKind::StoreConnectivity,
            FloodgateError::StoreTimeout { .. } => ErrorKind::StoreTimeout,
            FloodgateError::Closed(_) => ErrorKind::EngineClosed,
            FloodgateError::Algorithm(_) => ErrorKind::Algorithm,
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StoreConnectivity | ErrorKind::StoreTimeout
        )
    }
}

impl From<redis::RedisError> for FloodgateError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            return FloodgateError::StoreTimeout {
                operation: "redis",
                timeout: Duration::ZERO,
            };
        }

        match err.kind() {
            redis::ErrorKind::TypeError
            | redis::ErrorKind::ResponseError
            | redis::ErrorKind::ParseError => FloodgateError::Algorithm(err.to_string()),
            redis::ErrorKind::InvalidClientConfig => FloodgateError::Config(err.to_string()),
            _ => FloodgateError::StoreConnectivity(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for FloodgateError {
    fn from(err: serde_json::Error) -> Self {
        FloodgateError::Algorithm(format!("corrupt persisted state: {}", err))
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
