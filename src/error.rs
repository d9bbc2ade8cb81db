//! Error types shared by every component.

use std::time::Duration;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of one of the collaborating subsystems.
///
/// Each variant names the subsystem that failed rather than the engine behind
/// it, so callers can apply the per-operation policy in [`crate::policy`]
/// without knowing which backend is configured.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistent store unreachable or rejected the statement.
    #[error("storage error: {0}")]
    Storage(String),

    /// Cache service unreachable or rejected the command.
    #[error("cache error: {0}")]
    Cache(String),

    /// Broker unreachable, channel closed or publish refused.
    #[error("queue error: {0}")]
    Queue(String),

    /// Queue payload could not be encoded or decoded.
    #[error("malformed payload: {0}")]
    Payload(String),

    /// Caller supplied an unusable key or value.
    #[error("validation error: {0}")]
    Validation(String),

    /// A bounded wait expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Subsystem label used in logs and health details.
    pub fn subsystem(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Storage(_) => "storage",
            Error::Cache(_) => "cache",
            Error::Queue(_) => "queue",
            Error::Payload(_) => "payload",
            Error::Validation(_) => "validation",
            Error::Timeout(_) => "timeout",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Payload(e.to_string())
    }
}

#[cfg(any(feature = "sqlite", feature = "cockroach"))]
impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::redis::RedisError> for Error {
    fn from(e: deadpool_redis::redis::RedisError) -> Self {
        Error::Cache(e.to_string())
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for Error {
    fn from(e: lapin::Error) -> Self {
        Error::Queue(e.to_string())
    }
}
