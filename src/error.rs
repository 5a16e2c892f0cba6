//! Error types for cache operations
//!
//! Most store and engine operations degrade silently (miss, `false`, `0`)
//! and only log. The variants below surface where a caller needs the
//! failure: startup, health checks, flushes and rule/strategy management.

use thiserror::Error;

/// Main error type for the caching subsystem
#[derive(Error, Debug)]
pub enum CacheError {
    /// Connection error - the backend could not be reached
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Connection attempts exhausted during startup
    #[error("Connection failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Required environment variables are absent
    #[error("Missing required environment variables: {}", .0.join(", "))]
    MissingEnvironment(Vec<String>),

    /// Key-value backend command failure
    #[error("Backend error: {0}")]
    BackendError(#[from] redis::RedisError),

    /// Neo4rs driver error (wrapper)
    #[error("Neo4rs driver error: {0}")]
    DriverError(#[from] neo4rs::Error),

    /// Query execution error reported by a query executor
    #[error("Query error: {0}")]
    QueryError(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Payload compression or decompression failure
    #[error("Compression error: {0}")]
    CompressionError(String),

    /// No invalidation rule with the given id
    #[error("Invalidation rule not found: {0}")]
    RuleNotFound(String),

    /// A rule with the same id is already registered
    #[error("Invalidation rule already exists: {0}")]
    DuplicateRule(String),

    /// No warming strategy with the given name
    #[error("Warming strategy not found: {0}")]
    StrategyNotFound(String),

    /// The warming strategy exists but is disabled
    #[error("Warming strategy is disabled: {0}")]
    StrategyDisabled(String),

    /// Invalid schedule expression
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}
