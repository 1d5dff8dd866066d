use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur in the rate limiter.
///
/// Quota exhaustion is never an error: it is reported as a rejected
/// [`Decision`](crate::limiter::Decision). Only invalid input and
/// collaborator failures surface here.
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalid tenant id: {0}")]
    InvalidTenant(u64),

    #[error("Invalid limits: {0}")]
    InvalidLimits(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for RateLimitError {
    fn from(err: config::ConfigError) -> Self {
        RateLimitError::Config(err.to_string())
    }
}

impl RateLimitError {
    /// Whether the error came from the cache or durable store rather than
    /// from the caller's input.
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(
            self,
            RateLimitError::Redis(_)
                | RateLimitError::Database(_)
                | RateLimitError::Cache(_)
                | RateLimitError::Io(_)
                | RateLimitError::Serialization(_)
        )
    }
}
