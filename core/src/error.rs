use thiserror::Error;

/// Errors raised by the message-handling engine and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid handler/hook configuration: bad regex, template syntax,
    /// keyboard literal or markup. Raised at save time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A template failed at render time despite save-time validation.
    #[error("render error: {0}")]
    Render(String),

    /// Outbound HTTP failure. Converted into a sentinel response by the executor.
    #[error("upstream request error: {0}")]
    Upstream(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("invalid webhook signature")]
    Signature,

    /// Referential integrity violation (e.g. deleting a state still in use).
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The platform send API rejected or failed to deliver a message.
    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
