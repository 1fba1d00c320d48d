use thiserror::Error;

/// Common error types used across the dispatch core.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The backing store failed in a way that is safe to retry.
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// The entry's bytes could not be decoded into an event. Terminal:
    /// retrying cannot fix the bytes, so the entry goes to the dead-letter
    /// queue immediately.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The producer exhausted its local retry budget without a durable
    /// enqueue. The only failure producers ever see.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// A push to at least one live subscriber failed; the event will be
    /// retried or dead-lettered by the worker.
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// The event reached the retry ceiling and was dead-lettered.
    #[error("Max delivery attempts exceeded ({attempts})")]
    MaxAttemptsExceeded { attempts: u32 },

    /// Producer input validation failed (empty recipient or topic).
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// Whether a retry with backoff is a sensible response to this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::TransientStore(_))
    }
}

impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        DispatchError::TransientStore(err.to_string())
    }
}
