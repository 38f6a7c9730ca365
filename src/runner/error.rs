use redis::RedisError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Broker transport error: {0}")]
    Transport(String),

    #[error("Unknown delivery reference: {0}")]
    UnknownDelivery(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Consumer is not started")]
    NotStarted,

    #[error("Subscription cancelled by the server: {0}")]
    SubscriptionCancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bucket error: {0}")]
    Bucket(String),

    #[error("Runner is already running")]
    AlreadyRunning,

    #[error("Operation timed out")]
    Timeout,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<RedisError> for WorkerError {
    fn from(err: RedisError) -> Self {
        WorkerError::Transport(format!("redis: {err}"))
    }
}

impl From<lapin::Error> for WorkerError {
    fn from(err: lapin::Error) -> Self {
        WorkerError::Transport(format!("amqp: {err}"))
    }
}

impl WorkerError {
    /// Whether a fetch loop should back off and try again instead of giving up on its queue.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Transport(_) => true,
            WorkerError::Timeout => true,
            WorkerError::UnknownDelivery(_) => true,
            WorkerError::Bucket(_) => true,
            _ => false,
        }
    }
}
