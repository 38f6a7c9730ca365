use std::time::Duration;

/// Error type for ? operator compatibility with ActorResult
#[derive(Debug, Clone)]
pub enum ActorError {
    /// Failure worth another attempt, subject to the message's retry budget.
    Retry(String),
    /// Failure that goes straight to dead letters regardless of retries left.
    NonRetry(String),
    /// The handler exceeded its execution timeout.
    Timeout(Duration),
    /// The handler panicked.
    Panic(String),
}

impl ActorError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ActorError::NonRetry(_))
    }

    /// Short error kind stored alongside failed results.
    pub fn kind(&self) -> &'static str {
        match self {
            ActorError::Retry(_) => "retry",
            ActorError::NonRetry(_) => "non_retry",
            ActorError::Timeout(_) => "timeout",
            ActorError::Panic(_) => "panic",
        }
    }
}

impl std::fmt::Display for ActorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorError::Retry(msg) => write!(f, "Retryable error: {}", msg),
            ActorError::NonRetry(msg) => write!(f, "Non-retryable error: {}", msg),
            ActorError::Timeout(after) => write!(f, "Execution timed out after {:?}", after),
            ActorError::Panic(msg) => write!(f, "Handler panicked: {}", msg),
        }
    }
}

impl std::error::Error for ActorError {}

impl From<serde_json::Error> for ActorError {
    fn from(error: serde_json::Error) -> Self {
        if error.is_retryable() {
            ActorError::Retry(format!("JSON error: {}", error))
        } else {
            ActorError::NonRetry(format!("JSON error: {}", error))
        }
    }
}

impl From<std::io::Error> for ActorError {
    fn from(error: std::io::Error) -> Self {
        if error.is_retryable() {
            ActorError::Retry(format!("IO error: {}", error))
        } else {
            ActorError::NonRetry(format!("IO error: {}", error))
        }
    }
}

/// Trait to determine if an error should be retried
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for std::io::Error {
    fn is_retryable(&self) -> bool {
        match self.kind() {
            std::io::ErrorKind::TimedOut => true,
            std::io::ErrorKind::Interrupted => true,
            std::io::ErrorKind::WouldBlock => true,
            std::io::ErrorKind::ConnectionRefused => true,
            std::io::ErrorKind::ConnectionAborted => true,
            std::io::ErrorKind::ConnectionReset => true,
            std::io::ErrorKind::PermissionDenied => false,
            std::io::ErrorKind::NotFound => false,
            std::io::ErrorKind::AlreadyExists => false,
            _ => true,
        }
    }
}

impl RetryableError for serde_json::Error {
    fn is_retryable(&self) -> bool {
        // malformed input stays malformed
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_pick_retry_class() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(ActorError::from(io), ActorError::Retry(_)));

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(ActorError::from(missing), ActorError::NonRetry(_)));

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ActorError::from(json);
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "non_retry");
    }

    #[test]
    fn timeouts_and_panics_are_retryable() {
        assert!(ActorError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ActorError::Panic("boom".into()).is_retryable());
    }
}
