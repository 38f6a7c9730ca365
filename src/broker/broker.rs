use async_trait::async_trait;
use std::fmt;

use crate::message::bucket::Bucket;
use crate::message::message::Message;
use crate::message::parameters::Parameters;
use crate::message::routing::RoutingKey;
use crate::runner::error::WorkerError;

/// Which structure of a logical queue a consumer reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerCategory {
    /// Ready messages (and, for polling engines, due delayed ones).
    Normal,
    Delayed,
    Dead,
}

/// Sub-structure of a logical queue holding a message at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Structure {
    Ready,
    Delayed,
    Dead,
}

impl Structure {
    pub const ALL: [Structure; 3] = [Structure::Ready, Structure::Delayed, Structure::Dead];

    pub fn as_str(self) -> &'static str {
        match self {
            Structure::Ready => "ready",
            Structure::Delayed => "delayed",
            Structure::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(Structure::Ready),
            "delayed" => Some(Structure::Delayed),
            "dead" => Some(Structure::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for ConsumerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerCategory::Normal => "normal",
            ConsumerCategory::Delayed => "delayed",
            ConsumerCategory::Dead => "dead",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stream of fetched messages bound to one queue, topic filter and category.
///
/// `pause` only stops *new* fetches; messages already buffered stay available
/// to `consume`. `finish` rejects whatever is still buffered so nothing is lost.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn start(&self) -> Result<(), WorkerError>;

    async fn pause(&self);

    async fn unpause(&self);

    async fn finish(&self) -> Result<(), WorkerError>;

    /// Waits for the next message; fails with [`WorkerError::NotStarted`] once the consumer stops.
    async fn consume(&self) -> Result<Message, WorkerError>;
}

/// Storage and lifecycle operations every queueing engine provides.
///
/// State machine per message:
/// `READY|DELAYED -> PROCESSING -> {ack: gone, nack: DEAD, reject: origin, requeue: READY|DELAYED}`.
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<(), WorkerError>;

    async fn disconnect(&self) -> Result<(), WorkerError>;

    /// Store `payload`/`params` under `key.id` and reference it from READY, or
    /// from DELAYED when the parameters imply a future due time.
    async fn enqueue(
        &self,
        key: &RoutingKey,
        payload: &str,
        params: &Parameters,
    ) -> Result<(), WorkerError>;

    async fn get_consumer(
        &self,
        queue: &str,
        topics: Option<Vec<String>>,
        prefetch: usize,
        category: ConsumerCategory,
    ) -> Result<Box<dyn Consumer>, WorkerError>;

    async fn ack(&self, key: &RoutingKey) -> Result<(), WorkerError>;

    async fn nack(&self, key: &RoutingKey) -> Result<(), WorkerError>;

    /// Return an in-flight message to the structure it was fetched from, unchanged.
    async fn reject(&self, key: &RoutingKey) -> Result<(), WorkerError>;

    /// Dispose of the current copy and enqueue `payload`/`params` under the same id.
    async fn requeue(
        &self,
        key: &RoutingKey,
        payload: &str,
        params: &Parameters,
    ) -> Result<(), WorkerError>;

    async fn queue_declare(&self, queue: &str) -> Result<(), WorkerError>;

    async fn queue_flush(&self, queue: &str) -> Result<(), WorkerError>;

    async fn queue_delete(&self, queue: &str) -> Result<(), WorkerError>;

    /// Reclaim messages whose execution timeout elapsed without disposition.
    /// Returns how many were returned to their origin.
    async fn maintenance(&self) -> Result<usize, WorkerError>;

    /// Consumer categories a runner must start per queue to see every due message.
    fn worker_categories(&self) -> Vec<ConsumerCategory> {
        vec![ConsumerCategory::Normal]
    }
}

/// Out-of-band blob storage for arguments and results.
#[async_trait]
pub trait BucketBroker: Send + Sync + 'static {
    async fn connect(&self) -> Result<(), WorkerError>;

    async fn disconnect(&self) -> Result<(), WorkerError>;

    /// `None` when missing or overdue.
    async fn get_bucket(&self, id: &str) -> Result<Option<Bucket>, WorkerError>;

    /// Store under `id`, expiring after the bucket's own ttl if it has one.
    async fn store_bucket(&self, id: &str, bucket: &Bucket) -> Result<(), WorkerError>;

    async fn delete_bucket(&self, id: &str) -> Result<(), WorkerError>;
}

/// Whether `topic` passes a consumer's optional allow-list.
pub fn topic_allowed(topics: Option<&[String]>, topic: &str) -> bool {
    match topics {
        Some(allowed) => allowed.iter().any(|t| t == topic),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_filter() {
        let allowed = vec!["a".to_string(), "b".to_string()];
        assert!(topic_allowed(Some(&allowed), "a"));
        assert!(!topic_allowed(Some(&allowed), "c"));
        assert!(topic_allowed(None, "anything"));
    }

    #[test]
    fn structure_names() {
        for s in Structure::ALL {
            assert_eq!(Structure::parse(s.as_str()), Some(s));
        }
    }
}
