use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::actor::actor::DEFAULT_QUEUE;
use crate::broker::broker::BucketBroker;
use crate::connection::Connection;
use crate::message::bucket::{ArgsBucket, Bucket, ResultBucket};
use crate::message::message::args_reference;
use crate::message::parameters::{Parameters, ResultProperties};
use crate::message::routing::{new_id, Priority, RoutingKey};
use crate::runner::error::WorkerError;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Builder for enqueuing one message with fluent configuration.
///
/// # Examples
///
/// ```rust,no_run
/// use dispatch_q::{Connection, Job, Priority};
/// use serde_json::json;
/// use std::time::Duration;
///
/// # async fn example(conn: &Connection) -> Result<(), dispatch_q::WorkerError> {
/// let handle = Job::new(conn, "send_email")
///     .payload(json!({"to": "user@example.com", "subject": "Hello"}))
///     .priority(Priority::High)
///     .retries(5)
///     .execution_timeout(Duration::from_secs(60))
///     .store_result(Some(Duration::from_secs(3600)))
///     .enqueue()
///     .await?;
/// let outcome = handle.result(Duration::from_secs(30)).await?;
/// # Ok(())
/// # }
/// ```
pub struct Job<'a> {
    connection: &'a Connection,
    topic: String,
    queue: String,
    priority: Priority,
    id: Option<String>,
    payload: Value,
    parameters: Parameters,
    result_ttl: Option<Option<Duration>>,
    args_ttl: Option<Option<Duration>>,
}

impl<'a> Job<'a> {
    pub fn new(connection: &'a Connection, topic: impl Into<String>) -> Self {
        Self {
            connection,
            topic: topic.into(),
            queue: DEFAULT_QUEUE.to_string(),
            priority: Priority::default(),
            id: None,
            payload: Value::Array(Vec::new()),
            parameters: Parameters::new(),
            result_ttl: None,
            args_ttl: None,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Explicit message id; defaults to a fresh UUID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Handler input: an array for positional arguments, an object for
    /// keyword arguments, or `{"args": [...], "kwargs": {...}}` for both.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.parameters.execution_timeout = timeout;
        self
    }

    pub fn retries(mut self, max_amount: u32) -> Self {
        self.parameters.retries.max_amount = max_amount;
        self
    }

    /// Dead-letter without execution once this much time passed since enqueue.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.parameters.ttl = Some(ttl);
        self
    }

    pub fn delay_until(mut self, at: DateTime<Utc>) -> Self {
        self.parameters.delay.delay_until = Some(at);
        self
    }

    /// Run every `period`, starting one period after enqueue.
    pub fn defer_by(mut self, period: Duration) -> Self {
        self.parameters.delay.defer_by = Some(period);
        self
    }

    /// Run on a cron schedule (five fields, or six/seven with seconds).
    pub fn cron(mut self, expression: impl Into<String>) -> Self {
        self.parameters.delay.cron = Some(expression.into());
        self
    }

    /// Keep the outcome in the connection's result bucket broker.
    pub fn store_result(mut self, ttl: Option<Duration>) -> Self {
        self.result_ttl = Some(ttl);
        self
    }

    /// Store the payload in the connection's args bucket broker and enqueue a
    /// reference to it instead.
    pub fn args_in_bucket(mut self, ttl: Option<Duration>) -> Self {
        self.args_ttl = Some(ttl);
        self
    }

    /// Validates and enqueues the job.
    ///
    /// # Errors
    ///
    /// - `WorkerError::Validation` for malformed names or parameters.
    /// - `WorkerError::Config` when buckets are requested but the connection has none.
    /// - Transport errors from the brokers.
    pub async fn enqueue(self) -> Result<JobHandle, WorkerError> {
        let id = self.id.unwrap_or_else(new_id);
        let key = RoutingKey::new(id, self.topic, self.queue, self.priority)?;

        let mut parameters = self.parameters.with_timestamp(Utc::now());
        let mut result_buckets = None;
        if let Some(ttl) = self.result_ttl {
            result_buckets = Some(self.connection.result_bucket_broker().ok_or_else(|| {
                WorkerError::Config("store_result needs a result bucket broker".into())
            })?);
            parameters.result = Some(ResultProperties {
                id: format!("{}-result", key.id()),
                ttl,
            });
        }
        parameters.validate()?;

        let mut payload = serde_json::to_string(&self.payload)?;
        let mut stored_args = None;
        if let Some(ttl) = self.args_ttl {
            let args = self.connection.args_bucket_broker().ok_or_else(|| {
                WorkerError::Config("args_in_bucket needs an args bucket broker".into())
            })?;
            let bucket_id = format!("{}-args", key.id());
            args.store_bucket(&bucket_id, &Bucket::Args(ArgsBucket::new(payload, ttl)))
                .await?;
            payload = args_reference(&bucket_id)?;
            stored_args = Some((args, bucket_id));
        }

        if let Err(e) = self
            .connection
            .broker()
            .enqueue(&key, &payload, &parameters)
            .await
        {
            if let Some((args, bucket_id)) = stored_args {
                if let Err(cleanup) = args.delete_bucket(&bucket_id).await {
                    warn!(bucket_id = %bucket_id, error = %cleanup, "Failed to delete orphaned args bucket");
                }
            }
            return Err(e);
        }
        debug!(message_id = %key.id(), topic = ?key.topic(), queue = %key.queue(), "Job enqueued");

        Ok(JobHandle {
            result_id: parameters.result.map(|result| result.id),
            result_buckets,
            key,
        })
    }
}

/// Handle to an enqueued job.
#[derive(Clone)]
pub struct JobHandle {
    key: RoutingKey,
    result_id: Option<String>,
    result_buckets: Option<Arc<dyn BucketBroker>>,
}

impl JobHandle {
    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    /// The stored outcome, if it is there yet.
    pub async fn try_result(&self) -> Result<Option<ResultBucket>, WorkerError> {
        let (Some(buckets), Some(result_id)) = (&self.result_buckets, &self.result_id) else {
            return Err(WorkerError::Config(
                "job was enqueued without store_result".into(),
            ));
        };
        buckets
            .get_bucket(result_id)
            .await?
            .map(Bucket::into_result)
            .transpose()
    }

    /// Polls for the stored outcome until `timeout`.
    ///
    /// # Errors
    ///
    /// `WorkerError::Timeout` if no result appeared in time.
    pub async fn result(&self, timeout: Duration) -> Result<ResultBucket, WorkerError> {
        let start_time = Instant::now();
        loop {
            if let Some(result) = self.try_result().await? {
                return Ok(result);
            }
            if start_time.elapsed() > timeout {
                return Err(WorkerError::Timeout);
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("key", &self.key)
            .field("result_id", &self.result_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::broker::{ConsumerCategory, MessageBroker};
    use crate::broker::consumer::PollSource;
    use crate::broker::memory::{MemoryBroker, MemoryBucketBroker};
    use crate::message::message::parse_args_reference;
    use serde_json::json;

    async fn connection(broker: &MemoryBroker) -> Connection {
        let conn = Connection::new(Arc::new(broker.clone()))
            .with_args_bucket_broker(Arc::new(MemoryBucketBroker::new()))
            .with_result_bucket_broker(Arc::new(MemoryBucketBroker::new()));
        conn.connect().await.unwrap();
        conn
    }

    #[tokio::test]
    async fn enqueues_with_defaults() {
        let broker = MemoryBroker::default();
        let conn = connection(&broker).await;
        let handle = Job::new(&conn, "ping").payload(json!([1])).enqueue().await.unwrap();

        let message = broker
            .fetch(DEFAULT_QUEUE, ConsumerCategory::Normal, Priority::ALL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id(), handle.id());
        assert_eq!(message.key.priority(), Priority::Medium);
        assert_eq!(message.payload, "[1]");
        assert!(matches!(handle.try_result().await, Err(WorkerError::Config(_))));
    }

    #[tokio::test]
    async fn args_go_to_the_bucket() {
        let broker = MemoryBroker::default();
        let conn = connection(&broker).await;
        Job::new(&conn, "big")
            .id("j1")
            .payload(json!({"blob": "x"}))
            .args_in_bucket(None)
            .enqueue()
            .await
            .unwrap();

        let message = broker
            .fetch(DEFAULT_QUEUE, ConsumerCategory::Normal, Priority::ALL)
            .await
            .unwrap()
            .unwrap();
        let bucket_id = parse_args_reference(&message.payload).unwrap();
        let stored = conn
            .args_bucket_broker()
            .unwrap()
            .get_bucket(&bucket_id)
            .await
            .unwrap()
            .unwrap()
            .into_args()
            .unwrap();
        assert_eq!(stored.data, r#"{"blob":"x"}"#);
    }

    #[tokio::test]
    async fn failed_enqueue_drops_the_args_bucket() {
        let broker = MemoryBroker::default();
        let conn = connection(&broker).await;
        MessageBroker::disconnect(&broker).await.unwrap();

        let result = Job::new(&conn, "big")
            .id("j2")
            .payload(json!({"blob": "x"}))
            .args_in_bucket(None)
            .enqueue()
            .await;
        assert!(result.is_err());
        let args = conn.args_bucket_broker().unwrap();
        assert!(args.get_bucket("j2-args").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_jobs_never_reach_the_broker() {
        let broker = MemoryBroker::default();
        let conn = connection(&broker).await;
        assert!(Job::new(&conn, "1bad").enqueue().await.is_err());
        assert!(Job::new(&conn, "t")
            .defer_by(Duration::from_secs(1))
            .cron("* * * * *")
            .enqueue()
            .await
            .is_err());

        let bare = Connection::new(Arc::new(broker.clone()));
        assert!(matches!(
            Job::new(&bare, "t").store_result(None).enqueue().await,
            Err(WorkerError::Config(_))
        ));
        assert_eq!(broker.stats(DEFAULT_QUEUE).await.ready, 0);
    }

    #[tokio::test]
    async fn result_times_out_when_nobody_runs_the_job() {
        let broker = MemoryBroker::default();
        let conn = connection(&broker).await;
        let handle = Job::new(&conn, "t")
            .store_result(None)
            .enqueue()
            .await
            .unwrap();
        assert!(matches!(
            handle.result(Duration::from_millis(150)).await,
            Err(WorkerError::Timeout)
        ));
    }
}
