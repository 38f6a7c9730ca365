use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actor::actor::{Actor, ActorContext, ActorResult, Outcome};
use crate::actor::converter::Arguments;
use crate::actor::error::ActorError;
use crate::broker::broker::{BucketBroker, MessageBroker};
use crate::message::bucket::{Bucket, ResultBucket};
use crate::message::message::{parse_args_reference, Message};
use crate::runner::error::WorkerError;
use crate::runner::runner::{MetricsSink, NoopMetrics};

/// What the processor did with a message after running its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    DeadLettered,
    /// Requeued with one more attempt counted and a backoff delay.
    Retried,
    /// Requeued for the next occurrence of its recurring schedule.
    Rescheduled,
    /// The handler disposed of the message itself.
    Skipped,
}

/// Executes one message against one actor and disposes of it.
///
/// Handler failures (errors, panics, timeouts) never escape: they become a
/// failed outcome and drive the retry / dead-letter decision. Only broker
/// errors while disposing are returned.
#[derive(Clone)]
pub struct Processor {
    broker: Arc<dyn MessageBroker>,
    args_buckets: Option<Arc<dyn BucketBroker>>,
    result_buckets: Option<Arc<dyn BucketBroker>>,
    metrics: Arc<dyn MetricsSink>,
}

impl Processor {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            args_buckets: None,
            result_buckets: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_args_buckets(mut self, buckets: Option<Arc<dyn BucketBroker>>) -> Self {
        self.args_buckets = buckets;
        self
    }

    pub fn with_result_buckets(mut self, buckets: Option<Arc<dyn BucketBroker>>) -> Self {
        self.result_buckets = buckets;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub async fn process(
        &self,
        actor: &Actor,
        message: Message,
        cancel_token: CancellationToken,
    ) -> Result<Disposition, WorkerError> {
        let message_id = message.id().to_string();
        let topic = message.key.topic().to_string();
        debug!(message_id = %message_id, topic = ?topic, "Processing message");

        let started_when = Utc::now();
        let clock = Instant::now();
        let execution = self.execute(actor, &message, cancel_token).await;
        let finished_when = Utc::now();
        self.metrics
            .observe_duration("message_execution", clock.elapsed());

        let disposition = self.dispose(actor, &message, &execution).await?;
        match (&execution, disposition) {
            (Err(e), Disposition::Retried) => {
                warn!(message_id = %message_id, topic = ?topic, error = %e, "Message failed, retry scheduled")
            }
            (Err(e), _) => {
                error!(message_id = %message_id, topic = ?topic, error = %e, disposition = ?disposition, "Message failed")
            }
            (Ok(_), _) => {
                info!(message_id = %message_id, topic = ?topic, disposition = ?disposition, "Message processed")
            }
        }

        if matches!(disposition, Disposition::Acked) {
            self.drop_args_bucket(&message).await;
        }
        if !matches!(disposition, Disposition::Retried | Disposition::Skipped) {
            self.store_result(actor, &message, &execution, started_when, finished_when)
                .await;
        }
        Ok(disposition)
    }

    async fn execute(
        &self,
        actor: &Actor,
        message: &Message,
        cancel_token: CancellationToken,
    ) -> ActorResult {
        let args = self.prepare_arguments(actor, &message.payload).await?;
        let context = ActorContext {
            key: message.key.clone(),
            parameters: message.parameters.clone(),
            broker: self.broker.clone(),
            cancel_token,
        };
        let timeout = message.parameters.execution_timeout;
        let invocation = AssertUnwindSafe(actor.handler().handle(args, context)).catch_unwind();

        match tokio::time::timeout(timeout, invocation).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ActorError::Panic(panic_message(panic.as_ref()))),
            Err(_elapsed) => Err(ActorError::Timeout(timeout)),
        }
    }

    async fn prepare_arguments(&self, actor: &Actor, payload: &str) -> Result<Arguments, ActorError> {
        let resolved;
        let payload = match parse_args_reference(payload) {
            Some(bucket_id) => {
                resolved = self.resolve_args(&bucket_id).await?;
                resolved.as_str()
            }
            None => payload,
        };
        actor
            .input_converter()
            .convert_inputs(payload)
            .map_err(|e| ActorError::NonRetry(format!("cannot convert inputs: {e}")))
    }

    async fn resolve_args(&self, bucket_id: &str) -> Result<String, ActorError> {
        let buckets = self.args_buckets.as_ref().ok_or_else(|| {
            ActorError::NonRetry(format!(
                "payload references args bucket {bucket_id} but no args bucket broker is configured"
            ))
        })?;
        match buckets.get_bucket(bucket_id).await {
            Ok(Some(bucket)) => bucket
                .into_args()
                .map(|args| args.data)
                .map_err(|e| ActorError::NonRetry(e.to_string())),
            Ok(None) => Err(ActorError::NonRetry(format!(
                "args bucket {bucket_id} is missing or expired"
            ))),
            Err(e) => Err(ActorError::Retry(format!("cannot load args bucket {bucket_id}: {e}"))),
        }
    }

    async fn dispose(
        &self,
        actor: &Actor,
        message: &Message,
        execution: &ActorResult,
    ) -> Result<Disposition, WorkerError> {
        let key = &message.key;
        let params = &message.parameters;

        if let Ok(Outcome::NoAction) = execution {
            return Ok(Disposition::Skipped);
        }

        if let Err(e) = execution {
            if e.is_retryable() && params.retries.already_tried < params.retries.max_amount {
                let backoff = actor
                    .policy()
                    .backoff(params.retries.already_tried.saturating_add(1));
                let next = params.for_retry(backoff, Utc::now());
                self.broker.requeue(key, &message.payload, &next).await?;
                self.metrics.inc_counter("message_retried", 1);
                return Ok(Disposition::Retried);
            }
        }

        if params.delay.is_recurring() {
            match params.for_reschedule(Utc::now()) {
                Ok(next) => {
                    self.broker.requeue(key, &message.payload, &next).await?;
                    self.metrics.inc_counter("message_rescheduled", 1);
                    return Ok(Disposition::Rescheduled);
                }
                Err(e) => {
                    error!(message_id = %key.id(), error = %e, "Cannot compute next occurrence");
                }
            }
        }

        if execution.is_ok() {
            self.broker.ack(key).await?;
            self.metrics.inc_counter("message_acked", 1);
            Ok(Disposition::Acked)
        } else {
            self.broker.nack(key).await?;
            self.metrics.inc_counter("message_dead_lettered", 1);
            Ok(Disposition::DeadLettered)
        }
    }

    async fn store_result(
        &self,
        actor: &Actor,
        message: &Message,
        execution: &ActorResult,
        started_when: DateTime<Utc>,
        finished_when: DateTime<Utc>,
    ) {
        let (Some(buckets), Some(result)) = (&self.result_buckets, &message.parameters.result)
        else {
            return;
        };

        let (data, success, exception) = match execution {
            Ok(Outcome::Success(value)) => {
                let value = value.clone().unwrap_or(serde_json::Value::Null);
                match actor.input_converter().convert_outputs(&value) {
                    Ok(data) => (data, true, None),
                    Err(e) => (e.to_string(), false, Some("conversion".to_string())),
                }
            }
            Ok(Outcome::NoAction) => return,
            Err(e) => (e.to_string(), false, Some(e.kind().to_string())),
        };

        let bucket = Bucket::Result(ResultBucket {
            data,
            started_when,
            finished_when,
            success,
            exception,
            timestamp: Utc::now(),
            ttl: result.ttl,
        });
        if let Err(e) = buckets.store_bucket(&result.id, &bucket).await {
            error!(message_id = %message.id(), result_id = %result.id, error = %e, "Failed to store result");
        }
    }

    async fn drop_args_bucket(&self, message: &Message) {
        let (Some(buckets), Some(bucket_id)) =
            (&self.args_buckets, parse_args_reference(&message.payload))
        else {
            return;
        };
        if let Err(e) = buckets.delete_bucket(&bucket_id).await {
            warn!(message_id = %message.id(), bucket_id = %bucket_id, error = %e, "Failed to delete args bucket");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::actor::handler_fn;
    use crate::actor::retry::FixedBackoff;
    use crate::broker::broker::ConsumerCategory;
    use crate::broker::consumer::PollSource;
    use crate::broker::memory::{MemoryBroker, MemoryBucketBroker};
    use crate::message::bucket::ArgsBucket;
    use crate::message::message::args_reference;
    use crate::message::parameters::{DelayProperties, Parameters, ResultProperties};
    use crate::message::routing::{Priority, RoutingKey};
    use std::time::Duration;

    async fn setup() -> (MemoryBroker, Processor) {
        let broker = MemoryBroker::default();
        broker.connect().await.unwrap();
        let processor = Processor::new(Arc::new(broker.clone()));
        (broker, processor)
    }

    async fn claim(broker: &MemoryBroker, key: &RoutingKey, payload: &str, params: Parameters) -> Message {
        broker.enqueue(key, payload, &params).await.unwrap();
        broker
            .fetch(key.queue(), ConsumerCategory::Normal, Priority::ALL)
            .await
            .unwrap()
            .expect("message should be fetchable")
    }

    fn failing() -> Actor {
        Actor::new(
            "fail",
            handler_fn(|_: Arguments, _: ActorContext| async {
                ActorResult::Err(ActorError::Retry("downstream unavailable".into()))
            }),
        )
        .unwrap()
        .retry_policy(FixedBackoff(Duration::ZERO))
    }

    #[tokio::test]
    async fn retry_increments_attempts_and_keeps_id() {
        let (broker, processor) = setup().await;
        let key = RoutingKey::new("r1", "fail", "default", Priority::Medium).unwrap();
        let message = claim(&broker, &key, "[]", Parameters::new().with_retries(2)).await;

        let disposition = processor.process(&failing(), message, CancellationToken::new()).await.unwrap();
        assert_eq!(disposition, Disposition::Retried);

        // zero backoff: due immediately
        tokio::time::sleep(Duration::from_millis(5)).await;
        let again = broker
            .fetch("default", ConsumerCategory::Normal, Priority::ALL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id(), "r1");
        assert_eq!(again.parameters.retries.already_tried, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_and_store_failure() {
        let (broker, processor) = setup().await;
        let results = MemoryBucketBroker::new();
        results.connect().await.unwrap();
        let processor = processor.with_result_buckets(Some(Arc::new(results.clone())));

        let key = RoutingKey::new("r2", "fail", "default", Priority::Low).unwrap();
        let params = Parameters::new().with_result(ResultProperties {
            id: "res-r2".into(),
            ttl: None,
        });
        let message = claim(&broker, &key, "[]", params).await;

        let disposition = processor.process(&failing(), message, CancellationToken::new()).await.unwrap();
        assert_eq!(disposition, Disposition::DeadLettered);
        assert_eq!(broker.stats("default").await.dead, 1);

        let stored = results.get_bucket("res-r2").await.unwrap().unwrap().into_result().unwrap();
        assert!(!stored.success);
        assert_eq!(stored.exception.as_deref(), Some("retry"));
    }

    #[tokio::test]
    async fn timeouts_count_as_failures() {
        let (broker, processor) = setup().await;
        let slow = Actor::new(
            "slow",
            handler_fn(|_: Arguments, _: ActorContext| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ActorResult::Ok(Outcome::Success(None))
            }),
        )
        .unwrap();
        let key = RoutingKey::new("t1", "slow", "default", Priority::High).unwrap();
        let params = Parameters::new().with_execution_timeout(Duration::from_millis(20));
        let message = claim(&broker, &key, "[]", params).await;

        let disposition = processor.process(&slow, message, CancellationToken::new()).await.unwrap();
        assert_eq!(disposition, Disposition::DeadLettered);
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let (broker, processor) = setup().await;
        let panicking = Actor::new(
            "boom",
            handler_fn(|_: Arguments, _: ActorContext| async {
                if true {
                    panic!("handler bug");
                }
                ActorResult::Ok(Outcome::Success(None))
            }),
        )
        .unwrap();
        let key = RoutingKey::new("p1", "boom", "default", Priority::High).unwrap();
        let message = claim(&broker, &key, "[]", Parameters::new()).await;

        let disposition = processor.process(&panicking, message, CancellationToken::new()).await.unwrap();
        assert_eq!(disposition, Disposition::DeadLettered);
    }

    #[tokio::test]
    async fn recurring_success_is_rescheduled() {
        let (broker, processor) = setup().await;
        let ok = Actor::new(
            "tick",
            handler_fn(|_: Arguments, _: ActorContext| async { ActorResult::Ok(Outcome::Success(None)) }),
        )
        .unwrap();
        let key = RoutingKey::new("c1", "tick", "default", Priority::Medium).unwrap();
        let params = Parameters::new().with_delay(DelayProperties {
            defer_by: Some(Duration::from_millis(50)),
            ..DelayProperties::default()
        });
        broker.enqueue(&key, "[]", &params).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let message = broker
            .fetch("default", ConsumerCategory::Normal, Priority::ALL)
            .await
            .unwrap()
            .unwrap();

        let disposition = processor.process(&ok, message, CancellationToken::new()).await.unwrap();
        assert_eq!(disposition, Disposition::Rescheduled);
        let stats = broker.stats("default").await;
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn args_are_resolved_from_buckets() {
        let (broker, processor) = setup().await;
        let args = MemoryBucketBroker::new();
        args.connect().await.unwrap();
        args.store_bucket("a1", &Bucket::Args(ArgsBucket::new("[20, 22]", None)))
            .await
            .unwrap();
        let processor = processor.with_args_buckets(Some(Arc::new(args.clone())));

        let sum = Actor::new(
            "sum",
            handler_fn(|args: Arguments, _: ActorContext| async move {
                let total: i64 = args.args.iter().filter_map(|v| v.as_i64()).sum();
                if total == 42 {
                    ActorResult::Ok(Outcome::Success(Some(total.into())))
                } else {
                    ActorResult::Err(ActorError::NonRetry(format!("got {total}")))
                }
            }),
        )
        .unwrap();
        let key = RoutingKey::new("s1", "sum", "default", Priority::Medium).unwrap();
        let message = claim(&broker, &key, &args_reference("a1").unwrap(), Parameters::new()).await;

        let disposition = processor.process(&sum, message, CancellationToken::new()).await.unwrap();
        assert_eq!(disposition, Disposition::Acked);
        assert!(args.get_bucket("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_action_leaves_message_to_the_handler() {
        let (broker, processor) = setup().await;
        let self_acking = Actor::new(
            "manual",
            handler_fn(|_: Arguments, ctx: ActorContext| async move {
                ctx.broker
                    .ack(&ctx.key)
                    .await
                    .map_err(|e| ActorError::Retry(e.to_string()))?;
                ActorResult::Ok(Outcome::NoAction)
            }),
        )
        .unwrap();
        let key = RoutingKey::new("n1", "manual", "default", Priority::Medium).unwrap();
        let message = claim(&broker, &key, "[]", Parameters::new()).await;

        let disposition = processor.process(&self_acking, message, CancellationToken::new()).await.unwrap();
        assert_eq!(disposition, Disposition::Skipped);
        assert_eq!(broker.stats("default").await, Default::default());
    }
}
