use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broker::broker::{Consumer, ConsumerCategory, MessageBroker, Structure};
use crate::broker::consumer::{PollSettings, PollSource, PollingConsumer};
use crate::broker::naming::{QueueNaming, RedisNaming};
use crate::broker::redis::lua::Scripts;
use crate::broker::redis::pool::{checkout, PoolSlot, RedisConfig};
use crate::config::BrokerConfig;
use crate::message::message::Message;
use crate::message::parameters::Parameters;
use crate::message::routing::{validate_name, Priority, RoutingKey};
use crate::runner::error::WorkerError;

/// Redis queueing engine: per-tier ready lists, delayed sorted sets scored by
/// due time, dead lists, a hash per message and one processing index scored
/// by `start + execution_timeout`.
///
/// Duplicate policy: rejecting, the first copy of an id is kept and later
/// enqueues are ignored with a warning.
#[derive(Clone)]
pub struct RedisBroker {
    inner: Arc<RedisInner>,
}

struct RedisInner {
    slot: PoolSlot,
    naming: RedisNaming,
    scripts: Scripts,
    settings: PollSettings,
}

impl RedisBroker {
    pub fn new(
        redis_url: &str,
        redis_config: RedisConfig,
        config: &BrokerConfig,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RedisInner {
                slot: PoolSlot::new(redis_url, redis_config),
                naming: RedisNaming::new(config.key_prefix.clone()),
                scripts: Scripts::load(),
                settings: PollSettings::from_config(config)?,
            }),
        })
    }

    fn message_prefix(&self) -> String {
        format!("{}:m:", self.inner.naming.prefix())
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.inner.naming.prefix())
    }

    /// Runs ENQUEUE or REQUEUE; returns the script's stored flag.
    async fn store(
        &self,
        script: &Script,
        with_processing: bool,
        key: &RoutingKey,
        payload: &str,
        params: &Parameters,
    ) -> Result<i64, WorkerError> {
        params.validate()?;
        let due = params
            .due_time(Utc::now())?
            .map(|due| due.timestamp_millis().to_string())
            .unwrap_or_default();
        let envelope = Message::new(key.clone(), payload, params.clone()).encode()?;
        let timeout_ms = u64::try_from(params.execution_timeout.as_millis()).unwrap_or(u64::MAX);

        let naming = &self.inner.naming;
        let mut invocation = script.prepare_invoke();
        invocation
            .key(naming.message(key.id()))
            .key(naming.resource(key.queue(), key.priority(), Structure::Ready))
            .key(naming.resource(key.queue(), key.priority(), Structure::Delayed))
            .key(naming.resource(key.queue(), key.priority(), Structure::Dead));
        if with_processing {
            invocation.key(naming.processing());
        }
        invocation
            .arg(key.id())
            .arg(envelope)
            .arg(due)
            .arg(timeout_ms);

        let pool = self.inner.slot.pool().await?;
        let mut conn = checkout(&pool).await?;
        let stored: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(stored)
    }

    /// Runs ACK, NACK or REJECT for one id; returns 1 when it was in flight.
    async fn dispose(&self, script: &Script, id: &str) -> Result<i64, WorkerError> {
        let pool = self.inner.slot.pool().await?;
        let mut conn = checkout(&pool).await?;
        let outcome: i64 = script
            .key(self.inner.naming.processing())
            .arg(id)
            .arg(self.message_prefix())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut *conn)
            .await?;
        Ok(outcome)
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> Result<(), WorkerError> {
        self.inner.slot.connect().await
    }

    async fn disconnect(&self) -> Result<(), WorkerError> {
        self.inner.slot.disconnect().await;
        Ok(())
    }

    async fn enqueue(
        &self,
        key: &RoutingKey,
        payload: &str,
        params: &Parameters,
    ) -> Result<(), WorkerError> {
        let stored = self
            .store(&self.inner.scripts.enqueue, false, key, payload, params)
            .await?;
        if stored == 0 {
            warn!(message_id = %key.id(), "Message id already enqueued, keeping the first copy");
        } else {
            info!(message_id = %key.id(), queue = %key.queue(), priority = %key.priority(), "Message enqueued");
        }
        Ok(())
    }

    async fn get_consumer(
        &self,
        queue: &str,
        topics: Option<Vec<String>>,
        prefetch: usize,
        category: ConsumerCategory,
    ) -> Result<Box<dyn Consumer>, WorkerError> {
        validate_name("queue", queue)?;
        self.inner.slot.pool().await?;
        Ok(Box::new(PollingConsumer::new(
            self.clone(),
            queue,
            topics,
            prefetch,
            category,
            self.inner.settings.clone(),
        )))
    }

    async fn ack(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        if self.dispose(&self.inner.scripts.ack, key.id()).await? == 0 {
            warn!(message_id = %key.id(), "Ack for a message that is not in flight, ignoring");
            return Ok(());
        }
        debug!(message_id = %key.id(), "Message acked");
        Ok(())
    }

    async fn nack(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        if self.dispose(&self.inner.scripts.nack, key.id()).await? == 0 {
            warn!(message_id = %key.id(), "Nack for an unknown delivery, ignoring");
            return Ok(());
        }
        info!(message_id = %key.id(), queue = %key.queue(), "Message moved to dead letters");
        Ok(())
    }

    async fn reject(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        if self.dispose(&self.inner.scripts.reject, key.id()).await? == 0 {
            warn!(message_id = %key.id(), "Reject for an unknown delivery, ignoring");
        }
        Ok(())
    }

    async fn requeue(
        &self,
        key: &RoutingKey,
        payload: &str,
        params: &Parameters,
    ) -> Result<(), WorkerError> {
        self.store(&self.inner.scripts.requeue, true, key, payload, params)
            .await?;
        debug!(message_id = %key.id(), "Message requeued");
        Ok(())
    }

    async fn queue_declare(&self, queue: &str) -> Result<(), WorkerError> {
        validate_name("queue", queue)?;
        let pool = self.inner.slot.pool().await?;
        let mut conn = checkout(&pool).await?;
        let _: () = conn.sadd(self.queues_key(), queue).await?;
        Ok(())
    }

    async fn queue_flush(&self, queue: &str) -> Result<(), WorkerError> {
        validate_name("queue", queue)?;
        let mut invocation = self.inner.scripts.flush.prepare_invoke();
        invocation.key(self.inner.naming.processing());
        for key in self.inner.naming.queue_keys(queue) {
            invocation.key(key);
        }
        invocation.arg(self.message_prefix());

        let pool = self.inner.slot.pool().await?;
        let mut conn = checkout(&pool).await?;
        let removed: i64 = invocation.invoke_async(&mut *conn).await?;
        info!(queue = %queue, removed, "Queue flushed");
        Ok(())
    }

    async fn queue_delete(&self, queue: &str) -> Result<(), WorkerError> {
        self.queue_flush(queue).await?;
        let pool = self.inner.slot.pool().await?;
        let mut conn = checkout(&pool).await?;
        let _: () = conn.srem(self.queues_key(), queue).await?;
        Ok(())
    }

    async fn maintenance(&self) -> Result<usize, WorkerError> {
        let expired: Vec<String> = {
            let pool = self.inner.slot.pool().await?;
            let mut conn = checkout(&pool).await?;
            conn.zrangebyscore(
                self.inner.naming.processing(),
                "-inf",
                Utc::now().timestamp_millis(),
            )
            .await?
        };

        let mut reclaimed = 0;
        for id in expired {
            // REJECT removes the processing entry first, so a concurrent sweep gets 0 here
            if self.dispose(&self.inner.scripts.reject, &id).await? == 1 {
                debug!(message_id = %id, "Reclaimed abandoned message");
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            info!(reclaimed, "Reclaimed abandoned messages");
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl PollSource for RedisBroker {
    async fn fetch(
        &self,
        queue: &str,
        category: ConsumerCategory,
        order: [Priority; 3],
    ) -> Result<Option<Message>, WorkerError> {
        let naming = &self.inner.naming;
        let mut invocation = self.inner.scripts.fetch.prepare_invoke();
        invocation.key(naming.processing());
        for priority in order {
            for structure in Structure::ALL {
                invocation.key(naming.resource(queue, priority, structure));
            }
        }
        let mode = match category {
            ConsumerCategory::Normal => "normal",
            ConsumerCategory::Delayed => "delayed",
            ConsumerCategory::Dead => "dead",
        };
        invocation
            .arg(Utc::now().timestamp_millis())
            .arg(mode)
            .arg(self.message_prefix());

        let claimed: Option<(String, String)> = {
            let pool = self.inner.slot.pool().await?;
            let mut conn = checkout(&pool).await?;
            invocation.invoke_async(&mut *conn).await?
        };
        let Some((id, envelope)) = claimed else {
            return Ok(None);
        };
        match Message::decode(&envelope) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                error!(message_id = %id, error = %e, "Dropping undecodable message");
                self.dispose(&self.inner.scripts.ack, &id).await?;
                Ok(None)
            }
        }
    }

    async fn reject(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        MessageBroker::reject(self, key).await
    }

    async fn nack(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        MessageBroker::nack(self, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::parameters::DelayProperties;
    use std::time::Duration;
    use testcontainers::{
        core::{IntoContainerPort, WaitFor},
        runners::AsyncRunner,
        ContainerAsync, GenericImage,
    };

    async fn setup_redis_test_environment() -> (String, ContainerAsync<GenericImage>) {
        let container = GenericImage::new("redis", "7.2.4")
            .with_exposed_port(6379.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
            .start()
            .await
            .expect("Failed to start Redis");
        (
            format!(
                "redis://{}:{}",
                container.get_host().await.expect("Failed to get host"),
                container
                    .get_host_port_ipv4(6379.tcp())
                    .await
                    .expect("Failed to get host port")
            ),
            container,
        )
    }

    async fn connected(url: &str) -> RedisBroker {
        let config = RedisConfig {
            max_size: 4,
            min_idle: 1,
            ..Default::default()
        };
        let broker = RedisBroker::new(url, config, &BrokerConfig::default()).unwrap();
        broker.connect().await.unwrap();
        broker
    }

    fn key(id: &str) -> RoutingKey {
        RoutingKey::new(id, "t", "q", Priority::Medium).unwrap()
    }

    #[tokio::test]
    async fn disconnected_broker_reports_transport_error() {
        let broker =
            RedisBroker::new("redis://127.0.0.1:1", RedisConfig::default(), &BrokerConfig::default())
                .unwrap();
        let err = broker
            .enqueue(&key("a"), "{}", &Parameters::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Transport(_)));
    }

    #[tokio::test]
    #[ignore = "needs Docker"]
    async fn message_lifecycle() {
        let (url, _container) = setup_redis_test_environment().await;
        let broker = connected(&url).await;
        let order = Priority::ALL;

        broker.enqueue(&key("a"), "first", &Parameters::new()).await.unwrap();
        // rejecting duplicate policy
        broker.enqueue(&key("a"), "second", &Parameters::new()).await.unwrap();

        let fetched = broker.fetch("q", ConsumerCategory::Normal, order).await.unwrap().unwrap();
        assert_eq!(fetched.payload, "first");
        assert!(broker.fetch("q", ConsumerCategory::Normal, order).await.unwrap().is_none());

        for _ in 0..2 {
            MessageBroker::reject(&broker, &fetched.key).await.unwrap();
            let again = broker.fetch("q", ConsumerCategory::Normal, order).await.unwrap().unwrap();
            assert_eq!(again.id(), "a");
        }

        MessageBroker::nack(&broker, &fetched.key).await.unwrap();
        assert!(broker.fetch("q", ConsumerCategory::Normal, order).await.unwrap().is_none());
        let dead = broker.fetch("q", ConsumerCategory::Dead, order).await.unwrap().unwrap();
        assert_eq!(dead.id(), "a");

        broker.ack(&dead.key).await.unwrap();
        assert!(broker.fetch("q", ConsumerCategory::Dead, order).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "needs Docker"]
    async fn deferred_message_becomes_due() {
        let (url, _container) = setup_redis_test_environment().await;
        let broker = connected(&url).await;
        let params = Parameters::new().with_delay(DelayProperties {
            defer_by: Some(Duration::from_secs(2)),
            ..Default::default()
        });
        broker.enqueue(&key("d"), "{}", &params).await.unwrap();

        assert!(broker.fetch("q", ConsumerCategory::Normal, Priority::ALL).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(2100)).await;
        let due = broker.fetch("q", ConsumerCategory::Delayed, Priority::ALL).await.unwrap();
        assert_eq!(due.map(|m| m.key.id().to_string()).as_deref(), Some("d"));
    }

    #[tokio::test]
    #[ignore = "needs Docker"]
    async fn sweep_reclaims_exactly_once() {
        let (url, _container) = setup_redis_test_environment().await;
        let broker = connected(&url).await;
        let params = Parameters::new().with_execution_timeout(Duration::from_millis(100));
        broker.enqueue(&key("s"), "{}", &params).await.unwrap();
        let abandoned = broker.fetch("q", ConsumerCategory::Normal, Priority::ALL).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let (a, b) = tokio::join!(broker.maintenance(), broker.maintenance());
        assert_eq!(a.unwrap() + b.unwrap(), 1);
        assert_eq!(broker.maintenance().await.unwrap(), 0);

        // a late ack from the first worker must not delete the reclaimed copy
        broker.ack(&abandoned.key).await.unwrap();
        assert!(broker.fetch("q", ConsumerCategory::Normal, Priority::ALL).await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore = "needs Docker"]
    async fn flush_removes_messages_at_rest() {
        let (url, _container) = setup_redis_test_environment().await;
        let broker = connected(&url).await;
        broker.queue_declare("q").await.unwrap();
        broker.enqueue(&key("f1"), "{}", &Parameters::new()).await.unwrap();
        broker.enqueue(&key("f2"), "{}", &Parameters::new()).await.unwrap();
        broker.queue_flush("q").await.unwrap();
        assert!(broker.fetch("q", ConsumerCategory::Normal, Priority::ALL).await.unwrap().is_none());
        // the id is free again
        broker.enqueue(&key("f1"), "again", &Parameters::new()).await.unwrap();
        let fetched = broker.fetch("q", ConsumerCategory::Normal, Priority::ALL).await.unwrap();
        assert_eq!(fetched.map(|m| m.payload).as_deref(), Some("again"));
    }
}
