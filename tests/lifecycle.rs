use dispatch_q::broker::consumer::PollSource;
use dispatch_q::message::parameters::DelayProperties;
use dispatch_q::{
    handler_fn, WorkerError, Actor, ActorContext, ActorError, ActorResult, Arguments, Connection,
    ConsumerCategory, FixedBackoff, MemoryBroker, MessageBroker, Outcome, Parameters, Priority,
    RoutingKey, Runner,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const QUIET: Duration = Duration::from_millis(300);

async fn broker() -> MemoryBroker {
    let broker = MemoryBroker::default();
    broker.connect().await.unwrap();
    broker.queue_declare("q").await.unwrap();
    broker
}

fn key(id: &str, priority: Priority) -> RoutingKey {
    RoutingKey::new(id, "t", "q", priority).unwrap()
}

fn topics() -> Option<Vec<String>> {
    Some(vec!["t".to_string()])
}

#[tokio::test]
async fn plain_message_is_fetchable_and_ack_is_final() {
    let broker = broker().await;
    broker
        .enqueue(&key("m1", Priority::Medium), "[]", &Parameters::new())
        .await
        .unwrap();

    let consumer = broker
        .get_consumer("q", topics(), 1, ConsumerCategory::Normal)
        .await
        .unwrap();
    consumer.start().await.unwrap();
    let message = tokio::time::timeout(Duration::from_secs(2), consumer.consume())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.id(), "m1");

    broker.ack(&message.key).await.unwrap();
    assert!(tokio::time::timeout(QUIET, consumer.consume()).await.is_err());
    consumer.finish().await.unwrap();

    let dead = broker
        .get_consumer("q", topics(), 1, ConsumerCategory::Dead)
        .await
        .unwrap();
    dead.start().await.unwrap();
    assert!(tokio::time::timeout(QUIET, dead.consume()).await.is_err());
    dead.finish().await.unwrap();
}

#[tokio::test]
async fn nacked_message_is_only_seen_by_dead_consumers() {
    let broker = broker().await;
    broker
        .enqueue(&key("m2", Priority::High), "[]", &Parameters::new())
        .await
        .unwrap();
    let message = broker
        .fetch("q", ConsumerCategory::Normal, Priority::ALL)
        .await
        .unwrap()
        .unwrap();
    MessageBroker::nack(&broker, &message.key).await.unwrap();

    let normal = broker
        .get_consumer("q", topics(), 1, ConsumerCategory::Normal)
        .await
        .unwrap();
    normal.start().await.unwrap();
    assert!(tokio::time::timeout(QUIET, normal.consume()).await.is_err());
    normal.finish().await.unwrap();

    let dead = broker
        .get_consumer("q", topics(), 1, ConsumerCategory::Dead)
        .await
        .unwrap();
    dead.start().await.unwrap();
    let again = tokio::time::timeout(Duration::from_secs(2), dead.consume())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id(), "m2");

    // rejecting from DEAD keeps it dead
    MessageBroker::reject(&broker, &again.key).await.unwrap();
    dead.finish().await.unwrap();
    let stats = broker.stats("q").await;
    assert_eq!((stats.ready, stats.dead, stats.processing), (0, 1, 0));
}

#[tokio::test]
async fn reject_fetch_cycles_keep_one_copy() {
    let broker = broker().await;
    broker
        .enqueue(&key("m3", Priority::Low), "[]", &Parameters::new())
        .await
        .unwrap();

    for _ in 0..3 {
        let message = broker
            .fetch("q", ConsumerCategory::Normal, Priority::ALL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id(), "m3");
        assert!(broker
            .fetch("q", ConsumerCategory::Normal, Priority::ALL)
            .await
            .unwrap()
            .is_none());
        MessageBroker::reject(&broker, &message.key).await.unwrap();
        assert_eq!(broker.stats("q").await.ready, 1);
    }
}

#[tokio::test]
async fn rejected_delayed_message_keeps_its_due_time() {
    let broker = broker().await;
    let params = Parameters::new().with_delay(DelayProperties {
        delay_until: Some(chrono::Utc::now() + chrono::Duration::milliseconds(200)),
        ..DelayProperties::default()
    });
    broker.enqueue(&key("m4", Priority::Medium), "[]", &params).await.unwrap();
    assert_eq!(broker.stats("q").await.delayed, 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let message = broker
        .fetch("q", ConsumerCategory::Normal, Priority::ALL)
        .await
        .unwrap()
        .unwrap();
    MessageBroker::reject(&broker, &message.key).await.unwrap();

    let stats = broker.stats("q").await;
    assert_eq!((stats.ready, stats.delayed), (0, 1));
    // still due, so immediately fetchable again
    let again = broker
        .fetch("q", ConsumerCategory::Normal, Priority::ALL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id(), "m4");
}

#[tokio::test]
async fn deferred_message_waits_for_its_period() {
    let broker = broker().await;
    let enqueued_at = Instant::now();
    let params = Parameters::new().with_delay(DelayProperties {
        defer_by: Some(Duration::from_secs(2)),
        ..DelayProperties::default()
    });
    broker.enqueue(&key("m5", Priority::Medium), "[]", &params).await.unwrap();

    let consumer = broker
        .get_consumer("q", topics(), 1, ConsumerCategory::Normal)
        .await
        .unwrap();
    consumer.start().await.unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(500), consumer.consume())
        .await
        .is_err());

    let message = tokio::time::timeout(Duration::from_secs(5), consumer.consume())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.id(), "m5");
    assert!(enqueued_at.elapsed() >= Duration::from_secs(2));
    broker.ack(&message.key).await.unwrap();
    consumer.finish().await.unwrap();
}

#[tokio::test]
async fn sweep_reclaims_abandoned_message_once() {
    let broker = broker().await;
    let params = Parameters::new().with_execution_timeout(Duration::from_millis(100));
    broker.enqueue(&key("m6", Priority::High), "[]", &params).await.unwrap();

    let message = broker
        .fetch("q", ConsumerCategory::Normal, Priority::ALL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broker.maintenance().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(broker.maintenance().await.unwrap(), 1);
    assert_eq!(broker.maintenance().await.unwrap(), 0);

    let again = broker
        .fetch("q", ConsumerCategory::Normal, Priority::ALL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id(), message.id());
    assert!(broker
        .fetch("q", ConsumerCategory::Normal, Priority::ALL)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn consume_before_start_is_an_error() {
    let broker = broker().await;
    let consumer = broker
        .get_consumer("q", topics(), 1, ConsumerCategory::Normal)
        .await
        .unwrap();
    assert!(matches!(consumer.consume().await, Err(WorkerError::NotStarted)));
}

#[tokio::test]
async fn paused_consumer_delivers_after_unpause() {
    let broker = broker().await;
    let consumer = broker
        .get_consumer("q", topics(), 1, ConsumerCategory::Normal)
        .await
        .unwrap();
    consumer.start().await.unwrap();
    consumer.pause().await;
    broker
        .enqueue(&key("m7", Priority::Medium), "[]", &Parameters::new())
        .await
        .unwrap();
    assert!(tokio::time::timeout(QUIET, consumer.consume()).await.is_err());
    assert_eq!(broker.stats("q").await.ready, 1);

    consumer.unpause().await;
    let message = tokio::time::timeout(Duration::from_secs(2), consumer.consume())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.id(), "m7");
    broker.ack(&message.key).await.unwrap();
    consumer.finish().await.unwrap();
}

#[tokio::test]
async fn foreign_topics_stay_in_the_queue() {
    let broker = broker().await;
    let other = RoutingKey::new("m8", "other", "q", Priority::High).unwrap();
    broker.enqueue(&other, "[]", &Parameters::new()).await.unwrap();

    let consumer = broker
        .get_consumer("q", topics(), 1, ConsumerCategory::Normal)
        .await
        .unwrap();
    consumer.start().await.unwrap();
    assert!(tokio::time::timeout(QUIET, consumer.consume()).await.is_err());
    consumer.finish().await.unwrap();

    let stats = broker.stats("q").await;
    assert_eq!((stats.ready, stats.processing), (1, 0));
}

#[tokio::test]
async fn overdue_message_is_dead_lettered_unseen() {
    let broker = broker().await;
    let params = Parameters::new()
        .with_ttl(Duration::from_secs(1))
        .with_timestamp(chrono::Utc::now() - chrono::Duration::seconds(5));
    broker.enqueue(&key("m9", Priority::Low), "[]", &params).await.unwrap();

    let consumer = broker
        .get_consumer("q", topics(), 1, ConsumerCategory::Normal)
        .await
        .unwrap();
    consumer.start().await.unwrap();
    assert!(tokio::time::timeout(QUIET, consumer.consume()).await.is_err());
    consumer.finish().await.unwrap();

    let stats = broker.stats("q").await;
    assert_eq!((stats.ready, stats.dead, stats.processing), (0, 1, 0));
}

#[tokio::test]
async fn finish_returns_buffered_messages() {
    let broker = broker().await;
    for id in ["b1", "b2"] {
        broker.enqueue(&key(id, Priority::Medium), "[]", &Parameters::new()).await.unwrap();
    }

    let consumer = broker
        .get_consumer("q", topics(), 2, ConsumerCategory::Normal)
        .await
        .unwrap();
    consumer.start().await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), consumer.consume())
        .await
        .unwrap()
        .unwrap();
    broker.ack(&first.key).await.unwrap();
    // let the loop claim the second one into the buffer
    tokio::time::sleep(QUIET).await;
    consumer.finish().await.unwrap();

    let stats = broker.stats("q").await;
    assert_eq!((stats.ready, stats.processing), (1, 0));
}

#[tokio::test]
async fn runner_acks_each_priority_exactly_once() {
    let broker = broker().await;
    for (id, priority) in [("high", Priority::High), ("low", Priority::Low), ("medium", Priority::Medium)] {
        broker.enqueue(&key(id, priority), "[]", &Parameters::new()).await.unwrap();
    }

    let seen: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
    let actor = Actor::new("t", {
        let seen = seen.clone();
        handler_fn(move |_: Arguments, ctx: ActorContext| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap().entry(ctx.key.id().to_string()).or_default() += 1;
                ActorResult::Ok(Outcome::Success(None))
            }
        })
    })
    .unwrap()
    .queue("q")
    .unwrap();

    let runner = Runner::builder(Connection::new(Arc::new(broker.clone())))
        .actor(actor)
        .tasks_concurrency_limit(1)
        .max_tasks(3)
        .build()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), runner.run())
        .await
        .unwrap()
        .unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert!(seen.values().all(|count| *count == 1));
    assert_eq!(broker.stats("q").await, Default::default());
}

#[tokio::test]
async fn runner_retries_until_success() {
    let broker = broker().await;
    broker
        .enqueue(&key("flaky", Priority::Medium), "[]", &Parameters::new().with_retries(3))
        .await
        .unwrap();

    let attempts: Arc<Mutex<Vec<u32>>> = Arc::default();
    let actor = Actor::new("t", {
        let attempts = attempts.clone();
        handler_fn(move |_: Arguments, ctx: ActorContext| {
            let attempts = attempts.clone();
            async move {
                attempts.lock().unwrap().push(ctx.attempt());
                if ctx.attempt() < 2 {
                    ActorResult::Err(ActorError::Retry("not yet".into()))
                } else {
                    ActorResult::Ok(Outcome::Success(None))
                }
            }
        })
    })
    .unwrap()
    .queue("q")
    .unwrap()
    .retry_policy(FixedBackoff(Duration::ZERO));

    let runner = Runner::builder(Connection::new(Arc::new(broker.clone())))
        .actor(actor)
        .max_tasks(3)
        .build()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), runner.run())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(broker.stats("q").await, Default::default());
}
