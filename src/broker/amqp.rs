use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions, QueueDeleteOptions,
    QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};

use crate::broker::broker::{topic_allowed, Consumer, ConsumerCategory, MessageBroker};
use crate::broker::consumer::{Backoff, PollSettings};
use crate::broker::naming::AmqpNaming;
use crate::broker::redis::pool::redacted;
use crate::message::message::Message;
use crate::message::parameters::Parameters;
use crate::message::routing::{new_id, validate_name, RoutingKey};
use crate::runner::error::WorkerError;

/// Header carrying the due time (epoch ms) of messages published to the delayed queue.
const DUE_HEADER: &str = "x-due-ms";

struct Link {
    connection: Connection,
    /// Publishes and declarations go through this channel, one at a time.
    control: Channel,
}

struct InFlight {
    message: Message,
    acker: Acker,
    category: ConsumerCategory,
}

struct AmqpInner {
    url: String,
    naming: AmqpNaming,
    settings: PollSettings,
    link: Mutex<Option<Link>>,
    declared: Mutex<HashSet<String>>,
    in_flight: StdMutex<HashMap<String, VecDeque<InFlight>>>,
}

/// AMQP 0-9-1 queueing engine. Each logical queue is three durable server
/// queues; READY and DELAYED dead-letter into DEAD through the default exchange.
///
/// Duplicate policy: tolerant, every published copy is delivered.
/// Delayed messages are held client-side by a DELAYED consumer until due, so
/// runners start one per queue (see [`MessageBroker::worker_categories`]).
/// Abandoned deliveries are redelivered by the server when the channel dies,
/// so [`MessageBroker::maintenance`] has nothing to reclaim.
#[derive(Clone)]
pub struct AmqpBroker {
    inner: Arc<AmqpInner>,
}

fn not_connected() -> WorkerError {
    WorkerError::Transport("amqp broker is not connected".into())
}

/// Due time stamped on a delayed delivery, if any.
fn due_at(properties: &BasicProperties) -> Option<DateTime<Utc>> {
    let headers = properties.headers().as_ref()?;
    headers
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == DUE_HEADER)
        .and_then(|(_, value)| match value {
            AMQPValue::LongLongInt(ms) => DateTime::from_timestamp_millis(*ms),
            _ => None,
        })
}

fn message_properties(message: &Message, due: Option<DateTime<Utc>>) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_message_id(ShortString::from(message.id().to_string()))
        .with_priority(AmqpNaming::priority_byte(message.key.priority()))
        .with_delivery_mode(2);
    if let Some(due) = due {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(DUE_HEADER),
            AMQPValue::LongLongInt(due.timestamp_millis()),
        );
        properties = properties.with_headers(headers);
    }
    properties
}

impl AmqpBroker {
    pub fn new(amqp_url: &str, settings: PollSettings) -> Self {
        Self {
            inner: Arc::new(AmqpInner {
                url: amqp_url.to_string(),
                naming: AmqpNaming,
                settings,
                link: Mutex::new(None),
                declared: Mutex::new(HashSet::new()),
                in_flight: StdMutex::new(HashMap::new()),
            }),
        }
    }

    async fn publish(
        &self,
        target: &str,
        message: &Message,
        due: Option<DateTime<Utc>>,
    ) -> Result<(), WorkerError> {
        let body = message.encode()?;
        let properties = message_properties(message, due);
        let guard = self.inner.link.lock().await;
        let link = guard.as_ref().ok_or_else(not_connected)?;
        let confirmation = link
            .control
            .basic_publish(
                "",
                target,
                BasicPublishOptions::default(),
                body.as_bytes(),
                properties,
            )
            .await?
            .await?;
        if confirmation.is_nack() {
            return Err(WorkerError::Transport(format!(
                "publish of {} to {} was nacked by the server",
                message.id(),
                target
            )));
        }
        Ok(())
    }

    async fn ensure_declared(&self, queue: &str) -> Result<(), WorkerError> {
        if self.inner.declared.lock().await.contains(queue) {
            return Ok(());
        }
        self.queue_declare(queue).await
    }

    async fn store(
        &self,
        key: &RoutingKey,
        payload: &str,
        params: &Parameters,
    ) -> Result<(), WorkerError> {
        params.validate()?;
        let due = params.due_time(Utc::now())?;
        self.ensure_declared(key.queue()).await?;
        let target = match due {
            Some(_) => self.inner.naming.delayed(key.queue()),
            None => self.inner.naming.ready(key.queue()),
        };
        let message = Message::new(key.clone(), payload, params.clone());
        self.publish(&target, &message, due).await
    }

    fn track(&self, message: Message, acker: Acker, category: ConsumerCategory) {
        if let Ok(mut in_flight) = self.inner.in_flight.lock() {
            in_flight
                .entry(message.id().to_string())
                .or_default()
                .push_back(InFlight {
                    message,
                    acker,
                    category,
                });
        }
    }

    fn untrack(&self, id: &str) -> Option<InFlight> {
        let mut in_flight = self.inner.in_flight.lock().ok()?;
        let entries = in_flight.get_mut(id)?;
        let entry = entries.pop_front();
        if entries.is_empty() {
            in_flight.remove(id);
        }
        entry
    }

    async fn open_subscription(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<(Channel, lapin::Consumer), WorkerError> {
        let channel = {
            let guard = self.inner.link.lock().await;
            let link = guard.as_ref().ok_or_else(not_connected)?;
            link.connection.create_channel().await?
        };
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        let stream = channel
            .basic_consume(
                queue,
                &format!("dq-{}", new_id()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok((channel, stream))
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn connect(&self) -> Result<(), WorkerError> {
        let mut guard = self.inner.link.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        info!(url = %redacted(&self.inner.url), "Connecting to AMQP server");
        let connection = Connection::connect(&self.inner.url, ConnectionProperties::default()).await?;
        let control = connection.create_channel().await?;
        control
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        *guard = Some(Link {
            connection,
            control,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), WorkerError> {
        let link = self.inner.link.lock().await.take();
        if let Some(link) = link {
            if let Err(e) = link.control.close(200, "disconnect").await {
                warn!(error = %e, "Failed to close AMQP channel");
            }
            if let Err(e) = link.connection.close(200, "disconnect").await {
                warn!(error = %e, "Failed to close AMQP connection");
            }
        }
        self.inner.declared.lock().await.clear();
        Ok(())
    }

    async fn enqueue(
        &self,
        key: &RoutingKey,
        payload: &str,
        params: &Parameters,
    ) -> Result<(), WorkerError> {
        self.store(key, payload, params).await?;
        info!(message_id = %key.id(), queue = %key.queue(), priority = %key.priority(), "Message enqueued");
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
        self.ensure_declared(queue).await?;
        let physical = match category {
            ConsumerCategory::Normal => self.inner.naming.ready(queue),
            ConsumerCategory::Delayed => self.inner.naming.delayed(queue),
            ConsumerCategory::Dead => self.inner.naming.dead(queue),
        };
        Ok(Box::new(AmqpConsumer::new(
            self.clone(),
            physical,
            topics,
            prefetch,
            category,
        )))
    }

    async fn ack(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        let Some(entry) = self.untrack(key.id()) else {
            warn!(message_id = %key.id(), "Ack for a message that is not in flight");
            return Ok(());
        };
        entry.acker.ack(BasicAckOptions::default()).await?;
        debug!(message_id = %key.id(), "Message acked");
        Ok(())
    }

    async fn nack(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        let Some(entry) = self.untrack(key.id()) else {
            warn!(message_id = %key.id(), "Nack for an unknown delivery, ignoring");
            return Ok(());
        };
        if entry.category == ConsumerCategory::Dead {
            // DEAD has no dead-letter exchange of its own: copy back, then drop the delivery
            let dead = self.inner.naming.dead(key.queue());
            self.publish(&dead, &entry.message, None).await?;
            entry.acker.ack(BasicAckOptions::default()).await?;
        } else {
            entry
                .acker
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await?;
        }
        info!(message_id = %key.id(), queue = %key.queue(), "Message moved to dead letters");
        Ok(())
    }

    async fn reject(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        let Some(entry) = self.untrack(key.id()) else {
            warn!(message_id = %key.id(), "Reject for an unknown delivery, ignoring");
            return Ok(());
        };
        entry
            .acker
            .reject(BasicRejectOptions { requeue: true })
            .await?;
        Ok(())
    }

    /// Publish-then-ack: a crash in between leaves two copies, never zero.
    async fn requeue(
        &self,
        key: &RoutingKey,
        payload: &str,
        params: &Parameters,
    ) -> Result<(), WorkerError> {
        self.store(key, payload, params).await?;
        if let Some(entry) = self.untrack(key.id()) {
            entry.acker.ack(BasicAckOptions::default()).await?;
        }
        debug!(message_id = %key.id(), "Message requeued");
        Ok(())
    }

    async fn queue_declare(&self, queue: &str) -> Result<(), WorkerError> {
        validate_name("queue", queue)?;
        let naming = &self.inner.naming;
        let dead = naming.dead(queue);

        let mut base = FieldTable::default();
        base.insert(
            ShortString::from("x-max-priority"),
            AMQPValue::ShortShortUInt(2),
        );
        let mut dead_lettered = base.clone();
        dead_lettered.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from("")),
        );
        dead_lettered.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(dead.clone())),
        );
        let options = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        {
            let guard = self.inner.link.lock().await;
            let link = guard.as_ref().ok_or_else(not_connected)?;
            link.control.queue_declare(&dead, options, base).await?;
            link.control
                .queue_declare(&naming.ready(queue), options, dead_lettered.clone())
                .await?;
            link.control
                .queue_declare(&naming.delayed(queue), options, dead_lettered)
                .await?;
        }
        self.inner.declared.lock().await.insert(queue.to_string());
        debug!(queue = %queue, "Queue declared");
        Ok(())
    }

    async fn queue_flush(&self, queue: &str) -> Result<(), WorkerError> {
        validate_name("queue", queue)?;
        let naming = &self.inner.naming;
        let guard = self.inner.link.lock().await;
        let link = guard.as_ref().ok_or_else(not_connected)?;
        let mut removed = 0;
        for name in [naming.ready(queue), naming.delayed(queue), naming.dead(queue)] {
            removed += link
                .control
                .queue_purge(&name, QueuePurgeOptions::default())
                .await?;
        }
        info!(queue = %queue, removed, "Queue flushed");
        Ok(())
    }

    async fn queue_delete(&self, queue: &str) -> Result<(), WorkerError> {
        validate_name("queue", queue)?;
        let naming = &self.inner.naming;
        {
            let guard = self.inner.link.lock().await;
            let link = guard.as_ref().ok_or_else(not_connected)?;
            for name in [naming.ready(queue), naming.delayed(queue), naming.dead(queue)] {
                link.control
                    .queue_delete(&name, QueueDeleteOptions::default())
                    .await?;
            }
        }
        self.inner.declared.lock().await.remove(queue);
        info!(queue = %queue, "Queue deleted");
        Ok(())
    }

    async fn maintenance(&self) -> Result<usize, WorkerError> {
        Ok(0)
    }

    fn worker_categories(&self) -> Vec<ConsumerCategory> {
        vec![ConsumerCategory::Normal, ConsumerCategory::Delayed]
    }
}

struct Held {
    message: Message,
    acker: Acker,
}

struct DeliveryTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Push-based consumer over one server queue with its own channel.
pub struct AmqpConsumer {
    broker: AmqpBroker,
    queue: String,
    topics: Option<Vec<String>>,
    category: ConsumerCategory,
    prefetch: usize,
    paused: watch::Sender<bool>,
    channel: Arc<Mutex<Option<Channel>>>,
    task: StdMutex<Option<DeliveryTask>>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    fatal: Arc<StdMutex<Option<String>>>,
}

impl AmqpConsumer {
    fn new(
        broker: AmqpBroker,
        queue: String,
        topics: Option<Vec<String>>,
        prefetch: usize,
        category: ConsumerCategory,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            broker,
            queue,
            topics,
            category,
            prefetch: prefetch.max(1),
            paused,
            channel: Arc::new(Mutex::new(None)),
            task: StdMutex::new(None),
            rx: Mutex::new(None),
            fatal: Default::default(),
        }
    }

    /// Server-side prefetch. Delayed consumers hold deliveries until due, so they are unbounded.
    fn qos(&self) -> u16 {
        match self.category {
            ConsumerCategory::Delayed => 0,
            _ => u16::try_from(self.prefetch).unwrap_or(u16::MAX),
        }
    }

    fn delivery_loop(
        &self,
        mut stream: lapin::Consumer,
        tx: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let queue = self.queue.clone();
        let topics = self.topics.clone();
        let category = self.category;
        let qos = self.qos();
        let settings = broker.inner.settings.clone();
        let channel_slot = self.channel.clone();
        let fatal = self.fatal.clone();
        let mut paused_rx = self.paused.subscribe();

        tokio::spawn(async move {
            debug!(queue = %queue, %category, "Starting delivery loop");
            let mut held: DelayQueue<Held> = DelayQueue::new();
            let mut backoff = Backoff::new(settings.min_interval, settings.max_interval);

            loop {
                while *paused_rx.borrow_and_update() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        changed = paused_rx.changed() => if changed.is_err() { return },
                    }
                }

                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = tx.reserve() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };

                let incoming = tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(expired) = std::future::poll_fn(|cx| held.poll_expired(cx)), if !held.is_empty() => {
                        let due = expired.into_inner();
                        broker.track(due.message.clone(), due.acker, category);
                        permit.send(due.message);
                        continue;
                    }
                    delivery = stream.next() => delivery,
                };

                match incoming {
                    Some(Ok(delivery)) => {
                        let message = match Message::decode_bytes(&delivery.data) {
                            Ok(message) => message,
                            Err(e) => {
                                error!(queue = %queue, error = %e, "Dead-lettering undecodable delivery");
                                let options = BasicNackOptions { requeue: false, ..Default::default() };
                                if let Err(e) = delivery.acker.nack(options).await {
                                    error!(error = %e, "Failed to nack delivery");
                                }
                                continue;
                            }
                        };

                        if !topic_allowed(topics.as_deref(), message.key.topic()) {
                            debug!(message_id = %message.id(), topic = %message.key.topic(), "Topic not handled here, rejecting");
                            if let Err(e) = delivery.acker.reject(BasicRejectOptions { requeue: true }).await {
                                error!(message_id = %message.id(), error = %e, "Failed to reject delivery");
                            }
                            let delay = backoff.next();
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {},
                            }
                            continue;
                        }
                        backoff.reset();

                        if message.parameters.is_overdue() {
                            warn!(message_id = %message.id(), "Message overdue, dead-lettering without execution");
                            let options = BasicNackOptions { requeue: false, ..Default::default() };
                            if let Err(e) = delivery.acker.nack(options).await {
                                error!(message_id = %message.id(), error = %e, "Failed to dead-letter overdue message");
                            }
                            continue;
                        }

                        if category == ConsumerCategory::Delayed {
                            if let Some(due) = due_at(&delivery.properties) {
                                if let Ok(wait) = (due - Utc::now()).to_std() {
                                    held.insert(Held { message, acker: delivery.acker }, wait);
                                    continue;
                                }
                            }
                        }

                        broker.track(message.clone(), delivery.acker, category);
                        permit.send(message);
                    }
                    Some(Err(e)) => {
                        warn!(queue = %queue, error = %e, "Delivery stream failed, resubscribing");
                        if !resubscribe(&broker, &queue, qos, &channel_slot, &fatal, &mut stream, &mut held).await {
                            break;
                        }
                    }
                    None => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        warn!(queue = %queue, "Subscription cancelled by the server, resubscribing");
                        if !resubscribe(&broker, &queue, qos, &channel_slot, &fatal, &mut stream, &mut held).await {
                            break;
                        }
                    }
                }
            }
            debug!(queue = %queue, %category, "Delivery loop stopped");
        })
    }
}

/// Replace a dead subscription. Held deliveries belonged to the old channel and
/// are redelivered by the server once it closes. `false` when resubscribing failed.
async fn resubscribe(
    broker: &AmqpBroker,
    queue: &str,
    qos: u16,
    channel_slot: &Mutex<Option<Channel>>,
    fatal: &StdMutex<Option<String>>,
    stream: &mut lapin::Consumer,
    held: &mut DelayQueue<Held>,
) -> bool {
    held.clear();
    if let Some(old) = channel_slot.lock().await.take() {
        if let Err(e) = old.close(200, "resubscribing").await {
            debug!(queue = %queue, error = %e, "Old subscription channel already closed");
        }
    }
    match broker.open_subscription(queue, qos).await {
        Ok((channel, fresh)) => {
            *stream = fresh;
            *channel_slot.lock().await = Some(channel);
            info!(queue = %queue, "Resubscribed");
            true
        }
        Err(e) => {
            error!(queue = %queue, error = %e, "Resubscription failed");
            if let Ok(mut slot) = fatal.lock() {
                *slot = Some(format!("{queue}: {e}"));
            }
            false
        }
    }
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn start(&self) -> Result<(), WorkerError> {
        let mut rx_slot = self.rx.lock().await;
        if rx_slot.is_some() {
            return Ok(());
        }
        let (channel, stream) = self.broker.open_subscription(&self.queue, self.qos()).await?;
        *self.channel.lock().await = Some(channel);

        let (tx, rx) = mpsc::channel(self.prefetch);
        let cancel = CancellationToken::new();
        let handle = self.delivery_loop(stream, tx, cancel.clone());
        if let Ok(mut task) = self.task.lock() {
            *task = Some(DeliveryTask { cancel, handle });
        }
        *rx_slot = Some(rx);
        Ok(())
    }

    async fn pause(&self) {
        self.paused.send_replace(true);
    }

    async fn unpause(&self) {
        self.paused.send_replace(false);
    }

    async fn finish(&self) -> Result<(), WorkerError> {
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                error!(queue = %self.queue, error = %e, "Delivery loop panicked");
            }
        }

        let mut rx_slot = self.rx.lock().await;
        if let Some(mut rx) = rx_slot.take() {
            rx.close();
            while let Ok(message) = rx.try_recv() {
                if let Err(e) = MessageBroker::reject(&self.broker, &message.key).await {
                    error!(message_id = %message.id(), error = %e, "Failed to return buffered message");
                }
            }
        }

        if let Some(channel) = self.channel.lock().await.take() {
            if let Err(e) = channel.close(200, "consumer finished").await {
                debug!(queue = %self.queue, error = %e, "Channel already closed");
            }
        }
        Ok(())
    }

    async fn consume(&self) -> Result<Message, WorkerError> {
        let mut rx_slot = self.rx.lock().await;
        let Some(rx) = rx_slot.as_mut() else {
            return Err(WorkerError::NotStarted);
        };
        match rx.recv().await {
            Some(message) => Ok(message),
            None => match self.fatal.lock().ok().and_then(|f| f.clone()) {
                Some(reason) => Err(WorkerError::SubscriptionCancelled(reason)),
                None => Err(WorkerError::NotStarted),
            },
        }
    }
}
