use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::broker::{topic_allowed, Consumer, ConsumerCategory};
use crate::broker::priority::PriorityDistribution;
use crate::config::BrokerConfig;
use crate::message::message::Message;
use crate::message::routing::{Priority, RoutingKey};
use crate::runner::error::WorkerError;

/// Backend side of a polling consumer.
#[async_trait]
pub trait PollSource: Clone + Send + Sync + 'static {
    /// Claim the next message of `queue` for `category`, visiting tiers in `order`.
    /// A claimed message is in-flight until acked, nacked, rejected or requeued.
    async fn fetch(
        &self,
        queue: &str,
        category: ConsumerCategory,
        order: [Priority; 3],
    ) -> Result<Option<Message>, WorkerError>;

    async fn reject(&self, key: &RoutingKey) -> Result<(), WorkerError>;

    async fn nack(&self, key: &RoutingKey) -> Result<(), WorkerError>;
}

/// Simple exponential backoff helper for idle polls
pub(crate) struct Backoff {
    current: Duration,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base,
            base,
            max,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }

    pub(crate) fn next(&mut self) -> Duration {
        let next = self.current;
        self.current = (self.current.mul_f32(2.0)).min(self.max);
        next
    }
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub distribution: PriorityDistribution,
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl PollSettings {
    pub fn from_config(config: &BrokerConfig) -> Result<Self, WorkerError> {
        Ok(Self {
            distribution: config.distribution()?,
            min_interval: config.min_poll_interval(),
            max_interval: config.max_poll_interval(),
        })
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            distribution: PriorityDistribution::default(),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
        }
    }
}

struct FetchTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Consumer for engines without server push: a background task polls the
/// source and buffers up to `prefetch` claimed messages.
pub struct PollingConsumer<S: PollSource> {
    source: S,
    queue: String,
    topics: Option<Vec<String>>,
    category: ConsumerCategory,
    prefetch: usize,
    settings: PollSettings,
    paused: watch::Sender<bool>,
    task: StdMutex<Option<FetchTask>>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    fatal: std::sync::Arc<StdMutex<Option<String>>>,
}

impl<S: PollSource> PollingConsumer<S> {
    pub fn new(
        source: S,
        queue: impl Into<String>,
        topics: Option<Vec<String>>,
        prefetch: usize,
        category: ConsumerCategory,
        settings: PollSettings,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            source,
            queue: queue.into(),
            topics,
            category,
            prefetch: prefetch.max(1),
            settings,
            paused,
            task: StdMutex::new(None),
            rx: Mutex::new(None),
            fatal: Default::default(),
        }
    }

    fn fetch_loop(&self, tx: mpsc::Sender<Message>, cancel: CancellationToken) -> JoinHandle<()> {
        let source = self.source.clone();
        let queue = self.queue.clone();
        let topics = self.topics.clone();
        let category = self.category;
        let settings = self.settings.clone();
        let mut paused_rx = self.paused.subscribe();
        let fatal = self.fatal.clone();

        tokio::spawn(async move {
            debug!(queue = %queue, %category, "Starting fetch loop");
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
                if *paused_rx.borrow() {
                    drop(permit);
                    continue;
                }

                let order = {
                    let mut rng = rand::thread_rng();
                    settings.distribution.visiting_order(&mut rng)
                };

                let sleep_for = match source.fetch(&queue, category, order).await {
                    Ok(Some(message)) => {
                        if !topic_allowed(topics.as_deref(), message.key.topic()) {
                            debug!(message_id = %message.id(), topic = %message.key.topic(), "Topic not handled here, rejecting");
                            if let Err(e) = source.reject(&message.key).await {
                                error!(message_id = %message.id(), error = %e, "Failed to reject message");
                            }
                            Some(backoff.next())
                        } else if message.parameters.is_overdue() {
                            warn!(message_id = %message.id(), "Message overdue, dead-lettering without execution");
                            if let Err(e) = source.nack(&message.key).await {
                                error!(message_id = %message.id(), error = %e, "Failed to dead-letter overdue message");
                            }
                            None
                        } else {
                            backoff.reset();
                            permit.send(message);
                            None
                        }
                    }
                    Ok(None) => Some(backoff.next()),
                    Err(e) if e.is_retryable() => {
                        warn!(queue = %queue, error = %e, "Fetch failed, backing off");
                        Some(settings.max_interval)
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Fetch loop failed");
                        if let Ok(mut slot) = fatal.lock() {
                            *slot = Some(e.to_string());
                        }
                        break;
                    }
                };

                if let Some(delay) = sleep_for {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {},
                    }
                }
            }
            debug!(queue = %queue, %category, "Fetch loop stopped");
        })
    }

    fn closed_error(&self) -> WorkerError {
        match self.fatal.lock().ok().and_then(|f| f.clone()) {
            Some(reason) => WorkerError::Transport(reason),
            None => WorkerError::NotStarted,
        }
    }
}

#[async_trait]
impl<S: PollSource> Consumer for PollingConsumer<S> {
    async fn start(&self) -> Result<(), WorkerError> {
        let mut rx_slot = self.rx.lock().await;
        let mut task = self
            .task
            .lock()
            .map_err(|_| WorkerError::Unknown("consumer state poisoned".into()))?;
        if task.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(self.prefetch);
        let cancel = CancellationToken::new();
        let handle = self.fetch_loop(tx, cancel.clone());
        *task = Some(FetchTask { cancel, handle });
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
        let task = self
            .task
            .lock()
            .map_err(|_| WorkerError::Unknown("consumer state poisoned".into()))?
            .take();
        let Some(task) = task else {
            return Ok(());
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            error!(queue = %self.queue, error = %e, "Fetch loop panicked");
        }

        let mut rx_slot = self.rx.lock().await;
        if let Some(mut rx) = rx_slot.take() {
            rx.close();
            while let Ok(message) = rx.try_recv() {
                debug!(message_id = %message.id(), "Returning buffered message");
                if let Err(e) = self.source.reject(&message.key).await {
                    error!(message_id = %message.id(), error = %e, "Failed to return buffered message");
                }
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
            None => Err(self.closed_error()),
        }
    }
}
