use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actor::actor::Actor;
use crate::broker::broker::{Consumer, ConsumerCategory, MessageBroker};
use crate::config::RunnerConfig;
use crate::connection::Connection;
use crate::message::message::Message;
use crate::message::routing::RoutingKey;
use crate::runner::error::WorkerError;
use crate::runner::processor::Processor;

/// Optional metrics sink to expose counters without coupling to a specific backend.
///
/// Counters emitted: `message_acked`, `message_dead_lettered`, `message_retried`,
/// `message_rescheduled`, `message_rejected`. Durations: `message_execution`.
///
/// # Examples
///
/// ```rust,no_run
/// use dispatch_q::MetricsSink;
/// use std::time::Duration;
///
/// struct LoggingMetrics;
///
/// impl MetricsSink for LoggingMetrics {
///     fn inc_counter(&self, name: &str, value: u64) {
///         println!("METRIC: {} += {}", name, value);
///     }
///
///     fn observe_duration(&self, name: &str, duration: Duration) {
///         println!("METRIC: {} = {:?}", name, duration);
///     }
/// }
/// ```
pub trait MetricsSink: Send + Sync + 'static {
    /// Increment a counter metric by the specified value.
    fn inc_counter(&self, name: &str, value: u64);

    /// Record a duration metric. The default implementation is a no-op.
    fn observe_duration(&self, _name: &str, _dur: Duration) {}
}

/// No-op metrics sink that discards all metrics.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_counter(&self, _name: &str, _value: u64) {}
}

/// Shared liveness flag; flips to unhealthy when a queue loop dies.
#[derive(Debug, Clone)]
pub struct HealthFlag(Arc<AtomicBool>);

impl HealthFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_healthy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn mark_unhealthy(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for HealthFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives consumers of every queue that has actors, bounded by one shared
/// concurrency limit.
///
/// Two cooperative signals control shutdown: [`Runner::stop`] halts new
/// fetches and lets in-flight tasks drain, [`Runner::cancel`] additionally
/// aborts in-flight tasks, rejecting their messages back to the broker.
/// A runner runs once; after it stops it cannot be restarted.
pub struct Runner {
    connection: Connection,
    actors: HashMap<String, Arc<HashMap<String, Actor>>>,
    config: RunnerConfig,
    metrics: Arc<dyn MetricsSink>,
    processor: Processor,
    semaphore: Arc<Semaphore>,
    processed: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    dispatched: Arc<AtomicUsize>,
    stop_token: CancellationToken,
    cancel_token: CancellationToken,
    running: RwLock<bool>,
    health: HealthFlag,
}

impl Runner {
    pub fn builder(connection: Connection) -> RunnerBuilder {
        RunnerBuilder::new(connection)
    }

    /// Messages whose processing finished (whatever the outcome).
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> HealthFlag {
        self.health.clone()
    }

    /// Stop fetching; in-flight tasks run to completion.
    pub fn stop(&self) {
        self.stop_token.cancel();
    }

    /// Stop fetching and abort in-flight tasks.
    pub fn cancel(&self) {
        self.stop_token.cancel();
        self.cancel_token.cancel();
    }

    /// Runs until every queue loop ends: after [`Runner::stop`], after
    /// `max_tasks` messages, or because a loop failed fatally.
    ///
    /// # Errors
    ///
    /// - `WorkerError::AlreadyRunning` if another `run` is active.
    /// - Connection or queue declaration failures before any loop starts.
    pub async fn run(&self) -> Result<(), WorkerError> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(WorkerError::AlreadyRunning);
            }
            *running = true;
        }
        let result = self.run_loops().await;
        *self.running.write().await = false;
        result
    }

    /// [`Runner::run`] until Ctrl+C or SIGTERM, then stop; cancel whatever is
    /// still running once `graceful_shutdown_seconds` have passed.
    pub async fn run_until_shutdown(&self) -> Result<(), WorkerError> {
        let run = self.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received, stopping runner");
            }
        }

        self.stop();
        match tokio::time::timeout(self.config.graceful_shutdown(), &mut run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    in_flight = self.in_flight(),
                    "Graceful shutdown period elapsed, cancelling in-flight tasks"
                );
                self.cancel();
                run.await
            }
        }
    }

    async fn run_loops(&self) -> Result<(), WorkerError> {
        let broker = self.connection.broker();
        self.connection.connect().await?;
        for queue in self.actors.keys() {
            broker.queue_declare(queue).await?;
        }

        let categories = broker.worker_categories();
        info!(
            broker = broker.name(),
            queues = ?self.actors.keys().collect::<Vec<_>>(),
            tasks_concurrency_limit = self.config.tasks_concurrency_limit,
            max_tasks = ?self.config.max_tasks,
            "Starting runner"
        );

        let maintenance_stop = self.stop_token.child_token();
        let maintenance = tokio::spawn(maintenance_loop(
            broker.clone(),
            self.config.maintenance_interval(),
            maintenance_stop.clone(),
        ));

        let mut loops = JoinSet::new();
        for (queue, actors) in &self.actors {
            for category in &categories {
                let worker = QueueLoop {
                    queue: queue.clone(),
                    category: *category,
                    actors: actors.clone(),
                    broker: broker.clone(),
                    processor: self.processor.clone(),
                    semaphore: self.semaphore.clone(),
                    processed: self.processed.clone(),
                    in_flight: self.in_flight.clone(),
                    dispatched: self.dispatched.clone(),
                    max_tasks: self.config.max_tasks,
                    prefetch: self.config.prefetch,
                    stop: self.stop_token.clone(),
                    cancel: self.cancel_token.clone(),
                    metrics: self.metrics.clone(),
                };
                loops.spawn(worker.run());
            }
        }

        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Queue loop failed");
                    self.health.mark_unhealthy();
                }
                Err(e) => {
                    error!(error = %e, "Queue loop task failed");
                    self.health.mark_unhealthy();
                }
            }
        }

        maintenance_stop.cancel();
        if let Err(e) = maintenance.await {
            error!(error = %e, "Maintenance task failed");
        }
        info!(processed = self.processed(), "Runner stopped");
        Ok(())
    }
}

/// One consumer of one queue/category and the tasks it spawned.
struct QueueLoop {
    queue: String,
    category: ConsumerCategory,
    actors: Arc<HashMap<String, Actor>>,
    broker: Arc<dyn MessageBroker>,
    processor: Processor,
    semaphore: Arc<Semaphore>,
    processed: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    /// Messages handed to a task, across every loop of the runner.
    dispatched: Arc<AtomicUsize>,
    max_tasks: Option<usize>,
    prefetch: usize,
    stop: CancellationToken,
    cancel: CancellationToken,
    metrics: Arc<dyn MetricsSink>,
}

impl QueueLoop {
    async fn run(self) -> Result<(), WorkerError> {
        let topics: Vec<String> = self.actors.keys().cloned().collect();
        let consumer = self
            .broker
            .get_consumer(&self.queue, Some(topics), self.prefetch, self.category)
            .await?;
        consumer.start().await?;
        debug!(queue = %self.queue, category = %self.category, "Queue loop started");

        let mut tasks = JoinSet::new();
        let outcome = self.drive(consumer.as_ref(), &mut tasks).await;
        // no new fetches while draining; finish waits so AMQP ackers stay valid
        consumer.pause().await;

        // stop drains, cancel makes each task reject its message
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(queue = %self.queue, error = %e, "Task failed");
            }
        }
        if let Err(e) = consumer.finish().await {
            warn!(queue = %self.queue, error = %e, "Failed to finish consumer");
        }
        debug!(queue = %self.queue, category = %self.category, "Queue loop stopped");
        outcome
    }

    fn limit_reached(&self) -> bool {
        self.max_tasks
            .is_some_and(|max| self.dispatched.load(Ordering::SeqCst) >= max)
    }

    /// Claims one of the `max_tasks` slots; `false` once they are all taken.
    fn reserve_slot(&self) -> bool {
        let Some(max) = self.max_tasks else {
            return true;
        };
        self.dispatched
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    async fn drive(
        &self,
        consumer: &dyn Consumer,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), WorkerError> {
        loop {
            while tasks.try_join_next().is_some() {}

            if self.limit_reached() {
                debug!(queue = %self.queue, "max_tasks reached, stopping");
                self.stop.cancel();
                return Ok(());
            }

            let message = tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                message = consumer.consume() => message,
            };
            let message = match message {
                Ok(message) => message,
                Err(WorkerError::NotStarted) if self.stop.is_cancelled() => return Ok(()),
                Err(e) => return Err(e),
            };

            let Some(permit) = self.acquire(consumer).await else {
                self.reject(&message.key).await;
                return Ok(());
            };

            let Some(actor) = self.actors.get(message.key.topic()).cloned() else {
                warn!(message_id = %message.id(), topic = ?message.key.topic(), "No actor for topic");
                self.reject(&message.key).await;
                continue;
            };

            if !self.reserve_slot() {
                self.reject(&message.key).await;
                self.stop.cancel();
                return Ok(());
            }

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            tasks.spawn(self.task(actor, message, permit));
        }
    }

    /// A capacity slot, pausing the consumer while the limiter is saturated.
    /// `None` when stopped while waiting.
    async fn acquire(&self, consumer: &dyn Consumer) -> Option<OwnedSemaphorePermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Some(permit);
        }
        consumer.pause().await;
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
            _ = self.stop.cancelled() => None,
        };
        consumer.unpause().await;
        permit
    }

    async fn reject(&self, key: &RoutingKey) {
        match self.broker.reject(key).await {
            Ok(()) => self.metrics.inc_counter("message_rejected", 1),
            Err(e) => error!(message_id = %key.id(), error = %e, "Failed to reject message"),
        }
    }

    fn task(
        &self,
        actor: Actor,
        message: Message,
        permit: OwnedSemaphorePermit,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let processor = self.processor.clone();
        let broker = self.broker.clone();
        let metrics = self.metrics.clone();
        let processed = self.processed.clone();
        let cancel = self.cancel.clone();
        let guard = InFlightGuard::new(broker.clone(), message.key.clone(), self.in_flight.clone());

        async move {
            let _permit = permit;
            let key = message.key.clone();
            tokio::select! {
                result = processor.process(&actor, message, cancel.child_token()) => {
                    guard.release();
                    if let Err(e) = result {
                        error!(message_id = %key.id(), error = %e, "Failed to dispose of message");
                    }
                    processed.fetch_add(1, Ordering::SeqCst);
                }
                _ = cancel.cancelled() => {
                    guard.release();
                    warn!(message_id = %key.id(), "Task cancelled, rejecting message");
                    match broker.reject(&key).await {
                        Ok(()) => metrics.inc_counter("message_rejected", 1),
                        Err(e) => error!(message_id = %key.id(), error = %e, "Failed to reject message"),
                    }
                }
            }
        }
    }
}

/// Tracks one in-flight message. If the task is dropped before it disposed
/// of the message (aborted, or its runtime shut down) the message is rejected.
struct InFlightGuard {
    broker: Arc<dyn MessageBroker>,
    key: RoutingKey,
    in_flight: Arc<AtomicUsize>,
    armed: bool,
}

impl InFlightGuard {
    fn new(broker: Arc<dyn MessageBroker>, key: RoutingKey, in_flight: Arc<AtomicUsize>) -> Self {
        Self {
            broker,
            key,
            in_flight,
            armed: true,
        }
    }

    /// The task settled the message itself.
    fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(message_id = %self.key.id(), "No runtime to reject abandoned message; the maintenance sweep will reclaim it");
            return;
        };
        let broker = self.broker.clone();
        let key = self.key.clone();
        handle.spawn(async move {
            if let Err(e) = broker.reject(&key).await {
                error!(message_id = %key.id(), error = %e, "Failed to reject abandoned message");
            }
        });
    }
}

async fn maintenance_loop(
    broker: Arc<dyn MessageBroker>,
    interval: Duration,
    stop: CancellationToken,
) {
    debug!(interval = ?interval, "Starting maintenance loop");
    loop {
        match broker.maintenance().await {
            Ok(0) => {}
            Ok(reclaimed) => info!(reclaimed, "Reclaimed abandoned messages"),
            Err(e) => error!(error = %e, "Maintenance sweep failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = stop.cancelled() => break,
        }
    }
    debug!("Maintenance loop stopped");
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C signal"); },
        _ = terminate => { info!("Received SIGTERM signal"); },
    }
}

/// Builder for a [`Runner`].
///
/// # Examples
///
/// ```rust,no_run
/// use dispatch_q::{handler_fn, Actor, ActorResult, Arguments, ActorContext, Connection, Outcome, Runner};
///
/// # async fn example() -> Result<(), dispatch_q::WorkerError> {
/// let conn = Connection::from_url("redis://127.0.0.1:6379")?;
/// let ping = Actor::new(
///     "ping",
///     handler_fn(|_args: Arguments, _ctx: ActorContext| async { ActorResult::Ok(Outcome::Success(None)) }),
/// )?;
/// let runner = Runner::builder(conn)
///     .actor(ping)
///     .tasks_concurrency_limit(8)
///     .build()?;
/// runner.run_until_shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct RunnerBuilder {
    connection: Connection,
    actors: Vec<Actor>,
    config: RunnerConfig,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl RunnerBuilder {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            actors: Vec::new(),
            config: RunnerConfig::default(),
            metrics: None,
        }
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actors.push(actor);
        self
    }

    pub fn actors(mut self, actors: impl IntoIterator<Item = Actor>) -> Self {
        self.actors.extend(actors);
        self
    }

    /// Replaces every setting at once.
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tasks_concurrency_limit(mut self, limit: usize) -> Self {
        self.config.tasks_concurrency_limit = limit;
        self
    }

    pub fn max_tasks(mut self, max: usize) -> Self {
        self.config.max_tasks = Some(max);
        self
    }

    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.config.prefetch = prefetch;
        self
    }

    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.config.maintenance_interval_seconds = interval.as_secs();
        self
    }

    pub fn graceful_shutdown(mut self, period: Duration) -> Self {
        self.config.graceful_shutdown_seconds = period.as_secs();
        self
    }

    /// Sets the metrics sink for monitoring message processing.
    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// # Errors
    ///
    /// `WorkerError::Config` for invalid settings, no actors, or two actors
    /// claiming the same topic on one queue.
    pub fn build(self) -> Result<Runner, WorkerError> {
        self.config.validate()?;
        if self.actors.is_empty() {
            return Err(WorkerError::Config("a runner needs at least one actor".into()));
        }

        let mut by_queue: HashMap<String, HashMap<String, Actor>> = HashMap::new();
        for actor in self.actors {
            let topics = by_queue.entry(actor.queue_name().to_string()).or_default();
            if topics.contains_key(actor.topic_name()) {
                return Err(WorkerError::Config(format!(
                    "topic {:?} is bound twice on queue {:?}",
                    actor.topic_name(),
                    actor.queue_name()
                )));
            }
            topics.insert(actor.topic_name().to_string(), actor);
        }

        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let processor = Processor::new(self.connection.broker())
            .with_args_buckets(self.connection.args_bucket_broker())
            .with_result_buckets(self.connection.result_bucket_broker())
            .with_metrics(metrics.clone());

        Ok(Runner {
            semaphore: Arc::new(Semaphore::new(self.config.tasks_concurrency_limit)),
            actors: by_queue
                .into_iter()
                .map(|(queue, topics)| (queue, Arc::new(topics)))
                .collect(),
            connection: self.connection,
            config: self.config,
            metrics,
            processor,
            processed: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            dispatched: Arc::new(AtomicUsize::new(0)),
            stop_token: CancellationToken::new(),
            cancel_token: CancellationToken::new(),
            running: RwLock::new(false),
            health: HealthFlag::new(),
        })
    }
}
