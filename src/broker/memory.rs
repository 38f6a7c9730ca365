use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::broker::{BucketBroker, Consumer, ConsumerCategory, MessageBroker, Structure};
use crate::broker::consumer::{PollSettings, PollSource, PollingConsumer};
use crate::message::bucket::Bucket;
use crate::message::message::Message;
use crate::message::parameters::Parameters;
use crate::message::routing::{validate_id, validate_name, Priority, RoutingKey};
use crate::runner::error::WorkerError;

/// Counts of messages at rest (and in flight) for one logical queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub delayed: usize,
    pub dead: usize,
    pub processing: usize,
}

struct Stored {
    message: Message,
    /// Structure the message rests in, or was fetched from while in flight.
    origin: Structure,
    due: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueState {
    ready: [VecDeque<String>; 3],
    delayed: [BTreeSet<(DateTime<Utc>, u64, String)>; 3],
    dead: [VecDeque<String>; 3],
}

impl QueueState {
    fn forget(&mut self, tier: usize, id: &str) {
        self.ready[tier].retain(|x| x != id);
        self.delayed[tier].retain(|(_, _, x)| x != id);
        self.dead[tier].retain(|x| x != id);
    }

    fn pop_due(&mut self, tier: usize, now: DateTime<Utc>) -> Option<String> {
        let set = &mut self.delayed[tier];
        if set.first().is_some_and(|(due, _, _)| *due <= now) {
            set.pop_first().map(|(_, _, id)| id)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct State {
    connected: bool,
    queues: HashMap<String, QueueState>,
    messages: HashMap<String, Stored>,
    /// In-flight ids and the deadline after which the sweep reclaims them.
    processing: HashMap<String, DateTime<Utc>>,
    seq: u64,
}

impl State {
    fn ensure_connected(&self) -> Result<(), WorkerError> {
        if self.connected {
            Ok(())
        } else {
            Err(WorkerError::Transport("memory broker is not connected".into()))
        }
    }

    fn place(&mut self, id: &str, origin: Structure, due: Option<DateTime<Utc>>) {
        let Some(stored) = self.messages.get_mut(id) else {
            return;
        };
        stored.origin = origin;
        stored.due = due;
        let tier = stored.message.key.priority().index();
        let queue = self
            .queues
            .entry(stored.message.key.queue().to_string())
            .or_default();
        match origin {
            Structure::Ready => queue.ready[tier].push_back(id.to_string()),
            Structure::Delayed => {
                self.seq += 1;
                let due = due.unwrap_or_else(Utc::now);
                queue.delayed[tier].insert((due, self.seq, id.to_string()));
            }
            Structure::Dead => queue.dead[tier].push_back(id.to_string()),
        }
    }

    fn remove(&mut self, id: &str) -> Option<Stored> {
        self.processing.remove(id);
        let stored = self.messages.remove(id)?;
        if let Some(queue) = self.queues.get_mut(stored.message.key.queue()) {
            queue.forget(stored.message.key.priority().index(), id);
        }
        Some(stored)
    }

    fn insert(
        &mut self,
        key: &RoutingKey,
        payload: &str,
        params: &Parameters,
        now: DateTime<Utc>,
    ) -> Result<Structure, WorkerError> {
        params.validate()?;
        let due = params.due_time(now)?;
        if self.remove(key.id()).is_some() {
            debug!(message_id = %key.id(), "Replacing message with the same id");
        }
        let origin = if due.is_some() {
            Structure::Delayed
        } else {
            Structure::Ready
        };
        self.messages.insert(
            key.id().to_string(),
            Stored {
                message: Message::new(key.clone(), payload, params.clone()),
                origin,
                due,
            },
        );
        self.place(key.id(), origin, due);
        Ok(origin)
    }

    fn claim(
        &mut self,
        queue: &str,
        category: ConsumerCategory,
        order: [Priority; 3],
        now: DateTime<Utc>,
    ) -> Option<Message> {
        let State {
            queues,
            messages,
            processing,
            ..
        } = self;
        let state = queues.get_mut(queue)?;
        for priority in order {
            let tier = priority.index();
            loop {
                let (id, origin) = match category {
                    ConsumerCategory::Dead => match state.dead[tier].pop_front() {
                        Some(id) => (id, Structure::Dead),
                        None => break,
                    },
                    ConsumerCategory::Normal | ConsumerCategory::Delayed => {
                        if let Some(id) = state.pop_due(tier, now) {
                            (id, Structure::Delayed)
                        } else if category == ConsumerCategory::Normal {
                            match state.ready[tier].pop_front() {
                                Some(id) => (id, Structure::Ready),
                                None => break,
                            }
                        } else {
                            break;
                        }
                    }
                };
                let Some(stored) = messages.get(&id) else {
                    continue;
                };
                if stored.origin != origin || processing.contains_key(&id) {
                    continue;
                }
                let deadline = chrono::Duration::from_std(stored.message.parameters.execution_timeout)
                    .ok()
                    .and_then(|timeout| now.checked_add_signed(timeout))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                processing.insert(id, deadline);
                return Some(stored.message.clone());
            }
        }
        None
    }

    /// Take `id` out of flight. `false` when it was not in flight.
    fn release(&mut self, id: &str) -> bool {
        self.processing.remove(id).is_some() && self.messages.contains_key(id)
    }

    fn return_to_origin(&mut self, id: &str) {
        let Some(stored) = self.messages.get(id) else {
            return;
        };
        let (origin, due) = (stored.origin, stored.due);
        self.place(id, origin, due);
    }
}

/// In-process queueing engine. Nothing survives the process; useful for tests,
/// demos and single-binary deployments.
///
/// Duplicate policy: tolerant, a later enqueue with the same id replaces the earlier copy.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    state: Mutex<State>,
    settings: PollSettings,
}

impl MemoryBroker {
    pub fn new(settings: PollSettings) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(State::default()),
                settings,
            }),
        }
    }

    pub async fn stats(&self, queue: &str) -> QueueStats {
        let state = self.inner.state.lock().await;
        let mut stats = QueueStats::default();
        if let Some(q) = state.queues.get(queue) {
            stats.ready = q.ready.iter().map(VecDeque::len).sum();
            stats.delayed = q.delayed.iter().map(BTreeSet::len).sum();
            stats.dead = q.dead.iter().map(VecDeque::len).sum();
        }
        stats.processing = state
            .processing
            .keys()
            .filter(|id| {
                state
                    .messages
                    .get(*id)
                    .is_some_and(|s| s.message.key.queue() == queue)
            })
            .count();
        stats
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<(), WorkerError> {
        self.inner.state.lock().await.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), WorkerError> {
        self.inner.state.lock().await.connected = false;
        Ok(())
    }

    async fn enqueue(
        &self,
        key: &RoutingKey,
        payload: &str,
        params: &Parameters,
    ) -> Result<(), WorkerError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_connected()?;
        let structure = state.insert(key, payload, params, Utc::now())?;
        debug!(message_id = %key.id(), queue = %key.queue(), priority = %key.priority(), %structure, "Message enqueued");
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
        self.inner.state.lock().await.ensure_connected()?;
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
        let mut state = self.inner.state.lock().await;
        state.ensure_connected()?;
        if !state.processing.contains_key(key.id()) {
            warn!(message_id = %key.id(), "Ack for a message that is not in flight, ignoring");
            return Ok(());
        }
        state.remove(key.id());
        Ok(())
    }

    async fn nack(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_connected()?;
        if !state.release(key.id()) {
            warn!(message_id = %key.id(), "Nack for an unknown delivery, ignoring");
            return Ok(());
        }
        state.place(key.id(), Structure::Dead, None);
        info!(message_id = %key.id(), queue = %key.queue(), "Message moved to dead letters");
        Ok(())
    }

    async fn reject(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_connected()?;
        if !state.release(key.id()) {
            warn!(message_id = %key.id(), "Reject for an unknown delivery, ignoring");
            return Ok(());
        }
        state.return_to_origin(key.id());
        Ok(())
    }

    async fn requeue(
        &self,
        key: &RoutingKey,
        payload: &str,
        params: &Parameters,
    ) -> Result<(), WorkerError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_connected()?;
        state.insert(key, payload, params, Utc::now())?;
        debug!(message_id = %key.id(), "Message requeued");
        Ok(())
    }

    async fn queue_declare(&self, queue: &str) -> Result<(), WorkerError> {
        validate_name("queue", queue)?;
        let mut state = self.inner.state.lock().await;
        state.ensure_connected()?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn queue_flush(&self, queue: &str) -> Result<(), WorkerError> {
        validate_name("queue", queue)?;
        let mut state = self.inner.state.lock().await;
        state.ensure_connected()?;
        let at_rest: Vec<String> = state
            .messages
            .iter()
            .filter(|(id, s)| s.message.key.queue() == queue && !state.processing.contains_key(*id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &at_rest {
            state.remove(id);
        }
        if let Some(q) = state.queues.get_mut(queue) {
            *q = QueueState::default();
        }
        info!(queue = %queue, removed = at_rest.len(), "Queue flushed");
        Ok(())
    }

    async fn queue_delete(&self, queue: &str) -> Result<(), WorkerError> {
        self.queue_flush(queue).await?;
        self.inner.state.lock().await.queues.remove(queue);
        Ok(())
    }

    async fn maintenance(&self) -> Result<usize, WorkerError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_connected()?;
        let now = Utc::now();
        let expired: Vec<String> = state
            .processing
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut reclaimed = 0;
        for id in expired {
            if state.release(&id) {
                state.return_to_origin(&id);
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
impl PollSource for MemoryBroker {
    async fn fetch(
        &self,
        queue: &str,
        category: ConsumerCategory,
        order: [Priority; 3],
    ) -> Result<Option<Message>, WorkerError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_connected()?;
        Ok(state.claim(queue, category, order, Utc::now()))
    }

    async fn reject(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        MessageBroker::reject(self, key).await
    }

    async fn nack(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        MessageBroker::nack(self, key).await
    }
}

/// In-process bucket store; overdue buckets are dropped on read.
#[derive(Clone, Default)]
pub struct MemoryBucketBroker {
    buckets: Arc<Mutex<Option<HashMap<String, Bucket>>>>,
}

impl MemoryBucketBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketBroker for MemoryBucketBroker {
    async fn connect(&self) -> Result<(), WorkerError> {
        let mut buckets = self.buckets.lock().await;
        if buckets.is_none() {
            *buckets = Some(HashMap::new());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn get_bucket(&self, id: &str) -> Result<Option<Bucket>, WorkerError> {
        let mut guard = self.buckets.lock().await;
        let buckets = guard
            .as_mut()
            .ok_or_else(|| WorkerError::Transport("bucket store is not connected".into()))?;
        match buckets.get(id) {
            Some(bucket) if bucket.is_overdue() => {
                buckets.remove(id);
                Ok(None)
            }
            Some(bucket) => Ok(Some(bucket.clone())),
            None => Ok(None),
        }
    }

    async fn store_bucket(&self, id: &str, bucket: &Bucket) -> Result<(), WorkerError> {
        validate_id(id)?;
        let mut guard = self.buckets.lock().await;
        let buckets = guard
            .as_mut()
            .ok_or_else(|| WorkerError::Transport("bucket store is not connected".into()))?;
        buckets.insert(id.to_string(), bucket.clone());
        Ok(())
    }

    async fn delete_bucket(&self, id: &str) -> Result<(), WorkerError> {
        let mut guard = self.buckets.lock().await;
        let buckets = guard
            .as_mut()
            .ok_or_else(|| WorkerError::Transport("bucket store is not connected".into()))?;
        buckets.remove(id);
        Ok(())
    }
}
