use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tracing::{error, warn};

use crate::broker::broker::{Consumer, ConsumerCategory, MessageBroker};
use crate::message::parameters::Parameters;
use crate::message::routing::RoutingKey;
use crate::runner::error::WorkerError;

/// What a broker operation was doing when a signal fired.
#[derive(Debug, Clone)]
pub struct SignalContext {
    pub broker: &'static str,
    pub operation: &'static str,
    pub key: Option<RoutingKey>,
    pub queue: Option<String>,
    /// Set on `after_*` events when the operation failed.
    pub error: Option<String>,
}

#[async_trait]
pub trait SignalSubscriber: Send + Sync {
    async fn on_signal(&self, event: &str, context: &SignalContext) -> Result<(), WorkerError>;
}

/// Fan-out of `before_<op>` / `after_<op>` events. A failing or panicking
/// subscriber is logged and never affects the operation or other subscribers.
#[derive(Default)]
pub struct SignalBus {
    subscribers: RwLock<Vec<Arc<dyn SignalSubscriber>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn SignalSubscriber>) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.push(subscriber);
        }
    }

    pub async fn emit(&self, event: &str, context: &SignalContext) {
        let subscribers = match self.subscribers.read() {
            Ok(subscribers) => subscribers.clone(),
            Err(_) => return,
        };
        for subscriber in subscribers {
            match AssertUnwindSafe(subscriber.on_signal(event, context))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event = %event, error = %e, "Signal subscriber failed"),
                Err(_) => error!(event = %event, "Signal subscriber panicked"),
            }
        }
    }
}

/// Broker decorator emitting signals around every operation.
pub struct SignalingBroker {
    inner: Arc<dyn MessageBroker>,
    bus: Arc<SignalBus>,
}

impl SignalingBroker {
    pub fn new(inner: Arc<dyn MessageBroker>, bus: Arc<SignalBus>) -> Self {
        Self { inner, bus }
    }

    async fn around<T, Fut>(
        &self,
        operation: &'static str,
        key: Option<&RoutingKey>,
        queue: Option<&str>,
        fut: Fut,
    ) -> Result<T, WorkerError>
    where
        Fut: Future<Output = Result<T, WorkerError>> + Send,
        T: Send,
    {
        let mut context = SignalContext {
            broker: self.inner.name(),
            operation,
            key: key.cloned(),
            queue: queue.map(str::to_string).or_else(|| key.map(|k| k.queue().to_string())),
            error: None,
        };
        self.bus.emit(&format!("before_{operation}"), &context).await;
        let result = fut.await;
        if let Err(e) = &result {
            context.error = Some(e.to_string());
        }
        self.bus.emit(&format!("after_{operation}"), &context).await;
        result
    }
}

#[async_trait]
impl MessageBroker for SignalingBroker {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn connect(&self) -> Result<(), WorkerError> {
        self.around("connect", None, None, self.inner.connect()).await
    }

    async fn disconnect(&self) -> Result<(), WorkerError> {
        self.around("disconnect", None, None, self.inner.disconnect())
            .await
    }

    async fn enqueue(
        &self,
        key: &RoutingKey,
        payload: &str,
        params: &Parameters,
    ) -> Result<(), WorkerError> {
        self.around(
            "enqueue",
            Some(key),
            None,
            self.inner.enqueue(key, payload, params),
        )
        .await
    }

    async fn get_consumer(
        &self,
        queue: &str,
        topics: Option<Vec<String>>,
        prefetch: usize,
        category: ConsumerCategory,
    ) -> Result<Box<dyn Consumer>, WorkerError> {
        self.around(
            "get_consumer",
            None,
            Some(queue),
            self.inner.get_consumer(queue, topics, prefetch, category),
        )
        .await
    }

    async fn ack(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        self.around("ack", Some(key), None, self.inner.ack(key)).await
    }

    async fn nack(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        self.around("nack", Some(key), None, self.inner.nack(key)).await
    }

    async fn reject(&self, key: &RoutingKey) -> Result<(), WorkerError> {
        self.around("reject", Some(key), None, self.inner.reject(key))
            .await
    }

    async fn requeue(
        &self,
        key: &RoutingKey,
        payload: &str,
        params: &Parameters,
    ) -> Result<(), WorkerError> {
        self.around(
            "requeue",
            Some(key),
            None,
            self.inner.requeue(key, payload, params),
        )
        .await
    }

    async fn queue_declare(&self, queue: &str) -> Result<(), WorkerError> {
        self.around(
            "queue_declare",
            None,
            Some(queue),
            self.inner.queue_declare(queue),
        )
        .await
    }

    async fn queue_flush(&self, queue: &str) -> Result<(), WorkerError> {
        self.around(
            "queue_flush",
            None,
            Some(queue),
            self.inner.queue_flush(queue),
        )
        .await
    }

    async fn queue_delete(&self, queue: &str) -> Result<(), WorkerError> {
        self.around(
            "queue_delete",
            None,
            Some(queue),
            self.inner.queue_delete(queue),
        )
        .await
    }

    async fn maintenance(&self) -> Result<usize, WorkerError> {
        self.around("maintenance", None, None, self.inner.maintenance())
            .await
    }

    fn worker_categories(&self) -> Vec<ConsumerCategory> {
        self.inner.worker_categories()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::message::routing::Priority;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SignalSubscriber for Recorder {
        async fn on_signal(&self, event: &str, context: &SignalContext) -> Result<(), WorkerError> {
            let mut line = event.to_string();
            if context.error.is_some() {
                line.push_str(":err");
            }
            self.events.lock().unwrap().push(line);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl SignalSubscriber for Broken {
        async fn on_signal(&self, _event: &str, _context: &SignalContext) -> Result<(), WorkerError> {
            Err(WorkerError::Unknown("subscriber down".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl SignalSubscriber for Panicking {
        async fn on_signal(&self, _event: &str, _context: &SignalContext) -> Result<(), WorkerError> {
            panic!("subscriber bug");
        }
    }

    #[tokio::test]
    async fn emits_around_operations_and_survives_bad_subscribers() {
        let bus = Arc::new(SignalBus::new());
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(Arc::new(Broken));
        bus.subscribe(Arc::new(Panicking));
        bus.subscribe(recorder.clone());

        let broker = SignalingBroker::new(Arc::new(MemoryBroker::default()), bus);
        let key = RoutingKey::new("s1", "t", "q", Priority::Low).unwrap();

        // not connected yet: the operation fails but signals still fire
        assert!(broker.enqueue(&key, "{}", &Parameters::new()).await.is_err());
        broker.connect().await.unwrap();
        broker.enqueue(&key, "{}", &Parameters::new()).await.unwrap();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "before_enqueue",
                "after_enqueue:err",
                "before_connect",
                "after_connect",
                "before_enqueue",
                "after_enqueue",
            ]
        );
    }
}
