use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::actor::converter::{Arguments, Converter, JsonConverter};
use crate::actor::error::ActorError;
use crate::actor::retry::{ExponentialBackoff, RetryPolicy};
use crate::broker::broker::MessageBroker;
use crate::message::parameters::Parameters;
use crate::message::routing::{validate_name, RoutingKey};
use crate::runner::error::WorkerError;

/// Queue used when an actor or job does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// What a handler reports back to the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The job succeeded, optionally producing a value to store as its result.
    Success(Option<serde_json::Value>),
    /// The handler already disposed of the message itself through
    /// [`ActorContext::broker`]; the processor leaves it alone.
    NoAction,
}

/// A convenient Result type alias for handlers that want to use the ? operator
pub type ActorResult = Result<Outcome, ActorError>;

/// Context provided to handlers during execution
#[derive(Clone)]
pub struct ActorContext {
    pub key: RoutingKey,
    pub parameters: Parameters,
    pub broker: Arc<dyn MessageBroker>,
    /// Cancelled when the runner aborts in-flight work.
    pub cancel_token: CancellationToken,
}

impl ActorContext {
    pub fn message_id(&self) -> &str {
        self.key.id()
    }

    /// Number of earlier failed attempts.
    pub fn attempt(&self) -> u32 {
        self.parameters.retries.already_tried
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Trait that every handler bound to a topic implements
#[async_trait]
pub trait ActorHandler: Send + Sync {
    async fn handle(&self, args: Arguments, context: ActorContext) -> ActorResult;
}

/// Handler built from an async closure, see [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wraps `f(args, context)` as an [`ActorHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arguments, ActorContext) -> Fut + Send + Sync,
    Fut: Future<Output = ActorResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> ActorHandler for FnHandler<F>
where
    F: Fn(Arguments, ActorContext) -> Fut + Send + Sync,
    Fut: Future<Output = ActorResult> + Send + 'static,
{
    async fn handle(&self, args: Arguments, context: ActorContext) -> ActorResult {
        (self.0)(args, context).await
    }
}

/// A handler bound to one topic on one queue.
#[derive(Clone)]
pub struct Actor {
    topic: String,
    queue: String,
    handler: Arc<dyn ActorHandler>,
    retry_policy: Arc<dyn RetryPolicy>,
    converter: Arc<dyn Converter>,
}

impl Actor {
    pub fn new(
        topic: impl Into<String>,
        handler: impl ActorHandler + 'static,
    ) -> Result<Self, WorkerError> {
        Self::from_arc(topic, Arc::new(handler))
    }

    pub fn from_arc(
        topic: impl Into<String>,
        handler: Arc<dyn ActorHandler>,
    ) -> Result<Self, WorkerError> {
        let topic = topic.into();
        validate_name("topic", &topic)?;
        Ok(Self {
            topic,
            queue: DEFAULT_QUEUE.to_string(),
            handler,
            retry_policy: Arc::new(ExponentialBackoff::default()),
            converter: Arc::new(JsonConverter),
        })
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Result<Self, WorkerError> {
        let queue = queue.into();
        validate_name("queue", &queue)?;
        self.queue = queue;
        Ok(self)
    }

    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    pub fn converter(mut self, converter: impl Converter + 'static) -> Self {
        self.converter = Arc::new(converter);
        self
    }

    pub fn topic_name(&self) -> &str {
        &self.topic
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn handler(&self) -> &Arc<dyn ActorHandler> {
        &self.handler
    }

    pub fn policy(&self) -> &dyn RetryPolicy {
        self.retry_policy.as_ref()
    }

    pub fn input_converter(&self) -> &dyn Converter {
        self.converter.as_ref()
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("topic", &self.topic)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::message::routing::Priority;

    #[tokio::test]
    async fn closure_handlers_see_their_arguments() {
        let actor = Actor::new(
            "double",
            handler_fn(|args: Arguments, _ctx: ActorContext| async move {
                let n = args.arg(0).and_then(|v| v.as_i64()).unwrap_or_default();
                ActorResult::Ok(Outcome::Success(Some(serde_json::json!(n * 2))))
            }),
        )
        .unwrap();
        assert_eq!(actor.queue_name(), DEFAULT_QUEUE);

        let context = ActorContext {
            key: RoutingKey::new("x1", "double", DEFAULT_QUEUE, Priority::Medium).unwrap(),
            parameters: Parameters::new(),
            broker: Arc::new(MemoryBroker::default()),
            cancel_token: CancellationToken::new(),
        };
        let args = actor.input_converter().convert_inputs("[21]").unwrap();
        let outcome = actor.handler().handle(args, context).await.unwrap();
        assert_eq!(outcome, Outcome::Success(Some(serde_json::json!(42))));
    }

    #[test]
    fn names_are_validated() {
        let noop = handler_fn(|_: Arguments, _: ActorContext| async { ActorResult::Ok(Outcome::Success(None)) });
        assert!(Actor::new("9lives", noop).is_err());

        let noop = handler_fn(|_: Arguments, _: ActorContext| async { ActorResult::Ok(Outcome::Success(None)) });
        let actor = Actor::new("ok", noop).unwrap();
        assert!(actor.queue("bad queue").is_err());
    }
}
