//! Dispatch-Q: a distributed job queue with pluggable brokers
//!
//! Producers enqueue addressable messages; brokers store and schedule them;
//! runners consume, execute and dispose of them with at-least-once delivery.
//! Supported:
//! - In-memory, Redis and AMQP brokers behind one [`MessageBroker`] trait
//! - Weighted-random priorities (HIGH/MEDIUM/LOW)
//! - Retries with backoff, one-shot delays, periodic (`defer_by`) and cron schedules
//! - TTLs and dead-lettering
//! - Crash recovery through a periodic maintenance sweep
//! - Out-of-band argument and result buckets
//! - Concurrency-bounded runners with graceful shutdown
//!
//! # Example
//!
//! ```rust,no_run
//! use dispatch_q::{handler_fn, Actor, ActorContext, ActorResult, Arguments, Connection, Job, Outcome, Priority, Runner};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = Connection::from_url("redis://127.0.0.1:6379")?
//!         .with_result_bucket_broker(Connection::bucket_broker_from_url("redis://127.0.0.1:6379")?);
//!     conn.connect().await?;
//!
//!     let send_email = Actor::new(
//!         "send_email",
//!         handler_fn(|args: Arguments, _ctx: ActorContext| async move {
//!             let to = args.kwarg("to").and_then(|v| v.as_str()).unwrap_or("unknown");
//!             println!("Sending email to: {}", to);
//!             ActorResult::Ok(Outcome::Success(Some(json!({"status": "delivered"}))))
//!         }),
//!     )?;
//!
//!     let handle = Job::new(&conn, "send_email")
//!         .payload(json!({"to": "user@example.com"}))
//!         .priority(Priority::High)
//!         .retries(5)
//!         .store_result(None)
//!         .enqueue()
//!         .await?;
//!
//!     let runner = Arc::new(Runner::builder(conn).actor(send_email).build()?);
//!     tokio::spawn({
//!         let runner = runner.clone();
//!         async move { runner.run_until_shutdown().await }
//!     });
//!
//!     let result = handle.result(std::time::Duration::from_secs(30)).await?;
//!     println!("Email result: {} (success: {})", result.data, result.success);
//!     Ok(())
//! }
//! ```

pub mod actor;
pub mod broker;
pub mod config;
pub mod connection;
pub mod job;
pub mod message;
pub mod runner;

// Re-export main types for easy access
pub use crate::actor::actor::{handler_fn, Actor, ActorContext, ActorHandler, ActorResult, Outcome};
pub use crate::actor::converter::{Arguments, Converter, JsonConverter};
pub use crate::actor::error::{ActorError, RetryableError};
pub use crate::actor::retry::{ExponentialBackoff, FixedBackoff, RetryPolicy};
pub use crate::broker::amqp::AmqpBroker;
pub use crate::broker::broker::{BucketBroker, Consumer, ConsumerCategory, MessageBroker};
pub use crate::broker::memory::{MemoryBroker, MemoryBucketBroker, QueueStats};
pub use crate::broker::redis::{RedisBroker, RedisBucketBroker, RedisConfig};
pub use crate::broker::signals::{SignalBus, SignalContext, SignalSubscriber};
pub use crate::config::{BrokerConfig, RunnerConfig};
pub use crate::connection::Connection;
pub use crate::job::job::{Job, JobHandle};
pub use crate::job::queue::Queue;
pub use crate::message::bucket::{ArgsBucket, Bucket, ResultBucket};
pub use crate::message::message::Message;
pub use crate::message::parameters::Parameters;
pub use crate::message::routing::{Priority, RoutingKey};
pub use crate::runner::error::WorkerError;
pub use crate::runner::processor::{Disposition, Processor};
pub use crate::runner::runner::{HealthFlag, MetricsSink, NoopMetrics, Runner, RunnerBuilder};
