pub mod amqp;
#[allow(clippy::module_inception)]
pub mod broker;
pub mod consumer;
pub mod memory;
pub mod naming;
pub mod priority;
pub mod redis;
pub mod signals;
