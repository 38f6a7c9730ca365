use crate::broker::broker::Structure;
use crate::message::routing::Priority;

/// Maps a logical `(queue, priority, structure)` to a physical resource name.
pub trait QueueNaming: Send + Sync {
    fn resource(&self, queue: &str, priority: Priority, structure: Structure) -> String;
}

/// Redis layout: one list (ready, dead) or sorted set (delayed) per priority tier,
/// a hash per message, and one processing index scored by deadline.
#[derive(Debug, Clone)]
pub struct RedisNaming {
    prefix: String,
}

impl Default for RedisNaming {
    fn default() -> Self {
        Self::new("dq")
    }
}

impl RedisNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn message(&self, id: &str) -> String {
        format!("{}:m:{}", self.prefix, id)
    }

    pub fn processing(&self) -> String {
        format!("{}:processing", self.prefix)
    }

    pub fn bucket(&self, id: &str) -> String {
        format!("{}:b:{}", self.prefix, id)
    }

    /// Every key of a logical queue, all tiers and structures.
    pub fn queue_keys(&self, queue: &str) -> Vec<String> {
        Priority::ALL
            .iter()
            .flat_map(|p| Structure::ALL.iter().map(move |s| self.resource(queue, *p, *s)))
            .collect()
    }
}

impl QueueNaming for RedisNaming {
    fn resource(&self, queue: &str, priority: Priority, structure: Structure) -> String {
        let tag = match structure {
            Structure::Ready => "q",
            Structure::Delayed => "d",
            Structure::Dead => "x",
        };
        format!("{}:{}:{}:{}", self.prefix, tag, queue, priority.as_str())
    }
}

/// AMQP layout: three server queues per logical queue; priority is a message
/// property (`x-max-priority`), not part of the name.
#[derive(Debug, Clone, Default)]
pub struct AmqpNaming;

impl AmqpNaming {
    pub fn ready(&self, queue: &str) -> String {
        queue.to_string()
    }

    pub fn delayed(&self, queue: &str) -> String {
        format!("{queue}.delayed")
    }

    pub fn dead(&self, queue: &str) -> String {
        format!("{queue}.dead")
    }

    /// AMQP 0-9-1 priority byte: higher is more urgent.
    pub fn priority_byte(priority: Priority) -> u8 {
        match priority {
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }
}

impl QueueNaming for AmqpNaming {
    fn resource(&self, queue: &str, _priority: Priority, structure: Structure) -> String {
        match structure {
            Structure::Ready => self.ready(queue),
            Structure::Delayed => self.delayed(queue),
            Structure::Dead => self.dead(queue),
        }
    }
}
