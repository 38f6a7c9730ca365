use crate::connection::Connection;
use crate::job::job::Job;
use crate::message::routing::validate_name;
use crate::runner::error::WorkerError;

/// Administrative handle to one logical queue.
#[derive(Debug, Clone)]
pub struct Queue {
    connection: Connection,
    name: String,
}

impl Queue {
    pub fn new(connection: &Connection, name: impl Into<String>) -> Result<Self, WorkerError> {
        let name = name.into();
        validate_name("queue", &name)?;
        Ok(Self {
            connection: connection.clone(),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates the READY, DELAYED and DEAD structures.
    pub async fn declare(&self) -> Result<(), WorkerError> {
        self.connection.broker().queue_declare(&self.name).await
    }

    /// Drops every message at rest; in-flight messages are left alone.
    pub async fn flush(&self) -> Result<(), WorkerError> {
        self.connection.broker().queue_flush(&self.name).await
    }

    pub async fn delete(&self) -> Result<(), WorkerError> {
        self.connection.broker().queue_delete(&self.name).await
    }

    /// A job bound to this queue.
    pub fn job(&self, topic: impl Into<String>) -> Job<'_> {
        Job::new(&self.connection, topic).queue(self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use std::sync::Arc;

    #[tokio::test]
    async fn flush_empties_the_queue() {
        let broker = MemoryBroker::default();
        let conn = Connection::new(Arc::new(broker.clone()));
        conn.connect().await.unwrap();

        assert!(Queue::new(&conn, "no spaces").is_err());
        let queue = Queue::new(&conn, "emails").unwrap();
        queue.declare().await.unwrap();
        queue.job("send").enqueue().await.unwrap();
        queue.job("send").enqueue().await.unwrap();
        assert_eq!(broker.stats("emails").await.ready, 2);

        queue.flush().await.unwrap();
        assert_eq!(broker.stats("emails").await.ready, 0);
        queue.delete().await.unwrap();
    }
}
