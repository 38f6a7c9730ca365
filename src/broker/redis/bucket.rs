use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::debug;

use crate::broker::broker::BucketBroker;
use crate::broker::naming::RedisNaming;
use crate::broker::redis::pool::{checkout, PoolSlot, RedisConfig};
use crate::message::bucket::Bucket;
use crate::message::routing::validate_id;
use crate::runner::error::WorkerError;

/// Buckets as plain string keys; a bucket ttl becomes the key's `PX` expiry.
#[derive(Clone)]
pub struct RedisBucketBroker {
    inner: Arc<BucketInner>,
}

struct BucketInner {
    slot: PoolSlot,
    naming: RedisNaming,
}

impl RedisBucketBroker {
    pub fn new(redis_url: &str, redis_config: RedisConfig, key_prefix: &str) -> Self {
        Self {
            inner: Arc::new(BucketInner {
                slot: PoolSlot::new(redis_url, redis_config),
                naming: RedisNaming::new(key_prefix),
            }),
        }
    }
}

#[async_trait]
impl BucketBroker for RedisBucketBroker {
    async fn connect(&self) -> Result<(), WorkerError> {
        self.inner.slot.connect().await
    }

    async fn disconnect(&self) -> Result<(), WorkerError> {
        self.inner.slot.disconnect().await;
        Ok(())
    }

    async fn get_bucket(&self, id: &str) -> Result<Option<Bucket>, WorkerError> {
        let pool = self.inner.slot.pool().await?;
        let mut conn = checkout(&pool).await?;
        let raw: Option<String> = conn.get(self.inner.naming.bucket(id)).await?;
        match raw {
            Some(raw) => {
                let bucket = Bucket::decode(&raw)
                    .map_err(|e| WorkerError::Bucket(format!("corrupt bucket {id}: {e}")))?;
                Ok((!bucket.is_overdue()).then_some(bucket))
            }
            None => Ok(None),
        }
    }

    async fn store_bucket(&self, id: &str, bucket: &Bucket) -> Result<(), WorkerError> {
        validate_id(id)?;
        let encoded = bucket.encode()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.inner.naming.bucket(id)).arg(encoded);
        if let Some(ttl) = bucket.ttl() {
            let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(ms);
        }
        let pool = self.inner.slot.pool().await?;
        let mut conn = checkout(&pool).await?;
        let _: () = cmd.query_async(&mut *conn).await?;
        debug!(bucket_id = %id, "Bucket stored");
        Ok(())
    }

    async fn delete_bucket(&self, id: &str) -> Result<(), WorkerError> {
        let pool = self.inner.slot.pool().await?;
        let mut conn = checkout(&pool).await?;
        let _: () = conn.del(self.inner.naming.bucket(id)).await?;
        Ok(())
    }
}
