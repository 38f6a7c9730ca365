pub mod bucket;
pub mod engine;
mod lua;
pub mod pool;

pub use bucket::RedisBucketBroker;
pub use engine::RedisBroker;
pub use pool::RedisConfig;
