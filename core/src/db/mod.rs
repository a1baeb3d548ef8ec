// Database layer module
// Store contracts plus PostgreSQL, Redis and in-memory backends

pub mod memory;
pub mod pool;
pub mod redis;
pub mod repositories;
pub mod store;

pub use memory::{Isolation, MemoryJobLogSink, MemoryStore};
pub use pool::DbPool;
pub use self::redis::RedisPool;
pub use repositories::{PgJobLogRepository, PgSchedulerStore};
pub use store::{JobDetailStore, JobFiredStore, JobLogSink, SchedulerStore, StoreTransaction};
