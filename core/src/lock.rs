// Named, TTL-bounded mutual exclusion shared by every scheduler process
//
// Two implementations: `RedLock` (Redis SET NX EX with a compare-and-delete
// release) for multi-process deployments and `LocalLock` for a single process.

use crate::db::RedisPool;
use crate::errors::LockError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Distributed lock trait for ensuring exclusive access to a named resource
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire a lock on the specified resource with a TTL
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError>;

    /// Release a previously acquired lock
    async fn release(&self, guard: LockGuard) -> Result<(), LockError>;
}

/// Proof of ownership for an acquired lock.
///
/// Guards must be handed back through `DistributedLock::release`; a guard that
/// is dropped instead simply expires after its TTL.
#[derive(Debug)]
pub struct LockGuard {
    resource: String,
    token: String,
    acquired_at: Instant,
    ttl: Duration,
}

impl LockGuard {
    fn new(resource: &str, ttl: Duration) -> Self {
        Self {
            resource: resource.to_string(),
            token: Uuid::new_v4().to_string(),
            acquired_at: Instant::now(),
            ttl,
        }
    }

    /// Get the resource name this lock guards
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get the time elapsed since lock acquisition
    pub fn elapsed(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

/// Retry policy applied while a lock is contended
#[derive(Debug, Clone, Copy)]
pub struct LockRetry {
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

async fn acquire_with_retry<F, Fut>(
    resource: &str,
    retry: LockRetry,
    mut try_once: F,
) -> Result<LockGuard, LockError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<LockGuard, LockError>>,
{
    let mut attempts = 0;

    loop {
        match try_once().await {
            Ok(guard) => {
                debug!(
                    resource = %resource,
                    attempts = attempts + 1,
                    "Lock acquired successfully"
                );
                return Ok(guard);
            }
            Err(LockError::AlreadyHeld(held)) => {
                attempts += 1;
                if attempts >= retry.retry_count.max(1) {
                    warn!(
                        resource = %resource,
                        attempts,
                        "Failed to acquire lock after all retries"
                    );
                    return Err(LockError::AlreadyHeld(held));
                }

                debug!(
                    resource = %resource,
                    attempt = attempts,
                    retry_delay_ms = retry.retry_delay.as_millis(),
                    "Lock contended, retrying"
                );

                sleep(retry.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Redis
// ============================================================================

/// Redis-backed lock shared by every scheduler process
pub struct RedLock {
    pool: RedisPool,
    retry: LockRetry,
    key_prefix: String,
}

impl RedLock {
    /// Create a new RedLock instance
    pub fn new(pool: RedisPool) -> Self {
        Self::with_retry(pool, LockRetry::default())
    }

    /// Create a RedLock with custom retry configuration
    pub fn with_retry(pool: RedisPool, retry: LockRetry) -> Self {
        Self {
            pool,
            retry,
            key_prefix: "lock:scheduler.job".to_string(),
        }
    }

    fn key(&self, resource: &str) -> String {
        format!("{}.{}", self.key_prefix, resource)
    }

    async fn try_acquire_once(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let mut conn = self.pool.get_connection();
        let guard = LockGuard::new(resource, ttl);

        // SET NX EX sets the key only if absent, with expiration
        let result: Option<String> = redis::cmd("SET")
            .arg(self.key(resource))
            .arg(guard.token())
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        if result.is_some() {
            Ok(guard)
        } else {
            Err(LockError::AlreadyHeld(resource.to_string()))
        }
    }
}

#[async_trait]
impl DistributedLock for RedLock {
    #[instrument(skip(self), fields(resource = %resource, ttl_seconds = ttl.as_secs()))]
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        acquire_with_retry(resource, self.retry, move || self.try_acquire_once(resource, ttl)).await
    }

    #[instrument(skip(self, guard), fields(resource = %guard.resource()))]
    async fn release(&self, guard: LockGuard) -> Result<(), LockError> {
        let mut conn = self.pool.get_connection();

        // Only delete the key while it still carries our token
        let script = r#"
            if redis.call("get", KEYS[1]) == ARGV[1] then
                return redis.call("del", KEYS[1])
            else
                return 0
            end
        "#;

        let result: i32 = redis::Script::new(script)
            .key(self.key(guard.resource()))
            .arg(guard.token())
            .invoke_async(&mut conn)
            .await?;

        if result == 1 {
            debug!(held_ms = guard.elapsed().as_millis(), "Lock released");
            Ok(())
        } else {
            warn!(
                held_ms = guard.elapsed().as_millis(),
                "Lock was not owned or already expired"
            );
            Err(LockError::NotOwned(guard.resource().to_string()))
        }
    }
}

// ============================================================================
// In-process
// ============================================================================

/// Lock table for a single process; same TTL and ownership rules as `RedLock`
#[derive(Default)]
pub struct LocalLock {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    retry: LockRetry,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(retry: LockRetry) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retry,
        }
    }

    fn try_acquire_once(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".to_string()))?;

        let now = Instant::now();
        if let Some((_, expires_at)) = entries.get(resource) {
            if *expires_at > now {
                return Err(LockError::AlreadyHeld(resource.to_string()));
            }
        }

        let guard = LockGuard::new(resource, ttl);
        entries.insert(resource.to_string(), (guard.token().to_string(), now + ttl));
        Ok(guard)
    }

    /// Whether the resource is currently held and unexpired
    pub fn is_locked(&self, resource: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .get(resource)
                    .is_some_and(|(_, expires_at)| *expires_at > Instant::now())
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        acquire_with_retry(resource, self.retry, move || async move {
            self.try_acquire_once(resource, ttl)
        })
        .await
    }

    async fn release(&self, guard: LockGuard) -> Result<(), LockError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".to_string()))?;

        match entries.get(guard.resource()) {
            Some((token, _)) if token == guard.token() => {
                entries.remove(guard.resource());
                Ok(())
            }
            _ => {
                info!(resource = %guard.resource(), "Lock expired before release");
                Err(LockError::NotOwned(guard.resource().to_string()))
            }
        }
    }
}
