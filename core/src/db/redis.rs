// Redis connection used by the distributed lock

use crate::config::RedisConfig;
use crate::errors::LockError;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{info, instrument};

/// Redis connection wrapper
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
}

impl RedisPool {
    #[instrument(skip(config), fields(redis_url = %config.url))]
    pub async fn new(config: &RedisConfig) -> Result<Self, LockError> {
        info!("Initializing Redis connection");

        let client = Client::open(config.url.as_str()).map_err(|e| {
            LockError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            LockError::ConnectionFailed(format!("Failed to create connection manager: {}", e))
        })?;

        info!("Redis connection initialized");

        Ok(Self { manager })
    }

    /// Get a handle to the shared connection
    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Verify the Redis connection answers PING
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), LockError> {
        let mut conn = self.get_connection();

        let response: String = redis::cmd("PING").query_async(&mut conn).await?;

        if response != "PONG" {
            return Err(LockError::Backend(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_health_check() {
        let config = RedisConfig {
            url: "redis://localhost:6379".to_string(),
        };

        let pool = RedisPool::new(&config).await.unwrap();
        assert!(pool.health_check().await.is_ok());
    }
}
