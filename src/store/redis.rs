//! Redis backend over a deadpool connection pool.

use super::{StoreConnection, StoreError, StorePool};
use crate::config::Config;
use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Connection, Pool, PoolConfig, Runtime, Timeouts};
use futures::future::join_all;
use tracing::{debug, info, warn};

pub struct RedisPool {
    pool: Pool,
}

impl RedisPool {
    /// Build the pool from configuration. No connection is opened here.
    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        let mut pool_config = PoolConfig::new(config.redis_pool_max_total.max(1));
        pool_config.timeouts = Timeouts {
            wait: Some(config.redis_timeout),
            create: Some(config.redis_timeout),
            recycle: Some(config.redis_timeout),
        };

        let mut redis_config = deadpool_redis::Config::from_url(connection_url(config));
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        info!(
            host = %config.redis_host,
            port = config.redis_port,
            database = config.redis_database,
            max_total = config.redis_pool_max_total,
            warm_up = config.redis_pool_min_idle,
            timeout = ?config.redis_timeout,
            "redis pool configured"
        );

        Ok(Self { pool })
    }
}

/// `redis://[:password@]host:port/db`, with the password percent-encoded.
fn connection_url(config: &Config) -> String {
    let auth = match config.redis_password.as_deref() {
        Some(password) if !password.is_empty() => {
            format!(":{}@", urlencoding::encode(password))
        }
        _ => String::new(),
    };
    format!(
        "redis://{auth}{}:{}/{}",
        config.redis_host, config.redis_port, config.redis_database
    )
}

fn command_error(e: redis::RedisError) -> StoreError {
    StoreError::Command(e.to_string())
}

#[async_trait]
impl StorePool for RedisPool {
    async fn acquire(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        Ok(Box::new(RedisConnection { conn }))
    }

    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn warm_up(&self, count: usize) {
        let count = count.min(self.pool.status().max_size);
        // Hold all connections at once so the pool has to open `count` of them.
        let results = join_all((0..count).map(|_| self.pool.get())).await;
        let opened = results.iter().filter(|r| r.is_ok()).count();
        if let Some(Err(e)) = results.iter().find(|r| r.is_err()) {
            warn!(error = %e, opened, requested = count, "pool warm-up incomplete");
        } else {
            debug!(opened, "pool warmed up");
        }
    }
}

/// A pooled connection; dropping it returns it to the pool.
struct RedisConnection {
    conn: Connection,
}

#[async_trait]
impl StoreConnection for RedisConnection {
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn.get(key).await.map_err(command_error)
    }

    async fn set_ex(
        &mut self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<String, StoreError> {
        let reply: String = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async(&mut self.conn)
            .await
            .map_err(command_error)?;
        Ok(reply)
    }

    async fn del(&mut self, key: &str) -> Result<u64, StoreError> {
        self.conn.del(key).await.map_err(command_error)
    }

    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn)
            .await
            .map_err(command_error)?;
        Ok((next, keys))
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        let _: String = redis::cmd("PING")
            .query_async(&mut self.conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn info_stats(&mut self) -> Result<String, StoreError> {
        redis::cmd("INFO")
            .arg("stats")
            .query_async(&mut self.conn)
            .await
            .map_err(command_error)
    }
}
