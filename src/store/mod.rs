//! Pooled access to the backing key-value store.
//!
//! [`StorePool`] hands out one [`StoreConnection`] per operation. Connections are
//! owned guards: dropping one returns it to its pool, so every exit path of a
//! [`StoreClient`] call releases the connection it acquired.

pub mod memory;
pub mod redis;

use crate::cache::codec::{CodecError, ValueCodec};
use crate::cache::errors::CacheError;
use crate::utils::log_if_slow;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// SCAN batch size for pattern deletes.
const DELETE_SCAN_COUNT: usize = 100;
/// SCAN batch size for pattern counts.
const COUNT_SCAN_COUNT: usize = 1000;

const SLOW_CALL: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("store command failed: {0}")]
    Command(String),
    #[error("cached value could not be decoded")]
    Codec(#[from] CodecError),
}

/// One pooled connection, held for the duration of a single client operation.
#[async_trait]
pub trait StoreConnection: Send {
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError>;

    /// SETEX; returns the store's status reply.
    async fn set_ex(&mut self, key: &str, value: &str, ttl_secs: u64)
    -> Result<String, StoreError>;

    /// Returns the number of keys removed.
    async fn del(&mut self, key: &str) -> Result<u64, StoreError>;

    /// One SCAN round trip: `(next_cursor, keys)`. A next cursor of 0 ends the scan.
    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError>;

    async fn ping(&mut self) -> Result<(), StoreError>;

    /// Raw `INFO stats` text.
    async fn info_stats(&mut self) -> Result<String, StoreError>;
}

#[async_trait]
pub trait StorePool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn StoreConnection>, StoreError>;

    /// Store type reported in cache info, e.g. `redis`.
    fn kind(&self) -> &'static str;

    /// Open up to `count` connections ahead of traffic. Best effort.
    async fn warm_up(&self, _count: usize) {}
}

/// Counters and key count read from the store for statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub key_count: u64,
    pub evictions: u64,
}

/// Hit/miss/error counters owned by one client.
#[derive(Debug, Default)]
pub struct StoreCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl StoreCounters {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

/// Policy knobs a [`StoreClient`] applies to every call.
#[derive(Debug, Clone)]
pub struct StorePolicy {
    pub enabled: bool,
    pub fail_open: bool,
    pub stats_enabled: bool,
    pub key_prefix: String,
    pub codec: ValueCodec,
}

pub struct StoreClient {
    pool: Option<Arc<dyn StorePool>>,
    policy: StorePolicy,
    connected: AtomicBool,
    counters: StoreCounters,
    last_error: RwLock<Option<String>>,
}

impl StoreClient {
    /// Build a client and probe the store once.
    ///
    /// A failed probe leaves the client unavailable under fail-open, and is an
    /// error under fail-closed.
    pub async fn connect(
        pool: Option<Arc<dyn StorePool>>,
        policy: StorePolicy,
        warm_connections: usize,
    ) -> Result<Self, CacheError> {
        let client = Self {
            pool,
            policy,
            connected: AtomicBool::new(false),
            counters: StoreCounters::default(),
            last_error: RwLock::new(None),
        };

        if !client.policy.enabled {
            info!("store caching is disabled in configuration");
            return Ok(client);
        }

        let Some(pool) = client.pool.clone() else {
            return Ok(client);
        };

        match client.probe(pool.as_ref()).await {
            Ok(()) => {
                client.connected.store(true, Ordering::Release);
                info!(store = pool.kind(), "store connection test successful");
                if warm_connections > 0 {
                    pool.warm_up(warm_connections).await;
                }
                Ok(client)
            }
            Err(e) => {
                error!(store = pool.kind(), error = %e, "store connection test failed");
                client.record_error(e.to_string());
                if client.policy.fail_open {
                    Ok(client)
                } else {
                    Err(CacheError::Init(e))
                }
            }
        }
    }

    /// A client with no pool and caching switched off; every call is a no-op.
    pub fn disabled() -> Self {
        Self {
            pool: None,
            policy: StorePolicy {
                enabled: false,
                fail_open: true,
                stats_enabled: false,
                key_prefix: String::new(),
                codec: ValueCodec::new(false),
            },
            connected: AtomicBool::new(false),
            counters: StoreCounters::default(),
            last_error: RwLock::new(None),
        }
    }

    async fn probe(&self, pool: &dyn StorePool) -> Result<(), StoreError> {
        let mut conn = pool.acquire().await?;
        conn.ping().await
    }

    /// Re-run the connectivity probe without changing availability.
    pub async fn ping(&self) -> bool {
        let Some(pool) = self.available_pool() else {
            return false;
        };
        match self.probe(pool.as_ref()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "store ping failed");
                false
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.available_pool().is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.enabled
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn policy(&self) -> &StorePolicy {
        &self.policy
    }

    pub fn kind(&self) -> Option<&'static str> {
        self.pool.as_ref().map(|p| p.kind())
    }

    pub fn counters(&self) -> &StoreCounters {
        &self.counters
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn reset_counters(&self) {
        self.counters.reset();
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let Some(pool) = self.available_pool() else {
            return Ok(None);
        };

        let start = Instant::now();
        let result = self.try_get(pool.as_ref(), key).await;
        log_if_slow(start, SLOW_CALL, "cache get");

        match result {
            Ok(Some(value)) => {
                if self.policy.stats_enabled {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                }
                debug!(key, "cache hit");
                Ok(Some(value))
            }
            Ok(None) => {
                if self.policy.stats_enabled {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                }
                debug!(key, "cache miss");
                Ok(None)
            }
            Err(e) => self.fail_policy("get", key, e).map(|()| None),
        }
    }

    async fn try_get(&self, pool: &dyn StorePool, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = pool.acquire().await?;
        match conn.get(key).await? {
            Some(stored) => Ok(Some(self.policy.codec.decode(&stored)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, value: &str, ttl_secs: u32) -> Result<bool, CacheError> {
        let Some(pool) = self.available_pool() else {
            return Ok(false);
        };

        let start = Instant::now();
        let result = self.try_put(pool.as_ref(), key, value, ttl_secs).await;
        log_if_slow(start, SLOW_CALL, "cache put");

        match result {
            Ok(reply) => {
                debug!(key, ttl_secs, "cached value");
                Ok(reply == "OK")
            }
            Err(e) => self.fail_policy("put", key, e).map(|()| false),
        }
    }

    async fn try_put(
        &self,
        pool: &dyn StorePool,
        key: &str,
        value: &str,
        ttl_secs: u32,
    ) -> Result<String, StoreError> {
        let stored = self.policy.codec.encode(value)?;
        let mut conn = pool.acquire().await?;
        conn.set_ex(key, &stored, u64::from(ttl_secs)).await
    }

    /// Always fails open, regardless of the configured policy.
    pub async fn delete(&self, key: &str) -> bool {
        let Some(pool) = self.available_pool() else {
            return false;
        };

        let result = async {
            let mut conn = pool.acquire().await?;
            conn.del(key).await
        }
        .await;

        match result {
            Ok(deleted) => {
                debug!(key, found = deleted > 0, "deleted key");
                deleted > 0
            }
            Err(e) => {
                self.record_failure("delete", key, &e);
                false
            }
        }
    }

    /// Cursor-scan `pattern` and delete every match individually. Always fails open.
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        let Some(pool) = self.available_pool() else {
            return 0;
        };

        let result = async {
            let mut conn = pool.acquire().await?;
            let mut deleted = 0u64;
            let mut cursor = 0u64;
            loop {
                let (next, keys) = conn.scan(cursor, pattern, DELETE_SCAN_COUNT).await?;
                for key in &keys {
                    deleted += conn.del(key).await?;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok::<_, StoreError>(deleted)
        }
        .await;

        match result {
            Ok(deleted) => {
                info!(pattern, deleted, "deleted keys matching pattern");
                deleted
            }
            Err(e) => {
                self.record_failure("delete_pattern", pattern, &e);
                0
            }
        }
    }

    pub async fn clear_all(&self) -> u64 {
        info!(prefix = %self.policy.key_prefix, "clearing all cache keys");
        let pattern = format!("{}*", self.policy.key_prefix);
        self.delete_pattern(&pattern).await
    }

    /// Cursor-scan `pattern` and count matches. Always fails open.
    pub async fn count_pattern(&self, pattern: &str) -> u64 {
        let Some(pool) = self.available_pool() else {
            return 0;
        };

        let result = async {
            let mut conn = pool.acquire().await?;
            count_keys(&mut *conn, pattern).await
        }
        .await;

        match result {
            Ok(count) => {
                debug!(pattern, count, "counted keys matching pattern");
                count
            }
            Err(e) => {
                self.record_failure("count_pattern", pattern, &e);
                0
            }
        }
    }

    /// Key count for the configured prefix plus the store's eviction counter,
    /// read over a single connection.
    pub async fn collect_store_stats(&self) -> StoreStats {
        let Some(pool) = self.available_pool() else {
            debug!("store statistics not collected, store unavailable");
            return StoreStats::default();
        };

        let start = Instant::now();
        let pattern = format!("{}*", self.policy.key_prefix);
        let result = async {
            let mut conn = pool.acquire().await?;
            let key_count = count_keys(&mut *conn, &pattern).await?;
            let evictions = match conn.info_stats().await {
                Ok(info) => parse_evicted_keys(&info),
                Err(e) => {
                    warn!(error = %e, "failed to read store INFO stats");
                    0
                }
            };
            Ok::<_, StoreError>(StoreStats {
                key_count,
                evictions,
            })
        }
        .await;
        log_if_slow(start, SLOW_CALL, "store stats collection");

        match result {
            Ok(stats) => {
                info!(
                    keys = stats.key_count,
                    evictions = stats.evictions,
                    "cache stats collected"
                );
                stats
            }
            Err(e) => {
                error!(error = %e, "failed to collect store statistics");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.record_error(format!("Failed to get stats: {e}"));
                StoreStats::default()
            }
        }
    }

    fn available_pool(&self) -> Option<&Arc<dyn StorePool>> {
        if self.policy.enabled && self.is_connected() {
            self.pool.as_ref()
        } else {
            None
        }
    }

    /// Count, record and either swallow or propagate a get/put failure.
    fn fail_policy(&self, operation: &'static str, key: &str, e: StoreError) -> Result<(), CacheError> {
        self.record_failure(operation, key, &e);
        if self.policy.fail_open {
            Ok(())
        } else {
            Err(CacheError::FailClosed {
                operation,
                source: e,
            })
        }
    }

    fn record_failure(&self, operation: &'static str, target: &str, e: &StoreError) {
        error!(operation, target, error = %e, "cache operation failed");
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.record_error(e.to_string());
    }

    fn record_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }
}

async fn count_keys(conn: &mut dyn StoreConnection, pattern: &str) -> Result<u64, StoreError> {
    let mut total = 0u64;
    let mut cursor = 0u64;
    loop {
        trace!(cursor, pattern, "executing SCAN");
        let (next, keys) = conn.scan(cursor, pattern, COUNT_SCAN_COUNT).await?;
        total += keys.len() as u64;
        if next == 0 {
            return Ok(total);
        }
        cursor = next;
    }
}

/// Extract `evicted_keys` from `INFO stats` output; 0 when absent or malformed.
fn parse_evicted_keys(info: &str) -> u64 {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("evicted_keys:"))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
