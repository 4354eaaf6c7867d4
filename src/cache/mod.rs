//! Caching layer in front of the graph-query backend.
//!
//! [`CacheFacade`] is the only type callers need: it owns the store client, the
//! request coalescer and the statistics memo. A facade built with
//! [`CacheFacade::disabled`] never touches a store and answers every call with its
//! no-op result.

pub mod codec;
pub mod coalesce;
pub mod errors;
pub mod key;
pub mod lookup;
pub mod stats;
pub mod stats_cache;

pub use codec::{CodecError, ValueCodec};
pub use coalesce::{
    CoalescedResult, CoalescingSnapshot, LeaderGuard, Registration, RequestCoalescer, Role,
};
pub use errors::{CacheError, LookupError};
pub use key::{CacheKey, route_pattern};
pub use lookup::{Lookup, LookupSource};
pub use stats::{CacheInfo, CacheStats};
pub use stats_cache::StatsCache;

use crate::config::{Config, StoreKind};
use crate::store::memory::MemoryStore;
use crate::store::redis::RedisPool;
use crate::store::{StoreClient, StoreCounters, StorePolicy, StorePool};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Connection details echoed back through [`CacheInfo`].
#[derive(Debug, Clone)]
struct Settings {
    host: String,
    port: u16,
    database: u8,
    default_ttl_seconds: u32,
    coalescing_timeout: Duration,
}

struct CacheInner {
    store: StoreClient,
    coalescer: Arc<RequestCoalescer>,
    stats: StatsCache,
    /// `None` for the no-op facade.
    settings: Option<Settings>,
}

#[derive(Clone)]
pub struct CacheFacade {
    inner: Arc<CacheInner>,
}

impl CacheFacade {
    /// Build the facade the configuration asks for.
    ///
    /// With caching disabled this is [`CacheFacade::disabled`]. Otherwise the store
    /// named by `cache_store` is created and probed once.
    pub async fn connect(config: &Config) -> Result<Self, CacheError> {
        if !config.redis_enabled {
            info!("caching disabled, using no-op cache");
            return Ok(Self::disabled());
        }

        let pool: Option<Arc<dyn StorePool>> = match config.cache_store {
            StoreKind::Memory => Some(Arc::new(MemoryStore::new())),
            StoreKind::Redis => match RedisPool::from_config(config) {
                Ok(pool) => Some(Arc::new(pool)),
                Err(e) if config.cache_fail_open => {
                    error!(error = %e, "failed to create redis pool, cache unavailable");
                    None
                }
                Err(e) => return Err(CacheError::Init(e)),
            },
        };

        Self::build(config, pool).await
    }

    /// Build the facade over an already constructed store.
    pub async fn with_pool(config: &Config, pool: Arc<dyn StorePool>) -> Result<Self, CacheError> {
        Self::build(config, Some(pool)).await
    }

    async fn build(config: &Config, pool: Option<Arc<dyn StorePool>>) -> Result<Self, CacheError> {
        let policy = StorePolicy {
            enabled: config.redis_enabled,
            fail_open: config.cache_fail_open,
            stats_enabled: config.cache_stats_enabled,
            key_prefix: config.cache_key_prefix.clone(),
            codec: ValueCodec::new(config.cache_compression_enabled),
        };
        let store = StoreClient::connect(pool, policy, config.redis_pool_min_idle).await?;

        let coalescer = Arc::new(RequestCoalescer::with_stale_threshold(
            config.cache_coalescing_enabled,
            config.cache_coalescing_timeout,
            config.cache_coalescing_stale_threshold,
        ));

        info!(
            store = store.kind().unwrap_or("none"),
            available = store.is_available(),
            prefix = %config.cache_key_prefix,
            default_ttl = config.cache_default_ttl_seconds,
            compression = config.cache_compression_enabled,
            fail_open = config.cache_fail_open,
            coalescing = config.cache_coalescing_enabled,
            "cache initialized"
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                store,
                coalescer,
                stats: StatsCache::new(config.cache_stats_ttl, config.cache_coalescing_timeout),
                settings: Some(Settings {
                    host: config.redis_host.clone(),
                    port: config.redis_port,
                    database: config.redis_database,
                    default_ttl_seconds: config.cache_default_ttl_seconds,
                    coalescing_timeout: config.cache_coalescing_timeout,
                }),
            }),
        })
    }

    /// A facade that caches nothing and never opens a connection.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store: StoreClient::disabled(),
                coalescer: Arc::new(RequestCoalescer::disabled()),
                stats: StatsCache::new(Duration::ZERO, Duration::ZERO),
                settings: None,
            }),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.inner.store.get(key).await
    }

    pub async fn put(&self, key: &str, value: &str, ttl_secs: u32) -> Result<bool, CacheError> {
        self.inner.store.put(key, value, ttl_secs).await
    }

    /// [`put`](Self::put) with the configured default TTL.
    pub async fn put_default(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        self.put(key, value, self.default_ttl_seconds()).await
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.inner.store.delete(key).await
    }

    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        self.inner.store.delete_pattern(pattern).await
    }

    /// Delete every cached result of one route.
    pub async fn invalidate_route(&self, route_id: &str) -> u64 {
        if !self.is_available() {
            return 0;
        }
        let pattern = route_pattern(self.key_prefix(), route_id);
        self.delete_pattern(&pattern).await
    }

    pub async fn clear_all(&self) -> u64 {
        self.inner.store.clear_all().await
    }

    pub async fn count_pattern(&self, pattern: &str) -> u64 {
        self.inner.store.count_pattern(pattern).await
    }

    /// Current statistics, memoized for the configured stats TTL.
    pub async fn stats(&self) -> CacheStats {
        if self.inner.settings.is_none() {
            return CacheStats::empty();
        }

        let inner = &self.inner;
        inner
            .stats
            .get_or_collect(|| async move {
                let store = inner.store.collect_store_stats().await;
                CacheStats::from_parts(inner.store.counters(), store, inner.coalescer.snapshot())
            })
            .await
    }

    pub fn is_available(&self) -> bool {
        self.inner.store.is_available()
    }

    /// Probe the store; false when unavailable.
    pub async fn ping(&self) -> bool {
        self.inner.store.ping().await
    }

    pub fn info(&self) -> CacheInfo {
        let Some(settings) = &self.inner.settings else {
            return CacheInfo::noop();
        };
        let store = &self.inner.store;
        let policy = store.policy();

        CacheInfo {
            enabled: store.is_enabled(),
            connected: store.is_connected(),
            store_type: store.kind().unwrap_or("none").to_owned(),
            host: settings.host.clone(),
            port: settings.port,
            database: settings.database,
            key_prefix: policy.key_prefix.clone(),
            default_ttl_seconds: settings.default_ttl_seconds,
            compression_enabled: policy.codec.compression_enabled(),
            fail_open: policy.fail_open,
            coalescing_enabled: self.inner.coalescer.is_enabled(),
            coalescing_timeout_ms: settings.coalescing_timeout.as_millis() as u64,
            error_message: store.last_error(),
        }
    }

    /// Live hit/miss/error counters, unaffected by the stats memo.
    pub fn counters(&self) -> &StoreCounters {
        self.inner.store.counters()
    }

    pub fn coalescer(&self) -> &Arc<RequestCoalescer> {
        &self.inner.coalescer
    }

    /// Derive the key for one query under this facade's prefix.
    pub fn key_for(
        &self,
        route_id: &str,
        query: &str,
        graph_source: Option<&str>,
        layers: Option<&str>,
    ) -> String {
        let mut key = CacheKey::new(self.key_prefix(), route_id, query);
        if let Some(uri) = graph_source {
            key = key.graph_source(uri);
        }
        if let Some(layers) = layers {
            key = key.layers(layers);
        }
        key.generate()
    }

    /// Zero hit/miss/error and coalescing counters.
    pub fn reset_stats(&self) {
        self.inner.store.reset_counters();
        self.inner.coalescer.reset_stats();
        self.inner.stats.invalidate();
        info!("cache statistics reset");
    }

    /// Periodically fail in-flight registrations older than the stale threshold.
    ///
    /// The task ends once every clone of this facade has been dropped. Returns `None`
    /// when coalescing is disabled.
    pub fn spawn_stale_cleanup(&self, interval: Duration) -> Option<JoinHandle<()>> {
        if !self.inner.coalescer.is_enabled() || interval.is_zero() {
            return None;
        }

        let inner: Weak<CacheInner> = Arc::downgrade(&self.inner);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    debug!("cache dropped, stopping stale cleanup");
                    return;
                };
                inner.coalescer.cleanup_stale_entries();
            }
        }))
    }

    pub fn key_prefix(&self) -> &str {
        &self.inner.store.policy().key_prefix
    }

    pub fn default_ttl_seconds(&self) -> u32 {
        self.inner
            .settings
            .as_ref()
            .map_or(0, |s| s.default_ttl_seconds)
    }
}
