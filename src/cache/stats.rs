//! Serializable views of cache state for operators.

use crate::cache::coalesce::CoalescingSnapshot;
use crate::store::{StoreCounters, StoreStats};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub evictions: u64,
    pub key_count: u64,
    pub coalesced: u64,
    pub coalescing_leaders: u64,
    pub coalescing_timeouts: u64,
    pub coalescing_failures: u64,
    pub coalescing_in_flight: u64,
    pub coalescing_enabled: bool,
    pub forced_takeovers: u64,
    pub stale_cleaned: u64,
    pub collected_at: DateTime<Utc>,
}

impl CacheStats {
    /// All-zero statistics, as reported when caching is disabled.
    pub fn empty() -> Self {
        Self::from_parts(
            &StoreCounters::default(),
            StoreStats::default(),
            CoalescingSnapshot::default(),
        )
    }

    pub fn from_parts(
        counters: &StoreCounters,
        store: StoreStats,
        coalescing: CoalescingSnapshot,
    ) -> Self {
        Self {
            hits: counters.hits(),
            misses: counters.misses(),
            errors: counters.errors(),
            evictions: store.evictions,
            key_count: store.key_count,
            coalesced: coalescing.coalesced,
            coalescing_leaders: coalescing.leaders,
            coalescing_timeouts: coalescing.timeouts,
            coalescing_failures: coalescing.failures,
            coalescing_in_flight: coalescing.in_flight,
            coalescing_enabled: coalescing.enabled,
            forced_takeovers: coalescing.forced_takeovers,
            stale_cleaned: coalescing.stale_cleaned,
            collected_at: Utc::now(),
        }
    }

    /// `hits / (hits + misses)`, or 0 before any lookup.
    pub fn hit_ratio(&self) -> f64 {
        ratio(self.hits, self.hits + self.misses)
    }

    /// Share of requests that joined an in-flight leader instead of computing.
    pub fn coalescing_ratio(&self) -> f64 {
        ratio(self.coalesced, self.coalesced + self.coalescing_leaders)
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Connection and policy summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub enabled: bool,
    pub connected: bool,
    #[serde(rename = "type")]
    pub store_type: String,
    pub host: String,
    pub port: u16,
    pub database: u8,
    pub key_prefix: String,
    pub default_ttl_seconds: u32,
    pub compression_enabled: bool,
    pub fail_open: bool,
    pub coalescing_enabled: bool,
    pub coalescing_timeout_ms: u64,
    pub error_message: Option<String>,
}

impl CacheInfo {
    pub fn noop() -> Self {
        Self {
            enabled: false,
            connected: false,
            store_type: "noop".to_owned(),
            host: "N/A".to_owned(),
            port: 0,
            database: 0,
            key_prefix: String::new(),
            default_ttl_seconds: 0,
            compression_enabled: false,
            fail_open: true,
            coalescing_enabled: false,
            coalescing_timeout_ms: 0,
            error_message: None,
        }
    }
}
