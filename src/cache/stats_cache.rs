//! Short-lived memo for collected statistics.
//!
//! Collecting statistics scans the whole key prefix, so repeated polling inside the
//! TTL is served from memory and concurrent misses share a single collection.

use crate::cache::coalesce::{CoalescedResult, RequestCoalescer};
use crate::cache::stats::CacheStats;
use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

const STATS_KEY: &str = "stats";
/// Waits on other pollers' collections before collecting without coordination.
const MAX_WAIT_ROUNDS: u32 = 3;

pub struct StatsCache {
    ttl: Duration,
    cached: Mutex<Option<(Instant, CacheStats)>>,
    collections: RequestCoalescer<CacheStats>,
}

impl StatsCache {
    /// `wait` bounds how long a concurrent poller waits on another's collection.
    pub fn new(ttl: Duration, wait: Duration) -> Self {
        Self {
            ttl,
            cached: Mutex::new(None),
            collections: RequestCoalescer::new(true, wait),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Serve the memoized statistics, or run `collect` when they are missing or expired.
    pub async fn get_or_collect<F, Fut>(&self, collect: F) -> CacheStats
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheStats>,
    {
        if self.ttl.is_zero() {
            return collect().await;
        }

        if let Some(stats) = self.fresh() {
            return stats;
        }

        let mut registration = self.collections.register_request(STATS_KEY);
        let mut rounds = 0;
        while !registration.is_leader() {
            rounds += 1;
            let outcome = self.collections.await_default(&registration).await.ok().flatten();
            match outcome {
                Some(CoalescedResult::Success(stats)) => return stats,
                _ if rounds >= MAX_WAIT_ROUNDS => {
                    debug!(rounds, "shared stats collection unavailable, collecting directly");
                    let stats = collect().await;
                    self.store(stats.clone());
                    return stats;
                }
                Some(CoalescedResult::Failure(_)) => {
                    if let Some(stats) = self.fresh() {
                        return stats;
                    }
                    registration = self.collections.register_request(STATS_KEY);
                }
                None => registration = self.collections.take_over(STATS_KEY, &registration),
            }
        }

        let guard = self.collections.leader_guard(STATS_KEY, registration);

        // Another leader may have stored fresh stats between our check and registration.
        let stats = match self.fresh() {
            Some(stats) => stats,
            None => {
                let stats = collect().await;
                self.store(stats.clone());
                stats
            }
        };

        guard.complete(stats.clone());
        stats
    }

    /// Drop the memoized statistics so the next poll collects again.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    fn fresh(&self) -> Option<CacheStats> {
        let cached = self.cached.lock();
        match cached.as_ref() {
            Some((at, stats)) if at.elapsed() < self.ttl => Some(stats.clone()),
            _ => None,
        }
    }

    fn store(&self, stats: CacheStats) {
        *self.cached.lock() = Some((Instant::now(), stats));
    }
}
