//! Request coalescing: at most one in-flight backend computation per cache key.
//!
//! The first caller for a key becomes the **leader** and must resolve the key with
//! [`complete_request`](RequestCoalescer::complete_request),
//! [`fail_request`](RequestCoalescer::fail_request) or
//! [`cancel_request`](RequestCoalescer::cancel_request). Callers arriving while the
//! leader is working become **followers** and share the leader's [`PendingOutcome`].
//! Every follower of one leader episode observes the identical outcome.
//!
//! Leaders that may be superseded resolve through their own episode with
//! [`leader_guard`](RequestCoalescer::leader_guard), which also fails the episode if
//! the leader is dropped. A leader that never resolves leaves its followers waiting
//! until their own timeouts, after which one of them may
//! [`take_over`](RequestCoalescer::take_over) the key.
//! [`cleanup_stale_entries`](RequestCoalescer::cleanup_stale_entries) reclaims such
//! registrations once they pass the stale threshold.

use crate::cache::errors::CacheError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(120);

const SUPERSEDED: &str = "Request superseded by forced takeover after timeout";
const ABANDONED: &str = "Leader abandoned request before resolving it";

/// Outcome a leader broadcasts to its followers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoalescedResult<T> {
    Success(T),
    Failure(String),
}

impl<T> CoalescedResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, CoalescedResult::Success(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            CoalescedResult::Success(v) => Some(v),
            CoalescedResult::Failure(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            CoalescedResult::Success(v) => Some(v),
            CoalescedResult::Failure(_) => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            CoalescedResult::Success(_) => None,
            CoalescedResult::Failure(msg) => Some(msg),
        }
    }
}

/// Shared single-resolution slot for one leader episode.
///
/// The sender lives inside the handle, so dropping the registration from the map
/// (cancel) never wakes a waiter; only an explicit resolution does.
#[derive(Debug)]
pub struct PendingOutcome<T> {
    tx: watch::Sender<Option<CoalescedResult<T>>>,
    created_at: Instant,
}

impl<T: Clone + Send + Sync> PendingOutcome<T> {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            created_at: Instant::now(),
        }
    }

    /// Time since the leader registered.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    fn resolve(&self, outcome: CoalescedResult<T>) {
        self.tx.send_replace(Some(outcome));
    }

    /// Wait for the resolution. Never returns for a cancelled episode.
    async fn wait(&self) -> CoalescedResult<T> {
        let mut rx = self.tx.subscribe();
        let resolved = match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        match resolved {
            Some(outcome) => outcome,
            // Unreachable while `self` holds the sender; park like an unresolved episode.
            None => std::future::pending().await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// What a caller got back from [`RequestCoalescer::register_request`].
#[derive(Debug, Clone)]
pub struct Registration<T> {
    role: Role,
    handle: Arc<PendingOutcome<T>>,
}

impl<T> Registration<T> {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Whether this caller should go to the backend.
    pub fn should_proceed(&self) -> bool {
        self.is_leader()
    }

    pub fn handle(&self) -> &Arc<PendingOutcome<T>> {
        &self.handle
    }

    /// True when both registrations wait on the same leader episode.
    pub fn same_episode(&self, other: &Registration<T>) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

#[derive(Debug, Default)]
struct Counters {
    coalesced: AtomicU64,
    leaders: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
    forced_takeovers: AtomicU64,
    stale_cleaned: AtomicU64,
}

/// Point-in-time view of the coalescer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoalescingSnapshot {
    pub enabled: bool,
    pub coalesced: u64,
    pub leaders: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub forced_takeovers: u64,
    pub stale_cleaned: u64,
    pub in_flight: u64,
}

/// Leader-side handle returned by [`RequestCoalescer::leader_guard`].
///
/// Dropping it unresolved fails the episode so followers are released at once
/// instead of waiting out their timeouts.
pub struct LeaderGuard<'a, T: Clone + Send + Sync> {
    coalescer: &'a RequestCoalescer<T>,
    key: &'a str,
    registration: Registration<T>,
    armed: bool,
}

impl<T: Clone + Send + Sync> LeaderGuard<'_, T> {
    pub fn complete(mut self, value: T) {
        self.armed = false;
        self.coalescer
            .complete_episode(self.key, &self.registration, value);
    }

    pub fn fail(mut self, error_message: impl Into<String>) {
        self.armed = false;
        self.coalescer
            .fail_episode(self.key, &self.registration, error_message);
    }
}

impl<T: Clone + Send + Sync> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            warn!(key = self.key, "leader dropped before resolving request");
            self.coalescer
                .fail_episode(self.key, &self.registration, ABANDONED);
        }
    }
}

pub struct RequestCoalescer<T = String> {
    /// cache key → pending outcome of the current leader episode
    in_flight: DashMap<String, Arc<PendingOutcome<T>>>,
    enabled: bool,
    default_timeout: Duration,
    stale_threshold: Duration,
    counters: Counters,
}

impl<T: Clone + Send + Sync> RequestCoalescer<T> {
    pub fn new(enabled: bool, default_timeout: Duration) -> Self {
        Self::with_stale_threshold(enabled, default_timeout, DEFAULT_STALE_THRESHOLD)
    }

    pub fn with_stale_threshold(
        enabled: bool,
        default_timeout: Duration,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            in_flight: DashMap::new(),
            enabled,
            default_timeout,
            stale_threshold,
            counters: Counters::default(),
        }
    }

    /// A coalescer that never shares work: every caller is an uncounted leader.
    pub fn disabled() -> Self {
        Self::new(false, DEFAULT_TIMEOUT)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Claim leadership for `key`, or join the episode already in flight.
    pub fn register_request(&self, key: &str) -> Registration<T> {
        if !self.enabled {
            return Self::detached_leader();
        }

        match self.in_flight.entry(key.to_owned()) {
            Entry::Occupied(existing) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key, "coalescing request onto in-flight leader");
                Registration {
                    role: Role::Follower,
                    handle: existing.get().clone(),
                }
            }
            Entry::Vacant(slot) => {
                let handle = Arc::new(PendingOutcome::new());
                slot.insert(handle.clone());
                self.counters.leaders.fetch_add(1, Ordering::Relaxed);
                debug!(key, "registered as coalescing leader");
                Registration {
                    role: Role::Leader,
                    handle,
                }
            }
        }
    }

    /// Resolve the episode for `key` with a value; all followers wake with it.
    pub fn complete_request(&self, key: &str, value: T) {
        match self.in_flight.remove(key) {
            Some((_, handle)) => {
                handle.resolve(CoalescedResult::Success(value));
                debug!(key, "completed in-flight request");
            }
            None => warn!(key, "no in-flight request to complete"),
        }
    }

    /// Resolve the episode for `key` as failed; followers may retry on their own.
    pub fn fail_request(&self, key: &str, error_message: impl Into<String>) {
        if let Some((_, handle)) = self.in_flight.remove(key) {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            handle.resolve(CoalescedResult::Failure(error_message.into()));
            debug!(key, "failed in-flight request");
        }
    }

    /// Resolve `registration`'s episode with a value, if it still owns `key`.
    ///
    /// A leader that was superseded or swept as stale leaves the current episode
    /// untouched; its own followers were already released when it lost the key.
    pub fn complete_episode(&self, key: &str, registration: &Registration<T>, value: T) {
        match self.remove_episode(key, registration) {
            Some(handle) => {
                handle.resolve(CoalescedResult::Success(value));
                debug!(key, "completed in-flight request");
            }
            None => debug!(key, "episode no longer owns key, completion dropped"),
        }
    }

    /// Fail `registration`'s episode, if it still owns `key`. Counted once per episode.
    pub fn fail_episode(
        &self,
        key: &str,
        registration: &Registration<T>,
        error_message: impl Into<String>,
    ) {
        match self.remove_episode(key, registration) {
            Some(handle) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                handle.resolve(CoalescedResult::Failure(error_message.into()));
                debug!(key, "failed in-flight request");
            }
            None => debug!(key, "episode no longer owns key, failure dropped"),
        }
    }

    fn remove_episode(
        &self,
        key: &str,
        registration: &Registration<T>,
    ) -> Option<Arc<PendingOutcome<T>>> {
        self.in_flight
            .remove_if(key, |_, current| Arc::ptr_eq(current, &registration.handle))
            .map(|(_, handle)| handle)
    }

    /// Arm a guard that fails the leader's episode unless it is resolved through
    /// the guard. Covers early returns, panics and dropped futures.
    pub fn leader_guard<'a>(
        &'a self,
        key: &'a str,
        registration: Registration<T>,
    ) -> LeaderGuard<'a, T> {
        LeaderGuard {
            coalescer: self,
            key,
            registration,
            armed: true,
        }
    }

    /// Abandon the episode for `key` without resolving it.
    pub fn cancel_request(&self, key: &str) {
        if self.in_flight.remove(key).is_some() {
            debug!(key, "cancelled in-flight request");
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Take over `key` unconditionally, failing whatever episode held it.
    ///
    /// Used by a follower that timed out so it does not race a still-running leader
    /// without the map knowing about it.
    pub fn force_leadership(&self, key: &str) -> Registration<T> {
        if !self.enabled {
            return Self::detached_leader();
        }

        let handle = Arc::new(PendingOutcome::new());
        if let Some(previous) = self.in_flight.insert(key.to_owned(), handle.clone()) {
            previous.resolve(CoalescedResult::Failure(SUPERSEDED.to_owned()));
            self.counters.forced_takeovers.fetch_add(1, Ordering::Relaxed);
            debug!(key, "forced takeover of in-flight request");
        }
        self.counters.leaders.fetch_add(1, Ordering::Relaxed);
        Registration {
            role: Role::Leader,
            handle,
        }
    }

    /// Take over `key` only if it is still held by `stale`'s episode.
    ///
    /// Of several followers that timed out on the same stuck leader, exactly one
    /// supersedes it; the rest join the episode that replaced it.
    pub fn take_over(&self, key: &str, stale: &Registration<T>) -> Registration<T> {
        if !self.enabled {
            return Self::detached_leader();
        }

        match self.in_flight.entry(key.to_owned()) {
            Entry::Occupied(mut current) if Arc::ptr_eq(current.get(), &stale.handle) => {
                let handle = Arc::new(PendingOutcome::new());
                let previous = current.insert(handle.clone());
                previous.resolve(CoalescedResult::Failure(SUPERSEDED.to_owned()));
                self.counters.forced_takeovers.fetch_add(1, Ordering::Relaxed);
                self.counters.leaders.fetch_add(1, Ordering::Relaxed);
                warn!(key, "took over stuck in-flight request");
                Registration {
                    role: Role::Leader,
                    handle,
                }
            }
            Entry::Occupied(current) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key, "stuck request already replaced, following new leader");
                Registration {
                    role: Role::Follower,
                    handle: current.get().clone(),
                }
            }
            Entry::Vacant(slot) => {
                let handle = Arc::new(PendingOutcome::new());
                slot.insert(handle.clone());
                self.counters.leaders.fetch_add(1, Ordering::Relaxed);
                debug!(key, "registered as coalescing leader");
                Registration {
                    role: Role::Leader,
                    handle,
                }
            }
        }
    }

    /// Fail and remove registrations older than the stale threshold.
    pub fn cleanup_stale_entries(&self) -> usize {
        if !self.enabled {
            return 0;
        }

        let threshold = self.stale_threshold;
        let stale: Vec<String> = self
            .in_flight
            .iter()
            .filter(|entry| entry.value().age() > threshold)
            .map(|entry| entry.key().clone())
            .collect();

        let mut cleaned = 0;
        for key in stale {
            // Re-check under the shard lock: the key may have a fresh leader by now.
            if let Some((_, handle)) = self
                .in_flight
                .remove_if(&key, |_, handle| handle.age() > threshold)
            {
                warn!(
                    key = %key,
                    age_ms = handle.age().as_millis() as u64,
                    "cleaning up stale in-flight request"
                );
                handle.resolve(CoalescedResult::Failure(format!(
                    "Request cleaned up as stale after {}ms",
                    threshold.as_millis()
                )));
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            self.counters
                .stale_cleaned
                .fetch_add(cleaned as u64, Ordering::Relaxed);
            info!(cleaned, "cleaned up stale in-flight requests");
        }
        cleaned
    }

    /// Wait on the leader's outcome for up to `timeout`.
    ///
    /// Returns `Ok(None)` on timeout. Calling this with a leader registration is
    /// rejected immediately since the leader would wait on itself forever.
    pub async fn await_result(
        &self,
        registration: &Registration<T>,
        timeout: Duration,
    ) -> Result<Option<CoalescedResult<T>>, CacheError> {
        if registration.is_leader() {
            return Err(CacheError::LeaderAwait);
        }

        match tokio::time::timeout(timeout, registration.handle.wait()).await {
            Ok(outcome) => {
                if let CoalescedResult::Failure(msg) = &outcome {
                    warn!(error = %msg, "coalesced request failed");
                }
                Ok(Some(outcome))
            }
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for coalesced request"
                );
                Ok(None)
            }
        }
    }

    /// [`await_result`](Self::await_result) with the configured default timeout.
    pub async fn await_default(
        &self,
        registration: &Registration<T>,
    ) -> Result<Option<CoalescedResult<T>>, CacheError> {
        self.await_result(registration, self.default_timeout).await
    }

    pub fn snapshot(&self) -> CoalescingSnapshot {
        CoalescingSnapshot {
            enabled: self.enabled,
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            leaders: self.counters.leaders.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            forced_takeovers: self.counters.forced_takeovers.load(Ordering::Relaxed),
            stale_cleaned: self.counters.stale_cleaned.load(Ordering::Relaxed),
            in_flight: self.in_flight.len() as u64,
        }
    }

    pub fn reset_stats(&self) {
        for counter in [
            &self.counters.coalesced,
            &self.counters.leaders,
            &self.counters.timeouts,
            &self.counters.failures,
            &self.counters.forced_takeovers,
            &self.counters.stale_cleaned,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn detached_leader() -> Registration<T> {
        Registration {
            role: Role::Leader,
            handle: Arc::new(PendingOutcome::new()),
        }
    }
}
