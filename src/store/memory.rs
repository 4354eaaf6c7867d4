//! In-process store backend.
//!
//! Speaks the same command set as Redis (GET, SETEX, DEL, SCAN with glob MATCH,
//! PING, INFO stats) over a `DashMap`. Used for single-node deployments without
//! Redis and as the store behind the test suite. Connection acquisitions and
//! releases are counted, and command failures can be switched on to exercise
//! error policies.

use super::{StoreConnection, StoreError, StorePool};
use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: DashMap<String, MemoryEntry>,
    max_keys: Option<usize>,
    failing: AtomicBool,
    acquired: AtomicU64,
    released: AtomicU64,
    evictions: AtomicU64,
}

/// Clone-cheap handle; all clones share one keyspace.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the keyspace; inserting a new key at capacity evicts the entry
    /// closest to expiry.
    pub fn with_capacity(max_keys: usize) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                max_keys: Some(max_keys),
                ..MemoryInner::default()
            }),
        }
    }

    /// Make every command fail until switched back off.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    pub fn connections_acquired(&self) -> u64 {
        self.inner.acquired.load(Ordering::SeqCst)
    }

    pub fn connections_released(&self) -> u64 {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Live (unexpired) key count.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .iter()
            .filter(|e| e.value().is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw stored form of a key, bypassing the client's codec.
    pub fn raw(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.inner
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    /// Write a raw stored form directly, bypassing the client's codec.
    pub fn insert_raw(&self, key: &str, value: &str, ttl: Duration) {
        self.inner.insert(key, value, ttl);
    }
}

impl MemoryInner {
    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Command("memory store is failing".to_owned()))
        } else {
            Ok(())
        }
    }

    fn insert(&self, key: &str, value: &str, ttl: Duration) {
        if let Some(max) = self.max_keys
            && !self.entries.contains_key(key)
            && self.entries.len() >= max
        {
            self.evict_one();
        }
        self.entries.insert(
            key.to_owned(),
            MemoryEntry {
                value: value.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn evict_one(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.value().expires_at)
            .map(|e| e.key().clone());
        if let Some(key) = victim
            && self.entries.remove(&key).is_some()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Sorted snapshot of live keys matching `pattern`.
    fn matching_keys(&self, pattern: &Regex) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_live(now) && pattern.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StorePool for MemoryStore {
    async fn acquire(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        self.inner.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            store: self.inner.clone(),
            scan: None,
        }))
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

/// Scan state is connection-local: a SCAN with cursor 0 snapshots the matching
/// keys, later cursors page through that snapshot.
struct MemoryConnection {
    store: Arc<MemoryInner>,
    scan: Option<Vec<String>>,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.store.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.store.check()?;
        let now = Instant::now();
        let live = self
            .store
            .entries
            .get(key)
            .map(|e| (e.is_live(now), e.value.clone()));
        match live {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                self.store.entries.remove_if(key, |_, e| !e.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(
        &mut self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<String, StoreError> {
        self.store.check()?;
        if ttl_secs == 0 {
            return Err(StoreError::Command(
                "invalid expire time in 'setex' command".to_owned(),
            ));
        }
        self.store
            .insert(key, value, Duration::from_secs(ttl_secs));
        Ok("OK".to_owned())
    }

    async fn del(&mut self, key: &str) -> Result<u64, StoreError> {
        self.store.check()?;
        let now = Instant::now();
        Ok(match self.store.entries.remove(key) {
            Some((_, entry)) if entry.is_live(now) => 1,
            _ => 0,
        })
    }

    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        self.store.check()?;
        if cursor == 0 {
            let matcher = glob_to_regex(pattern)?;
            self.scan = Some(self.store.matching_keys(&matcher));
        }
        let Some(snapshot) = self.scan.as_ref() else {
            return Err(StoreError::Command(format!("invalid cursor {cursor}")));
        };

        let start = usize::try_from(cursor)
            .map_err(|_| StoreError::Command(format!("invalid cursor {cursor}")))?;
        let end = start.saturating_add(count.max(1)).min(snapshot.len());
        let batch = snapshot.get(start..end).unwrap_or_default().to_vec();
        let next = if end >= snapshot.len() { 0 } else { end as u64 };
        if next == 0 {
            self.scan = None;
        }
        Ok((next, batch))
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        self.store.check()
    }

    async fn info_stats(&mut self) -> Result<String, StoreError> {
        self.store.check()?;
        Ok(format!(
            "# Stats\r\nevicted_keys:{}\r\n",
            self.store.evictions.load(Ordering::Relaxed)
        ))
    }
}

/// Translate a Redis glob (`*`, `?`, `\` escapes) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, StoreError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    re.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| StoreError::Command(format!("invalid pattern: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3600;

    async fn conn(store: &MemoryStore) -> Box<dyn StoreConnection> {
        store.acquire().await.unwrap()
    }

    // -- glob matching --

    #[test]
    fn glob_star_and_question_mark() {
        let re = glob_to_regex("qtt:cache:r1:*").unwrap();
        assert!(re.is_match("qtt:cache:r1:abc"));
        assert!(re.is_match("qtt:cache:r1:"));
        assert!(!re.is_match("qtt:cache:r10:abc"));
        assert!(!re.is_match("xqtt:cache:r1:abc"));

        let re = glob_to_regex("k?y").unwrap();
        assert!(re.is_match("key"));
        assert!(!re.is_match("kly2"));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let re = glob_to_regex("a.b+c\\*").unwrap();
        assert!(re.is_match("a.b+c*"));
        assert!(!re.is_match("aXb+c*"));
        assert!(!re.is_match("a.b+cde"));
    }

    // -- commands --

    #[tokio::test]
    async fn set_get_del() {
        let store = MemoryStore::new();
        let mut c = conn(&store).await;
        assert_eq!(c.set_ex("k", "v", HOUR).await.unwrap(), "OK");
        assert_eq!(c.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(c.del("k").await.unwrap(), 1);
        assert_eq!(c.del("k").await.unwrap(), 0);
        assert_eq!(c.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let store = MemoryStore::new();
        store.insert_raw("k", "v", Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut c = conn(&store).await;
        assert_eq!(c.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn scan_pages_through_matches() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store.insert_raw(&format!("p:{i:02}"), "v", Duration::from_secs(HOUR));
        }
        store.insert_raw("other", "v", Duration::from_secs(HOUR));

        let mut c = conn(&store).await;
        let mut seen = Vec::new();
        let mut cursor = 0;
        let mut rounds = 0;
        loop {
            let (next, keys) = c.scan(cursor, "p:*", 10).await.unwrap();
            seen.extend(keys);
            rounds += 1;
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(rounds, 3);
        assert_eq!(seen.len(), 25);
    }

    #[tokio::test]
    async fn scan_survives_deletes_between_rounds() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert_raw(&format!("p:{i}"), "v", Duration::from_secs(HOUR));
        }
        let mut c = conn(&store).await;
        let mut deleted = 0;
        let mut cursor = 0;
        loop {
            let (next, keys) = c.scan(cursor, "p:*", 2).await.unwrap();
            for key in &keys {
                deleted += c.del(key).await.unwrap();
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(deleted, 5);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn capacity_evicts_and_reports() {
        let store = MemoryStore::with_capacity(2);
        let mut c = conn(&store).await;
        c.set_ex("a", "1", 10).await.unwrap();
        c.set_ex("b", "2", HOUR).await.unwrap();
        c.set_ex("c", "3", HOUR).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(c.get("a").await.unwrap(), None);
        let info = c.info_stats().await.unwrap();
        assert!(info.contains("evicted_keys:1"));
    }

    #[tokio::test]
    async fn failing_store_errors_and_still_releases() {
        let store = MemoryStore::new();
        store.set_failing(true);
        {
            let mut c = conn(&store).await;
            assert!(c.ping().await.is_err());
            assert!(c.get("k").await.is_err());
        }
        assert_eq!(store.connections_acquired(), 1);
        assert_eq!(store.connections_released(), 1);
    }
}
