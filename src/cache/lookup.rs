//! Read-through lookup: cache, then a coalesced backend call, then store.

use super::CacheFacade;
use crate::cache::coalesce::CoalescedResult;
use crate::cache::errors::LookupError;
use anyhow::anyhow;
use serde::Serialize;
use std::future::Future;
use tracing::{debug, warn};

const EMPTY_RESULT: &str = "Backend request failed or returned empty result";
const UNRESOLVED: &str = "Coalesced request did not resolve";
/// Leader episodes a follower waits on before giving up.
const MAX_FOLLOW_ROUNDS: u32 = 3;

/// Where a looked-up value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupSource {
    /// Read from the store.
    Cache,
    /// Shared from a concurrent leader's backend call.
    Coalesced,
    /// Computed by this caller.
    Backend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lookup {
    pub value: String,
    pub source: LookupSource,
}

impl Lookup {
    fn new(value: String, source: LookupSource) -> Self {
        Self { value, source }
    }
}

impl CacheFacade {
    /// Return the cached value for `key`, or compute it once across all concurrent
    /// callers and cache it for `ttl_secs` (default TTL when `None`).
    ///
    /// Empty results are handed back but never cached. A follower whose leader fails
    /// joins the next episode for the key; one whose leader stalls past the
    /// coalescing timeout takes it over. A leader dropped mid-flight fails its episode.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl_secs: Option<u32>,
        compute: F,
    ) -> Result<Lookup, LookupError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<String>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(Lookup::new(value, LookupSource::Cache));
        }

        let ttl = ttl_secs.unwrap_or_else(|| self.default_ttl_seconds());
        let coalescer = self.coalescer();

        if !coalescer.is_enabled() {
            let value = compute().await.map_err(LookupError::Backend)?;
            if !value.is_empty() {
                self.put(key, &value, ttl).await?;
            }
            return Ok(Lookup::new(value, LookupSource::Backend));
        }

        let mut registration = coalescer.register_request(key);
        let mut rounds = 0;
        while !registration.is_leader() {
            rounds += 1;
            match coalescer.await_default(&registration).await? {
                Some(CoalescedResult::Success(value)) => {
                    debug!(key, "served coalesced result");
                    return Ok(Lookup::new(value, LookupSource::Coalesced));
                }
                Some(CoalescedResult::Failure(msg)) if rounds >= MAX_FOLLOW_ROUNDS => {
                    return Err(LookupError::Backend(anyhow!(msg)));
                }
                Some(CoalescedResult::Failure(msg)) => {
                    debug!(key, error = %msg, "leader failed, joining next episode");
                    registration = coalescer.register_request(key);
                }
                None if rounds >= MAX_FOLLOW_ROUNDS => {
                    return Err(LookupError::Backend(anyhow!(UNRESOLVED)));
                }
                None => {
                    warn!(key, "leader still in flight after wait, taking over");
                    registration = coalescer.take_over(key, &registration);
                }
            }
        }

        let guard = coalescer.leader_guard(key, registration);

        // A previous episode may have stored the value while we waited on it.
        if rounds > 0 {
            match self.get(key).await {
                Ok(Some(value)) => {
                    guard.complete(value.clone());
                    return Ok(Lookup::new(value, LookupSource::Cache));
                }
                Ok(None) => {}
                Err(e) => {
                    guard.fail(e.to_string());
                    return Err(e.into());
                }
            }
        }

        let value = match compute().await {
            Ok(value) => value,
            Err(e) => {
                guard.fail(format!("Backend request failed: {e}"));
                return Err(LookupError::Backend(e));
            }
        };

        if value.is_empty() {
            guard.fail(EMPTY_RESULT);
            return Ok(Lookup::new(value, LookupSource::Backend));
        }

        if let Err(e) = self.put(key, &value, ttl).await {
            guard.fail(e.to_string());
            return Err(e.into());
        }

        guard.complete(value.clone());
        Ok(Lookup::new(value, LookupSource::Backend))
    }
}
