//! Error types for the cache facade and the cached lookup flow.

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache {operation} failed and fail-open is disabled")]
    FailClosed {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("cache initialization failed and fail-open is disabled")]
    Init(#[source] StoreError),
    #[error("a coalescing leader cannot await its own request")]
    LeaderAwait,
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("backend request failed: {0:#}")]
    Backend(anyhow::Error),
}
