//! Deterministic cache key derivation.
//!
//! Keys have the shape `{prefix}{route_id}:{sha256_hex}` where the digest covers
//! `query|graph_source|layers`. Absent inputs hash as the literal text `null`,
//! so an absent layer set and an empty one produce different keys.

use sha2::{Digest, Sha256};
use std::fmt;

const ABSENT: &str = "null";

/// Inputs for a single cached query result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    prefix: String,
    route_id: String,
    query: String,
    graph_source: Option<String>,
    layers: Option<String>,
}

impl CacheKey {
    pub fn new(
        prefix: impl Into<String>,
        route_id: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            route_id: route_id.into(),
            query: query.into(),
            graph_source: None,
            layers: None,
        }
    }

    /// Set the graph-source URI the query runs against.
    pub fn graph_source(mut self, uri: impl Into<String>) -> Self {
        self.graph_source = Some(uri.into());
        self
    }

    /// Set the caller-joined layer set (e.g. comma-separated layer URIs).
    pub fn layers(mut self, layers: impl Into<String>) -> Self {
        self.layers = Some(layers.into());
        self
    }

    /// Produce the full key string stored in the backing store.
    pub fn generate(&self) -> String {
        let combined = format!(
            "{}|{}|{}",
            self.query,
            self.graph_source.as_deref().unwrap_or(ABSENT),
            self.layers.as_deref().unwrap_or(ABSENT),
        );
        let digest = Sha256::digest(combined.as_bytes());
        format!("{}{}:{}", self.prefix, self.route_id, hex::encode(digest))
    }

    /// Wildcard matching every key ever derived for this key's route.
    pub fn route_pattern(&self) -> String {
        route_pattern(&self.prefix, &self.route_id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.generate())
    }
}

/// `{prefix}{route_id}:*`, used for bulk invalidation of a route.
pub fn route_pattern(prefix: &str, route_id: &str) -> String {
    format!("{prefix}{route_id}:*")
}
