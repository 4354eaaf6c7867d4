//! Caching layer for a graph-query backend: deterministic keys, compressed values,
//! a pooled fail-open store client and per-key request coalescing.

pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod logging;
pub mod store;
pub mod utils;
