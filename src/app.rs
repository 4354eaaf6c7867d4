use crate::cache::CacheFacade;
use crate::cli::{Command, KeyArgs};
use crate::config::Config;
use crate::utils::fmt_duration;
use anyhow::Context;
use serde::Serialize;
use serde_json::{Value, json};
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info};

/// Operator application: one configured cache, one command per run.
pub struct App {
    config: Config,
    cache: CacheFacade,
}

impl App {
    /// Connect the cache described by `config` and start its stale sweep.
    pub async fn with_config(config: Config) -> Result<Self, anyhow::Error> {
        let start = Instant::now();
        let cache = CacheFacade::connect(&config)
            .await
            .context("Failed to initialize cache")?;
        cache.spawn_stale_cleanup(config.cache_coalescing_cleanup_interval);

        info!(
            available = cache.is_available(),
            duration = fmt_duration(start.elapsed()),
            "cache ready"
        );

        Ok(Self { config, cache })
    }

    pub fn cache(&self) -> &CacheFacade {
        &self.cache
    }

    /// Run one command and print its JSON result to stdout.
    pub async fn run(self, command: Command) -> ExitCode {
        match self.execute(command).await {
            Ok(output) => match serde_json::to_string_pretty(&output) {
                Ok(text) => {
                    println!("{text}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "failed to render output");
                    ExitCode::FAILURE
                }
            },
            Err(e) => {
                error!(error = format!("{e:#}"), "command failed");
                ExitCode::FAILURE
            }
        }
    }

    pub async fn execute(&self, command: Command) -> Result<Value, anyhow::Error> {
        let cache = &self.cache;
        let output = match command {
            Command::Info => to_json(cache.info())?,
            Command::Stats => {
                let stats = cache.stats().await;
                json!({
                    "stats": stats,
                    "hitRatio": stats.hit_ratio(),
                    "coalescingRatio": stats.coalescing_ratio(),
                })
            }
            Command::Ping => {
                let start = Instant::now();
                let ok = cache.ping().await;
                json!({ "ok": ok, "duration": fmt_duration(start.elapsed()) })
            }
            Command::Key(KeyArgs {
                route,
                query,
                graph,
                layers,
            }) => {
                let key = cache.key_for(&route, &query, graph.as_deref(), layers.as_deref());
                json!({
                    "key": key,
                    "routePattern": crate::cache::route_pattern(cache.key_prefix(), &route),
                })
            }
            Command::Get { key } => {
                let value = cache.get(&key).await.context("Cache read failed")?;
                json!({ "key": key, "found": value.is_some(), "value": value })
            }
            Command::Put { key, value, ttl } => {
                let ttl = ttl.unwrap_or(self.config.cache_default_ttl_seconds);
                let stored = cache
                    .put(&key, &value, ttl)
                    .await
                    .context("Cache write failed")?;
                json!({ "key": key, "stored": stored, "ttlSeconds": ttl })
            }
            Command::Delete { key } => {
                let deleted = cache.delete(&key).await;
                json!({ "key": key, "deleted": deleted })
            }
            Command::Invalidate { route } => {
                let deleted = cache.invalidate_route(&route).await;
                json!({ "route": route, "deleted": deleted })
            }
            Command::Count { pattern } => {
                let count = cache.count_pattern(&pattern).await;
                json!({ "pattern": pattern, "count": count })
            }
            Command::Clear => {
                let deleted = cache.clear_all().await;
                json!({ "deleted": deleted })
            }
        };
        Ok(output)
    }
}

fn to_json(value: impl Serialize) -> Result<Value, anyhow::Error> {
    serde_json::to_value(value).context("Failed to serialize output")
}
