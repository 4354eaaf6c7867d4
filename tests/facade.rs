use anyhow::anyhow;
use qtt_cache::cache::{CacheError, CacheFacade, CacheKey, LookupError, LookupSource};
use qtt_cache::config::Config;
use qtt_cache::store::memory::MemoryStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn config() -> Config {
    Config {
        redis_enabled: true,
        cache_stats_ttl: Duration::from_secs(60),
        ..Config::default()
    }
}

async fn facade_with(config: Config) -> (CacheFacade, MemoryStore) {
    let store = MemoryStore::new();
    let cache = CacheFacade::with_pool(&config, Arc::new(store.clone()))
        .await
        .unwrap();
    (cache, store)
}

// -- keys --

#[test]
fn example_key_and_pattern() {
    let key = CacheKey::new("qtt:cache:", "r1", "SELECT * WHERE {?s ?p ?o}")
        .graph_source("http://g")
        .layers("L1,L2");
    let generated = key.generate();

    let digest = generated.strip_prefix("qtt:cache:r1:").unwrap();
    assert_eq!(digest.len(), 64);
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(key.route_pattern(), "qtt:cache:r1:*");
}

// -- basic operations --

#[tokio::test]
async fn put_get_delete_with_compression() {
    let (cache, store) = facade_with(config()).await;
    let payload = "{\"head\":{\"vars\":[\"s\"]},\"results\":{\"bindings\":[]}}";

    assert!(cache.put("qtt:cache:r1:a", payload, 60).await.unwrap());
    assert_ne!(store.raw("qtt:cache:r1:a").unwrap(), payload);
    assert_eq!(
        cache.get("qtt:cache:r1:a").await.unwrap().as_deref(),
        Some(payload)
    );

    assert!(cache.delete("qtt:cache:r1:a").await);
    assert!(!cache.delete("qtt:cache:r1:a").await);
    assert_eq!(cache.get("qtt:cache:r1:a").await.unwrap(), None);
}

#[tokio::test]
async fn uncompressed_values_are_stored_verbatim() {
    let (cache, store) = facade_with(Config {
        cache_compression_enabled: false,
        ..config()
    })
    .await;

    cache.put_default("qtt:cache:r1:a", "plain").await.unwrap();
    assert_eq!(store.raw("qtt:cache:r1:a").as_deref(), Some("plain"));
}

#[tokio::test]
async fn pattern_delete_and_count() {
    let (cache, _store) = facade_with(config()).await;
    for i in 0..250 {
        cache
            .put(&format!("qtt:cache:r1:{i}"), "v", 60)
            .await
            .unwrap();
    }
    cache.put("qtt:cache:r2:x", "v", 60).await.unwrap();

    assert_eq!(cache.count_pattern("qtt:cache:r1:*").await, 250);
    assert_eq!(cache.invalidate_route("r1").await, 250);
    assert_eq!(cache.count_pattern("qtt:cache:*").await, 1);
    assert_eq!(cache.clear_all().await, 1);
    assert_eq!(cache.count_pattern("qtt:cache:*").await, 0);
}

#[tokio::test]
async fn every_operation_releases_its_connection() {
    let (cache, store) = facade_with(config()).await;
    cache.put("qtt:cache:r1:a", "v", 60).await.unwrap();
    cache.get("qtt:cache:r1:a").await.unwrap();
    cache.count_pattern("qtt:cache:*").await;

    store.set_failing(true);
    cache.get("qtt:cache:r1:a").await.unwrap();
    cache.delete("qtt:cache:r1:a").await;
    cache.delete_pattern("qtt:cache:*").await;

    assert!(store.connections_acquired() > 0);
    assert_eq!(store.connections_acquired(), store.connections_released());
}

// -- availability gating --

#[tokio::test]
async fn disabled_store_never_acquires_connections() {
    let (cache, store) = facade_with(Config {
        redis_enabled: false,
        ..config()
    })
    .await;

    assert!(!cache.is_available());
    assert_eq!(cache.get("k").await.unwrap(), None);
    assert!(!cache.put("k", "v", 60).await.unwrap());
    assert!(!cache.delete("k").await);
    assert_eq!(cache.delete_pattern("*").await, 0);
    assert_eq!(cache.count_pattern("*").await, 0);
    assert_eq!(cache.clear_all().await, 0);
    assert_eq!(cache.stats().await.key_count, 0);
    assert_eq!(store.connections_acquired(), 0);
}

// -- failure policy --

#[tokio::test]
async fn fail_open_contains_errors_and_counts_each_call() {
    let (cache, store) = facade_with(config()).await;
    store.set_failing(true);

    for i in 1..=3u64 {
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.counters().errors(), 2 * i - 1);
        assert!(!cache.put("k", "v", 60).await.unwrap());
        assert_eq!(cache.counters().errors(), 2 * i);
    }
    assert!(cache.info().error_message.is_some());
}

#[tokio::test]
async fn fail_closed_propagates_get_and_put_errors() {
    let (cache, store) = facade_with(Config {
        cache_fail_open: false,
        ..config()
    })
    .await;
    store.set_failing(true);

    assert!(matches!(
        cache.get("k").await,
        Err(CacheError::FailClosed {
            operation: "get",
            ..
        })
    ));
    assert!(matches!(
        cache.put("k", "v", 60).await,
        Err(CacheError::FailClosed {
            operation: "put",
            ..
        })
    ));
    // Deletes and scans degrade regardless of the policy.
    assert!(!cache.delete("k").await);
    assert_eq!(cache.count_pattern("*").await, 0);
}

#[tokio::test]
async fn fail_closed_startup_probe_is_an_error() {
    let store = MemoryStore::new();
    store.set_failing(true);
    let config = Config {
        cache_fail_open: false,
        ..config()
    };
    let result = CacheFacade::with_pool(&config, Arc::new(store)).await;
    assert!(matches!(result, Err(CacheError::Init(_))));
}

#[tokio::test]
async fn failed_probe_under_fail_open_leaves_cache_unavailable() {
    let store = MemoryStore::new();
    store.set_failing(true);
    let cache = CacheFacade::with_pool(&config(), Arc::new(store.clone()))
        .await
        .unwrap();

    assert!(!cache.is_available());
    assert!(cache.info().error_message.is_some());
    let acquired = store.connections_acquired();
    assert_eq!(cache.get("k").await.unwrap(), None);
    assert_eq!(store.connections_acquired(), acquired);
}

#[tokio::test]
async fn codec_mismatch_is_a_counted_miss() {
    let (cache, store) = facade_with(config()).await;
    store.insert_raw("qtt:cache:r1:a", "not base64 gzip!", Duration::from_secs(60));

    assert_eq!(cache.get("qtt:cache:r1:a").await.unwrap(), None);
    assert_eq!(cache.counters().errors(), 1);
}

#[tokio::test]
async fn last_error_survives_later_success() {
    let (cache, store) = facade_with(config()).await;
    store.set_failing(true);
    cache.get("k").await.unwrap();
    store.set_failing(false);
    cache.put("k", "v", 60).await.unwrap();

    assert!(cache.info().error_message.is_some());
}

// -- stats --

#[tokio::test]
async fn stats_track_hits_misses_and_keys() {
    let (cache, _store) = facade_with(config()).await;
    cache.put("qtt:cache:r1:a", "v", 60).await.unwrap();
    cache.get("qtt:cache:r1:a").await.unwrap();
    cache.get("qtt:cache:r1:b").await.unwrap();

    let stats = cache.stats().await;
    assert_eq!((stats.hits, stats.misses, stats.key_count), (1, 1, 1));
    assert_eq!(stats.hit_ratio(), 0.5);
    assert!(stats.coalescing_enabled);
}

#[tokio::test]
async fn stats_are_memoized_within_ttl() {
    let (cache, _store) = facade_with(config()).await;
    let first = cache.stats().await;
    cache.put("qtt:cache:r1:a", "v", 60).await.unwrap();

    let second = cache.stats().await;
    assert_eq!(second.key_count, first.key_count);
    assert_eq!(second.collected_at, first.collected_at);

    cache.reset_stats();
    assert_eq!(cache.stats().await.key_count, 1);
}

#[tokio::test]
async fn stats_enabled_off_skips_hit_counting() {
    let (cache, _store) = facade_with(Config {
        cache_stats_enabled: false,
        ..config()
    })
    .await;
    cache.get("k").await.unwrap();
    let stats = cache.stats().await;
    assert_eq!(stats.hits + stats.misses, 0);
}

// -- cached lookup --

#[tokio::test]
async fn lookup_computes_then_serves_from_cache() {
    let (cache, _store) = facade_with(config()).await;
    let calls = AtomicU64::new(0);
    let compute = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok("{\"n\":1}".to_owned())
    };

    let first = cache.get_or_compute("qtt:cache:r1:a", None, compute).await.unwrap();
    assert_eq!(first.source, LookupSource::Backend);

    let second = cache
        .get_or_compute("qtt:cache:r1:a", None, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("unused".to_owned())
        })
        .await
        .unwrap();
    assert_eq!(second.source, LookupSource::Cache);
    assert_eq!(second.value, "{\"n\":1}");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!cache.coalescer().is_in_flight("qtt:cache:r1:a"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_lookups_share_one_backend_call() {
    let (cache, _store) = facade_with(config()).await;
    let calls = Arc::new(AtomicU64::new(0));

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("qtt:cache:r1:hot", Some(60), move || async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok("{\"hot\":true}".to_owned())
                    })
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut backend = 0;
    for task in tasks {
        let lookup = task.await.unwrap();
        assert_eq!(lookup.value, "{\"hot\":true}");
        if lookup.source == LookupSource::Backend {
            backend += 1;
        }
    }
    assert_eq!(backend, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn backend_error_fails_episode_and_caches_nothing() {
    let (cache, store) = facade_with(config()).await;
    let result = cache
        .get_or_compute("qtt:cache:r1:a", None, || async {
            Err(anyhow!("connection refused"))
        })
        .await;

    assert!(matches!(result, Err(LookupError::Backend(_))));
    assert!(store.is_empty());
    assert!(!cache.coalescer().is_in_flight("qtt:cache:r1:a"));
    assert_eq!(cache.coalescer().snapshot().failures, 1);
}

#[tokio::test]
async fn empty_result_is_returned_but_not_cached() {
    let (cache, store) = facade_with(config()).await;
    let lookup = cache
        .get_or_compute("qtt:cache:r1:a", None, || async { Ok(String::new()) })
        .await
        .unwrap();

    assert_eq!(lookup.value, "");
    assert_eq!(lookup.source, LookupSource::Backend);
    assert!(store.is_empty());
}

#[tokio::test]
async fn lookup_without_coalescing_still_caches() {
    let (cache, _store) = facade_with(Config {
        cache_coalescing_enabled: false,
        ..config()
    })
    .await;

    let lookup = cache
        .get_or_compute("qtt:cache:r1:a", Some(30), || async { Ok("v".to_owned()) })
        .await
        .unwrap();
    assert_eq!(lookup.source, LookupSource::Backend);
    assert_eq!(cache.get("qtt:cache:r1:a").await.unwrap().as_deref(), Some("v"));
    assert_eq!(cache.coalescer().snapshot().leaders, 0);
}

#[tokio::test]
async fn disabled_facade_passes_lookups_through() {
    let cache = CacheFacade::disabled();
    let lookup = cache
        .get_or_compute("k", None, || async { Ok("v".to_owned()) })
        .await
        .unwrap();
    assert_eq!(lookup.source, LookupSource::Backend);
    assert_eq!(cache.get("k").await.unwrap(), None);
}

// -- follower recovery --

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn failed_leader_is_retried_by_one_follower() {
    let (cache, _store) = facade_with(config()).await;
    let key = "qtt:cache:r1:flaky";
    let calls = Arc::new(AtomicU64::new(0));

    let leader = {
        let cache = cache.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute(key, Some(60), move || async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow!("connection reset"))
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let followers: Vec<_> = (0..19)
        .map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(key, Some(60), move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok("{\"retry\":true}".to_owned())
                    })
                    .await
                    .unwrap()
            })
        })
        .collect();

    assert!(matches!(leader.await.unwrap(), Err(LookupError::Backend(_))));

    let mut backend = 0;
    for follower in followers {
        let lookup = follower.await.unwrap();
        assert_eq!(lookup.value, "{\"retry\":true}");
        if lookup.source == LookupSource::Backend {
            backend += 1;
        }
    }
    assert_eq!(backend, 1);
    assert!(calls.load(Ordering::SeqCst) <= 2);

    let snap = cache.coalescer().snapshot();
    assert_eq!(snap.failures, 1);
    assert_eq!(snap.forced_takeovers, 0);
    assert!(!cache.coalescer().is_in_flight(key));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stuck_leader_is_taken_over_once() {
    let (cache, _store) = facade_with(Config {
        cache_coalescing_timeout: Duration::from_millis(100),
        ..config()
    })
    .await;
    let key = "qtt:cache:r1:stuck";
    let calls = Arc::new(AtomicU64::new(0));

    let stuck = cache.coalescer().register_request(key);
    assert!(stuck.is_leader());

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(key, Some(60), move || async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok("{\"fresh\":true}".to_owned())
                    })
                    .await
                    .unwrap()
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().value, "{\"fresh\":true}");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let snap = cache.coalescer().snapshot();
    assert_eq!(snap.forced_takeovers, 1);
    assert_eq!(snap.timeouts, 5);
    assert!(stuck.handle().is_resolved());
    assert!(!cache.coalescer().is_in_flight(key));
}

#[tokio::test]
async fn aborted_leader_releases_its_key() {
    let (cache, store) = facade_with(config()).await;
    let key = "qtt:cache:r1:aborted";

    let leader = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute(key, None, || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok("never".to_owned())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(cache.coalescer().is_in_flight(key));

    leader.abort();
    assert!(leader.await.unwrap_err().is_cancelled());

    assert!(!cache.coalescer().is_in_flight(key));
    assert_eq!(cache.coalescer().snapshot().failures, 1);
    assert!(store.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_of_aborted_leader_computes_without_waiting_out_timeout() {
    let (cache, _store) = facade_with(config()).await;
    let key = "qtt:cache:r1:aborted";

    let leader = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute(key, None, || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok("never".to_owned())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let follower = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute(key, None, || async { Ok("v".to_owned()) })
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    leader.abort();

    let lookup = tokio::time::timeout(Duration::from_secs(1), follower)
        .await
        .expect("follower should be released by the aborted leader")
        .unwrap();
    assert_eq!(lookup.value, "v");
    assert_eq!(lookup.source, LookupSource::Backend);
    assert!(!cache.coalescer().is_in_flight(key));
    assert_eq!(cache.coalescer().snapshot().timeouts, 0);
}

// -- stale cleanup --

#[tokio::test]
async fn stale_cleanup_task_reclaims_abandoned_registrations() {
    let (cache, _store) = facade_with(Config {
        cache_coalescing_stale_threshold: Duration::from_millis(30),
        ..config()
    })
    .await;

    let abandoned = cache.coalescer().register_request("qtt:cache:r1:a");
    assert!(abandoned.is_leader());

    let handle = cache
        .spawn_stale_cleanup(Duration::from_millis(20))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(!cache.coalescer().is_in_flight("qtt:cache:r1:a"));
    assert!(abandoned.handle().is_resolved());
    assert_eq!(cache.coalescer().snapshot().stale_cleaned, 1);
    handle.abort();
}
