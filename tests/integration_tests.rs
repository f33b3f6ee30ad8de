//! Corpus Cache Integration Tests
//!
//! Exercises the public API end to end:
//! - Round-trip, key determinism and TTL expiry
//! - Integrity self-healing on tampered records
//! - Quota pressure (sweep first, then oldest-entry eviction)
//! - Per-key lock serialization
//! - Sibling caches over one directory with broadcast invalidation
//! - The 200,000-song corpus scenario

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_test::assert_ok;

use corpus_cache::cache::entry::{join_record, split_record};
use corpus_cache::cache::{BroadcastAction, CacheEntry, PayloadSchema};
use corpus_cache::config::RetryConfig;
use corpus_cache::{
    BroadcastHub, CacheConfig, CacheStore, CorpusCache, FileStore, FilterDescriptor,
    InMemoryStore, ManualClock,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Musica {
    id: u64,
    titulo: String,
    artista: String,
    letra: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Corpus {
    musicas: Vec<Musica>,
    total_musicas: usize,
}

fn corpus(n: usize) -> Corpus {
    let musicas: Vec<Musica> = (0..n as u64)
        .map(|i| Musica {
            id: i,
            titulo: format!("Milonga {}", i),
            artista: format!("Payador {}", i % 97),
            letra: "No pago de la querencia, o meu canto se levanta".to_string(),
        })
        .collect();
    Corpus {
        total_musicas: musicas.len(),
        musicas,
    }
}

fn test_config() -> CacheConfig {
    CacheConfig::default()
        .with_lock_timeout(Duration::from_millis(500))
        .with_retry(RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(5),
        })
}

fn fixed_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()))
}

// =============================================================================
// Round-trip & Keys
// =============================================================================

mod round_trip {
    use super::*;

    #[tokio::test]
    async fn test_typed_round_trip_with_filter() {
        let cache = CorpusCache::in_memory(test_config()).unwrap();
        let filter = FilterDescriptor::new()
            .with_list("artistas", ["Payador 1", "Payador 2"])
            .with_optional("regiao", None::<String>);
        let payload = corpus(40);

        cache.save("gaucho", &payload, Some(&filter)).await.unwrap();
        let loaded: Corpus = cache.load("gaucho", Some(&filter)).await.unwrap().unwrap();
        assert_eq!(loaded, payload);

        // Unfiltered request is a different entry
        assert!(cache.load::<Corpus>("gaucho", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_permuted_filter_hits_same_entry() {
        let cache = CorpusCache::in_memory(test_config()).unwrap();
        let saved_with = FilterDescriptor::new().with_list("artistas", ["b", "a", "c"]);
        let loaded_with = FilterDescriptor::new().with_list("artistas", ["c", "b", "a"]);

        cache.save("gaucho", &corpus(3), Some(&saved_with)).await.unwrap();
        let loaded: Option<Corpus> = cache.load("gaucho", Some(&loaded_with)).await.unwrap();
        assert_eq!(loaded.unwrap().total_musicas, 3);
    }

    #[tokio::test]
    async fn test_compression_is_transparent() {
        let config = test_config().with_compression_threshold(512);
        let cache = CorpusCache::in_memory(config).unwrap();
        let payload = corpus(1_000);

        cache.save("nordestino", &payload, None).await.unwrap();
        let loaded: Corpus = cache.load("nordestino", None).await.unwrap().unwrap();
        assert_eq!(loaded, payload);

        let key = cache.key_for("nordestino", None);
        let record = cache.store().get(&key).await.unwrap().unwrap();
        assert!(CacheEntry::decode(&record).unwrap().is_compressed);
        assert_eq!(cache.metrics().hits, 1);
    }
}

// =============================================================================
// TTL Expiry
// =============================================================================

mod expiry {
    use super::*;

    #[tokio::test]
    async fn test_expired_entry_is_miss_and_swept() {
        let clock = fixed_clock();
        let cache = CorpusCache::builder()
            .with_config(test_config())
            .with_clock(clock.clone())
            .build()
            .unwrap();

        cache.save("gaucho", &corpus(5), None).await.unwrap();
        assert!(cache.load::<Corpus>("gaucho", None).await.unwrap().is_some());

        clock.advance(chrono::Duration::days(7) + chrono::Duration::seconds(1));
        assert!(cache.load::<Corpus>("gaucho", None).await.unwrap().is_none());
        assert_eq!(cache.stats().await.unwrap().entry_count, 1);

        assert_eq!(cache.sweep_expired().await.unwrap(), 1);
        assert_eq!(cache.stats().await.unwrap().entry_count, 0);
        assert_eq!(cache.sweep_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_entries() {
        let clock = fixed_clock();
        let cache = CorpusCache::builder()
            .with_config(test_config())
            .with_clock(clock.clone())
            .build()
            .unwrap();
        let filter = FilterDescriptor::new().with_scalar("anoInicio", 1990);

        cache.save("gaucho", &corpus(2), None).await.unwrap();
        cache.save("gaucho", &corpus(2), Some(&filter)).await.unwrap();
        clock.advance(chrono::Duration::hours(25));

        assert_eq!(cache.sweep_expired().await.unwrap(), 1);
        assert!(cache.load::<Corpus>("gaucho", None).await.unwrap().is_some());
    }
}

// =============================================================================
// Integrity
// =============================================================================

mod integrity {
    use super::*;

    #[tokio::test]
    async fn test_tampered_file_record_self_heals() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path(), 64 * 1024 * 1024).await.unwrap());
        let cache = CorpusCache::builder()
            .with_config(test_config())
            .with_store(store.clone())
            .build()
            .unwrap();
        cache.save("gaucho", &corpus(10), None).await.unwrap();

        let key = cache.key_for("gaucho", None);
        let path = dir.path().join("gaucho").join(format!("{}.cce", key));
        let bytes = std::fs::read(&path).unwrap();
        let (mut header, payload) = split_record(&bytes).unwrap();
        header.as_object_mut().unwrap().remove("isCompressed");
        std::fs::write(&path, join_record(&header, payload).unwrap()).unwrap();

        assert!(cache.load::<Corpus>("gaucho", None).await.unwrap().is_none());
        assert_eq!(cache.stats().await.unwrap().entry_count, 0);
        assert!(!path.exists());
        assert_eq!(cache.metrics().integrity_failures, 1);
    }

    #[tokio::test]
    async fn test_count_mismatch_is_miss() {
        let cache = CorpusCache::in_memory(test_config()).unwrap();
        let mut payload = corpus(4);
        payload.total_musicas = 9;
        cache.save("gaucho", &payload, None).await.unwrap();

        assert!(cache.load::<Corpus>("gaucho", None).await.unwrap().is_none());
        assert_eq!(cache.stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_permissive_schema_accepts_any_json() {
        let cache = CorpusCache::builder()
            .with_config(test_config())
            .with_schema(PayloadSchema::permissive())
            .build()
            .unwrap();
        cache.save("notas", &json!(["a", "b"]), None).await.unwrap();
        let loaded: Value = cache.load("notas", None).await.unwrap().unwrap();
        assert_eq!(loaded, json!(["a", "b"]));
    }
}

// =============================================================================
// Quota Pressure
// =============================================================================

mod quota {
    use super::*;

    /// Encoded size of one `corpus(20)` record under a six-letter type
    async fn record_size() -> u64 {
        let cache = CorpusCache::builder()
            .with_config(test_config())
            .with_clock(fixed_clock())
            .build()
            .unwrap();
        cache.save("tipo_x", &corpus(20), None).await.unwrap();
        cache.stats().await.unwrap().total_size
    }

    async fn bounded_cache(clock: Arc<ManualClock>, quota: u64) -> (CorpusCache, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::with_quota(quota));
        let cache = CorpusCache::builder()
            .with_config(test_config())
            .with_clock(clock)
            .with_store(store.clone())
            .build()
            .unwrap();
        (cache, store)
    }

    #[tokio::test]
    async fn test_sweep_frees_enough() {
        let size = record_size().await;
        let clock = fixed_clock();
        let (cache, _store) = bounded_cache(clock.clone(), 4 * size).await;

        cache.save("tipo_a", &corpus(20), None).await.unwrap();
        clock.advance(chrono::Duration::days(8));
        cache.save("tipo_b", &corpus(20), None).await.unwrap();
        cache.save("tipo_c", &corpus(20), None).await.unwrap();

        // 3 of 4 slots used, 1.5 slots needed: sweeping tipo_a is enough
        assert_ok!(cache.save("tipo_d", &corpus(20), None).await);

        let stats = assert_ok!(cache.stats().await);
        assert_eq!(stats.entry_count, 3);
        assert!(cache.head("tipo_a", None).await.unwrap().is_none());
        assert!(cache.head("tipo_b", None).await.unwrap().is_some());
        assert_eq!(cache.metrics().evictions, 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_oldest_eviction() {
        let size = record_size().await;
        let clock = fixed_clock();
        let (cache, _store) = bounded_cache(clock.clone(), 4 * size).await;

        for t in ["tipo_a", "tipo_b", "tipo_c"] {
            cache.save(t, &corpus(20), None).await.unwrap();
            clock.advance(chrono::Duration::minutes(1));
        }

        cache.save("tipo_d", &corpus(20), None).await.unwrap();

        assert!(cache.head("tipo_a", None).await.unwrap().is_none());
        for t in ["tipo_b", "tipo_c", "tipo_d"] {
            assert!(cache.head(t, None).await.unwrap().is_some(), "{} missing", t);
        }
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[tokio::test]
    async fn test_same_size_rewrite_keeps_unrelated_entries() {
        let size = record_size().await;
        let clock = fixed_clock();
        let (cache, _store) = bounded_cache(clock.clone(), 4 * size).await;

        for t in ["tipo_a", "tipo_b", "tipo_c"] {
            cache.save(t, &corpus(20), None).await.unwrap();
            clock.advance(chrono::Duration::minutes(1));
        }

        // 1 slot free plus the slot tipo_c gives back covers 1.5 slots
        cache.save("tipo_c", &corpus(20), None).await.unwrap();

        for t in ["tipo_a", "tipo_b", "tipo_c"] {
            assert!(cache.head(t, None).await.unwrap().is_some(), "{} missing", t);
        }
        assert_eq!(cache.metrics().evictions, 0);
    }

    #[tokio::test]
    async fn test_store_rejection_reclaims_but_fails_write() {
        let size = record_size().await;
        let clock = fixed_clock();
        let (cache, store) = bounded_cache(clock.clone(), size + size / 2).await;

        cache.save("tipo_a", &corpus(20), None).await.unwrap();
        clock.advance(chrono::Duration::minutes(1));

        // A much larger payload cannot fit even after eviction
        let err = cache.save("tipo_b", &corpus(200), None).await.unwrap_err();
        assert!(err.is_quota_exceeded());
        assert!(store.is_empty());
        assert_eq!(cache.metrics().errors, 1);
    }
}

// =============================================================================
// Locking
// =============================================================================

mod locking {
    use super::*;

    #[tokio::test]
    async fn test_same_key_sections_never_overlap() {
        let cache = Arc::new(CorpusCache::in_memory(test_config()).unwrap());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let cache = cache.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .locks()
                    .with_lock("K", || async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_held_key_times_out_load() {
        let config = test_config().with_lock_timeout(Duration::from_millis(50));
        let cache = CorpusCache::in_memory(config).unwrap();
        cache.save("gaucho", &corpus(2), None).await.unwrap();

        let key = cache.key_for("gaucho", None);
        let _held = cache.locks().acquire(key.as_str()).await.unwrap();

        let err = cache.load::<Corpus>("gaucho", None).await.unwrap_err();
        assert_matches!(err, corpus_cache::Error::LockTimeout { .. });

        // Other keys are unaffected
        cache.save("nordestino", &corpus(2), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_saves_leave_one_whole_entry() {
        let cache = CorpusCache::in_memory(test_config()).unwrap();
        let payloads: Vec<Corpus> = (1..=8).map(corpus).collect();
        let saves = payloads.iter().map(|p| cache.save("gaucho", p, None));
        for result in join_all(saves).await {
            assert_ok!(result);
        }

        let loaded: Corpus = cache.load("gaucho", None).await.unwrap().unwrap();
        assert_eq!(loaded.total_musicas, loaded.musicas.len());
        assert_eq!(cache.stats().await.unwrap().entry_count, 1);
    }
}

// =============================================================================
// Sibling Processes
// =============================================================================

mod siblings {
    use super::*;
    use tokio::sync::mpsc;

    async fn sibling(dir: &std::path::Path, hub: &BroadcastHub) -> CorpusCache {
        let store = FileStore::open(dir, 64 * 1024 * 1024).await.unwrap();
        CorpusCache::builder()
            .with_config(test_config())
            .with_store(Arc::new(store))
            .with_hub(hub.clone())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_is_broadcast_to_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let hub = BroadcastHub::new();
        let a = sibling(dir.path(), &hub).await;
        let b = sibling(dir.path(), &hub).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = a
            .subscribe_to_remote_invalidation(move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();

        b.save("gaucho", &corpus(3), None).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.action, BroadcastAction::Saved);
        assert_eq!(msg.cache_key, a.key_for("gaucho", None).to_string());

        // The durable store is shared
        let loaded: Corpus = a.load("gaucho", None).await.unwrap().unwrap();
        assert_eq!(loaded.total_musicas, 3);
    }

    #[tokio::test]
    async fn test_sibling_rewrite_is_seen() {
        let dir = tempfile::tempdir().unwrap();
        let hub = BroadcastHub::new();
        let a = sibling(dir.path(), &hub).await;
        let b = sibling(dir.path(), &hub).await;

        a.save("gaucho", &corpus(3), None).await.unwrap();
        let first: Corpus = a.load("gaucho", None).await.unwrap().unwrap();
        assert_eq!(first.total_musicas, 3);

        b.save("gaucho", &corpus(5), None).await.unwrap();
        let second: Corpus = a.load("gaucho", None).await.unwrap().unwrap();
        assert_eq!(second.total_musicas, 5);
    }

    #[tokio::test]
    async fn test_rewrite_seen_without_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        // Separate hubs: no messages cross
        let a = sibling(dir.path(), &BroadcastHub::new()).await;
        let b = sibling(dir.path(), &BroadcastHub::new()).await;

        a.save("gaucho", &corpus(3), None).await.unwrap();
        let _: Corpus = a.load("gaucho", None).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        b.save("gaucho", &corpus(6), None).await.unwrap();
        let seen: Corpus = a.load("gaucho", None).await.unwrap().unwrap();
        assert_eq!(seen.total_musicas, 6);
    }

    async fn journaled_sibling(dir: &std::path::Path) -> CorpusCache {
        let store = FileStore::open(dir, 64 * 1024 * 1024).await.unwrap();
        let hub = BroadcastHub::journaled(store.journal_dir(), Duration::from_millis(10)).unwrap();
        CorpusCache::builder()
            .with_config(test_config())
            .with_store(Arc::new(store))
            .with_hub(hub)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_journaled_hubs_invalidate_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        // Separate stores and hubs, as in two processes
        let a = journaled_sibling(dir.path()).await;
        let b = journaled_sibling(dir.path()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = b
            .subscribe_to_remote_invalidation(move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();

        a.save("gaucho", &corpus(3), None).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.action, BroadcastAction::Saved);
        assert_eq!(msg.cache_key, b.key_for("gaucho", None).to_string());

        let first: Corpus = b.load("gaucho", None).await.unwrap().unwrap();
        assert_eq!(first.total_musicas, 3);
        let before = b.metrics().remote_invalidations;

        a.save("gaucho", &corpus(5), None).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while b.metrics().remote_invalidations <= before {
            assert!(tokio::time::Instant::now() < deadline, "no invalidation reached b");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let second: Corpus = b.load("gaucho", None).await.unwrap().unwrap();
        assert_eq!(second.total_musicas, 5);

        // The journal lives beside the entries without being one
        assert_eq!(b.stats().await.unwrap().entry_count, 1);
    }

    #[tokio::test]
    async fn test_entries_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let hub = BroadcastHub::new();
        {
            let cache = sibling(dir.path(), &hub).await;
            cache.save("gaucho", &corpus(7), None).await.unwrap();
            cache.shutdown().await;
        }

        let cache = sibling(dir.path(), &hub).await;
        let rebuilt = AtomicUsize::new(0);
        let loaded: Corpus = cache
            .load_or_rebuild("gaucho", None, || async {
                rebuilt.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(corpus(7))
            })
            .await
            .unwrap();
        assert_eq!(loaded.total_musicas, 7);
        assert_eq!(rebuilt.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clear_is_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let hub = BroadcastHub::new();
        let a = sibling(dir.path(), &hub).await;
        let b = sibling(dir.path(), &hub).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = a
            .subscribe_to_remote_invalidation(move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();

        b.invalidate(None, None).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.action, BroadcastAction::Cleared);
        assert_eq!(msg.cache_key, "*");
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_config_from_yaml() {
    let config = CacheConfig::from_yaml_str(
        r#"
full_ttl: 3d
filtered_ttl: 12h
compression_threshold_bytes: 2048
retry:
  max_retries: 5
"#,
    )
    .unwrap();
    assert_eq!(config.full_ttl, Duration::from_secs(3 * 24 * 3600));
    assert_eq!(config.filtered_ttl, Duration::from_secs(12 * 3600));
    assert_eq!(config.compression_threshold_bytes, 2048);
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.channel_name, "corpus-cache");
}

// =============================================================================
// End-to-end Scenario
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gaucho_corpus_end_to_end() {
    let cache = CorpusCache::in_memory(test_config()).unwrap();
    let payload = corpus(200_000);

    cache.save("gaucho", &payload, None).await.unwrap();

    let key = cache.key_for("gaucho", None);
    let record = cache.store().get(&key).await.unwrap().unwrap();
    let entry = CacheEntry::decode(&record).unwrap();
    assert!(entry.is_compressed);
    assert!(entry.metadata.compression_ratio < 1.0);
    assert!(entry.metadata.size_bytes < entry.metadata.original_size_bytes);

    let loaded: Corpus = cache.load("gaucho", None).await.unwrap().unwrap();
    assert_eq!(loaded.total_musicas, 200_000);
    assert_eq!(loaded.musicas.len(), 200_000);

    assert_eq!(cache.invalidate(Some("gaucho"), None).await.unwrap(), 1);
    assert!(cache.load::<Corpus>("gaucho", None).await.unwrap().is_none());

    cache.shutdown().await;
}
