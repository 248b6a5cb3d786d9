//! End-to-end scenarios from the spec's testable-properties section,
//! exercised against the public `tandem_cache::Cache` facade.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tandem_cache::facade::{Cache, CacheConfig};
use tandem_cache::memory::MemoryConfig;

fn encode(v: &String) -> Vec<u8> {
    v.as_bytes().to_vec()
}

fn decode(bytes: &[u8]) -> tandem_cache::Result<String> {
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn open(dir: &tempfile::TempDir, config: CacheConfig) -> Arc<Cache<String>> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Cache::open(dir.path(), config, encode, decode).expect("cache should open")
}

/// Scenario 1: trim_to_count on the memory tier leaves the most-recently
/// touched entries.
#[test]
fn scenario_trim_to_count_keeps_most_recent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(&dir, CacheConfig::default());

    cache.set("a", "1".to_string()).unwrap();
    cache.set("b", "2".to_string()).unwrap();
    cache.set("c", "3".to_string()).unwrap();

    // MemoryTier::trim_to_count isn't exposed through the facade directly,
    // but the facade's memory tier is reachable for whitebox assertions in
    // the same way the teacher's own tests reach into `storage::tiered`
    // internals.
    cache.memory().trim_to_count(2);

    assert_eq!(cache.memory().total_count(), 2);
    assert!(cache.memory().contains("b"));
    assert!(cache.memory().contains("c"));
    assert!(!cache.memory().contains("a"));
}

/// Scenario 2 & 3: small values round-trip inline, large values round-trip
/// through an external file, across a close/reopen cycle.
#[test]
fn scenario_inline_and_external_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let small = "x".repeat(100);
    let large = "y".repeat(64 * 1024);

    {
        let cache = open(&dir, CacheConfig::default());
        cache.set("small", small.clone()).unwrap();
        cache.set("large", large.clone()).unwrap();
        cache.flush().unwrap();
    }

    let cache = open(&dir, CacheConfig::default());
    assert_eq!(cache.get("small").unwrap(), Some(small));
    assert_eq!(cache.get("large").unwrap(), Some(large));
}

/// Scenario 4: remove deletes a key from both tiers.
#[test]
fn scenario_remove_deletes_from_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(&dir, CacheConfig::default());

    cache.set("x", "v".to_string()).unwrap();
    assert!(cache.contains("x").unwrap());

    cache.remove("x").unwrap();
    assert!(!cache.contains("x").unwrap());
    assert!(!cache.memory().contains("x"));
}

/// Scenario 5: a low-memory signal clears the memory tier but the disk
/// tier still answers, repopulating memory on the next read.
#[test]
fn scenario_low_memory_signal_falls_back_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(&dir, CacheConfig::default());

    cache.set("k", "v1".to_string()).unwrap();
    cache.memory().on_low_memory_signal();
    assert!(!cache.memory().contains("k"));

    assert_eq!(cache.get("k").unwrap(), Some("v1".to_string()));
    assert!(cache.memory().contains("k"));
}

/// Scenario 6: concurrent disjoint-key readers/writers converge without
/// deadlock within a bounded wall-clock budget.
#[test]
fn scenario_concurrent_disjoint_keys_no_deadlock() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CacheConfig::default();
    config.memory = MemoryConfig::default();
    let cache = open(&dir, config);

    let threads = 8;
    let ops_per_thread = 200;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..ops_per_thread {
                    let key = format!("t{t}-k{i}");
                    cache.set(&key, format!("v{i}")).unwrap();
                    assert_eq!(cache.get(&key).unwrap(), Some(format!("v{i}")));
                    if i % 7 == 0 {
                        cache.remove(&key).unwrap();
                    }
                }
            })
        })
        .collect();

    let deadline = thread::spawn(move || {
        for h in handles {
            h.join().expect("worker thread should not panic");
        }
    });

    // A stand-in for "joins within a bounded wall-clock budget": spawn the
    // joiner on its own thread and poll with a timeout instead of blocking
    // the test thread indefinitely if something regresses into a deadlock.
    let start = std::time::Instant::now();
    loop {
        if deadline.is_finished() {
            deadline.join().unwrap();
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(10), "workers did not finish within budget");
        thread::sleep(Duration::from_millis(20));
    }
}

/// Write-through: after `set`, both tiers independently report the key as
/// present.
#[test]
fn write_through_populates_both_tiers_independently() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(&dir, CacheConfig::default());
    cache.set("a", "1".to_string()).unwrap();

    assert!(cache.memory().contains("a"));
    // The disk tier is reached through the facade's contains(), which
    // short-circuits on memory; force a disk-only check by clearing memory
    // first.
    cache.memory().clear();
    assert!(cache.contains("a").unwrap());
}

/// `set(key, None)` is equivalent to `remove(key)` at the facade too.
#[test]
fn set_or_remove_with_none_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(&dir, CacheConfig::default());
    cache.set("a", "1".to_string()).unwrap();
    cache.set_or_remove("a", None).unwrap();
    assert!(!cache.contains("a").unwrap());
}
