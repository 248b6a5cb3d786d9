//! In-memory LRU engine (component B): a concurrent, cost-bounded,
//! age-bounded LRU with deterministic eviction, a background trimming loop,
//! and controlled release of evicted values.
//!
//! Mirrors the shape of `cache::query_cache::QueryCache` (config struct +
//! `validate()`, LRU ordering, memory accounting, eviction loop)
//! generalized from SQL-result caching to an arbitrary value type, and
//! `memory::pressure::MemoryPressureManager`'s callback-registration idiom
//! for the low-memory / background hooks.

pub mod release;

use crate::error::Result;
use crate::lru::LruIndex;
use parking_lot::Mutex;
use release::{BackgroundRelease, ReleaseExecutor};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

thread_local! {
    /// Best-effort reentrancy guard. Set while a
    /// pressure callback registered with this tier is running on the
    /// current thread; public operations check it and bail out rather than
    /// deadlock or corrupt state if the callback calls back into the tier.
    static IN_PRESSURE_CALLBACK: Cell<bool> = Cell::new(false);
}

/// Configuration for a [`MemoryTier`]. All limits default to "unlimited".
#[derive(Clone)]
pub struct MemoryConfig {
    pub count_limit: Option<u64>,
    pub cost_limit: Option<u64>,
    pub age_limit: Option<Duration>,
    pub auto_trim_interval: Duration,
    pub clear_on_low_memory: bool,
    pub clear_on_background: bool,
    pub release_on_main_thread: bool,
    pub release_asynchronously: bool,
    /// Bound on the background release queue when
    /// `release_asynchronously` is true and no custom executor was
    /// supplied. An implementation detail of the default
    /// [`BackgroundRelease`] executor.
    pub release_queue_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            count_limit: None,
            cost_limit: None,
            age_limit: None,
            auto_trim_interval: Duration::from_secs_f64(5.0),
            clear_on_low_memory: true,
            clear_on_background: true,
            release_on_main_thread: false,
            release_asynchronously: true,
            release_queue_capacity: 1024,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.auto_trim_interval.is_zero() {
            tracing::debug!("auto_trim_interval is zero; background trimmer will be disabled");
        }
        Ok(())
    }
}

/// Point-in-time snapshot of hit/miss/eviction/insert counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub inserts: u64,
}

struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    inserts: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
        }
    }
}

type PressureCallback<V> = dyn Fn(&MemoryTier<V>) + Send + Sync;

/// A concurrent, cost/count/age-bounded LRU cache tier.
///
/// A single `parking_lot::Mutex` guards the index; value destructors never
/// run while it is held — evicted values are handed to a
/// [`ReleaseExecutor`] after the lock is dropped.
pub struct MemoryTier<V: Clone + Send + 'static> {
    index: Mutex<LruIndex<V>>,
    config: MemoryConfig,
    counters: Counters,
    release_executor: Arc<dyn ReleaseExecutor<V>>,
    on_low_memory: Mutex<Option<Box<PressureCallback<V>>>>,
    on_background: Mutex<Option<Box<PressureCallback<V>>>>,
}

impl<V: Clone + Send + 'static> MemoryTier<V> {
    /// Build a tier that releases evicted values on a dedicated background
    /// thread by default (per `release_asynchronously = true`).
    pub fn new(config: MemoryConfig) -> Self {
        config.validate().expect("invalid memory tier configuration");
        let executor = Arc::new(BackgroundRelease::new(config.release_queue_capacity));
        Self::with_executor(config, executor)
    }

    /// Build a tier with a caller-supplied release executor — required when
    /// `release_on_main_thread` is set, since `tandem-cache` has no notion
    /// of "the main thread" on its own.
    pub fn with_executor(config: MemoryConfig, release_executor: Arc<dyn ReleaseExecutor<V>>) -> Self {
        config.validate().expect("invalid memory tier configuration");
        Self {
            index: Mutex::new(LruIndex::new()),
            config,
            counters: Counters::new(),
            release_executor,
            on_low_memory: Mutex::new(None),
            on_background: Mutex::new(None),
        }
    }

    /// Start the background auto-trim task on the current tokio runtime.
    /// No-op (with a debug log) if called outside a runtime, or if
    /// `auto_trim_interval` is zero. Holds only a [`Weak`] reference to
    /// `self`, so the task exits on its own once every other `Arc` is
    /// dropped.
    pub fn start_background_trimmer(self: &Arc<Self>) {
        if self.config.auto_trim_interval.is_zero() {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::debug!("no tokio runtime available; memory tier background trimmer disabled");
                return;
            }
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.auto_trim_interval;
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(tier) => tier.run_auto_trim(),
                    None => break,
                }
            }
        });
    }

    fn run_auto_trim(&self) {
        if let Some(limit) = self.config.cost_limit {
            self.trim_to_cost(limit);
        }
        if let Some(limit) = self.config.count_limit {
            self.trim_to_count(limit);
        }
        if let Some(limit) = self.config.age_limit {
            self.trim_to_age(limit);
        }
    }

    fn reentrant(&self) -> bool {
        let reentrant = IN_PRESSURE_CALLBACK.with(|c| c.get());
        if reentrant {
            tracing::warn!("reentrant call into memory tier from a pressure callback thread; ignoring");
        }
        reentrant
    }

    pub fn contains(&self, key: &str) -> bool {
        if key.is_empty() || self.reentrant() {
            return false;
        }
        self.index.lock().contains_key(key)
    }

    /// Look up `key`, touching its access time and moving it to the front
    /// of the LRU on a hit.
    pub fn get(&self, key: &str) -> Option<V> {
        if key.is_empty() || self.reentrant() {
            return None;
        }
        let mut index = self.index.lock();
        let found = index.get_touch(key).cloned();
        drop(index);
        if found.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Insert or replace `key`. A `cost` of `None` defaults to `0`.
    ///
    /// After insertion, any entries beyond the configured limits are
    /// trimmed immediately, rather than waiting for the next background
    /// trimmer tick.
    pub fn set(&self, key: &str, value: V, cost: u64) {
        if key.is_empty() || self.reentrant() {
            return;
        }
        let mut index = self.index.lock();
        let replaced = index.insert_front(key.to_string(), value, cost);
        drop(index);
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        if let Some((_, old_value)) = replaced {
            self.release(old_value);
        }
        self.enforce_limits_after_insert();
    }

    /// `set(key, None)` is equivalent to `remove(key)`.
    pub fn set_or_remove(&self, key: &str, value: Option<V>, cost: u64) {
        match value {
            Some(v) => self.set(key, v, cost),
            None => self.remove(key),
        }
    }

    pub fn remove(&self, key: &str) {
        if key.is_empty() || self.reentrant() {
            return;
        }
        if let Some((_, value)) = self.index.lock().remove(key) {
            self.release(value);
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        if self.reentrant() {
            return;
        }
        self.clear_unchecked();
    }

    fn clear_unchecked(&self) {
        let drained = self.index.lock().clear();
        for value in drained {
            self.release(value);
        }
    }

    fn enforce_limits_after_insert(&self) {
        if let Some(limit) = self.config.cost_limit {
            self.trim_to_cost(limit);
        }
        if let Some(limit) = self.config.count_limit {
            self.trim_to_count(limit);
        }
    }

    pub fn trim_to_count(&self, n: u64) {
        loop {
            let victim = {
                let mut index = self.index.lock();
                if index.len() as u64 <= n {
                    break;
                }
                index.pop_tail()
            };
            match victim {
                Some((_, _, value)) => {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    self.release(value);
                }
                None => break,
            }
        }
    }

    pub fn trim_to_cost(&self, c: u64) {
        loop {
            let victim = {
                let mut index = self.index.lock();
                if index.total_cost() <= c {
                    break;
                }
                index.pop_tail()
            };
            match victim {
                Some((_, _, value)) => {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    self.release(value);
                }
                None => break,
            }
        }
    }

    /// Evict tail-first while `now - access_time > age_limit`. Because
    /// access time only increases toward the head, this can stop at the
    /// first node within budget.
    pub fn trim_to_age(&self, age_limit: Duration) {
        let now = Instant::now();
        loop {
            let victim = {
                let mut index = self.index.lock();
                match index.peek_tail_access_time() {
                    Some(t) if now.saturating_duration_since(t) > age_limit => index.pop_tail(),
                    _ => None,
                }
            };
            match victim {
                Some((_, _, value)) => {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    self.release(value);
                }
                None => break,
            }
        }
    }

    pub fn total_count(&self) -> u64 {
        self.index.lock().len() as u64
    }

    pub fn total_cost(&self) -> u64 {
        self.index.lock().total_cost()
    }

    pub fn stats(&self) -> MemoryStats {
        self.counters.snapshot()
    }

    pub fn set_on_low_memory<F>(&self, callback: F)
    where
        F: Fn(&MemoryTier<V>) + Send + Sync + 'static,
    {
        *self.on_low_memory.lock() = Some(Box::new(callback));
    }

    pub fn set_on_background<F>(&self, callback: F)
    where
        F: Fn(&MemoryTier<V>) + Send + Sync + 'static,
    {
        *self.on_background.lock() = Some(Box::new(callback));
    }

    /// Invoked by the embedding application when the host signals memory
    /// pressure.
    pub fn on_low_memory_signal(&self) {
        if !self.config.clear_on_low_memory {
            return;
        }
        self.clear_unchecked();
        self.invoke_pressure_callback(&self.on_low_memory);
    }

    /// Invoked by the embedding application when it is about to be
    /// backgrounded.
    pub fn on_background_signal(&self) {
        if !self.config.clear_on_background {
            return;
        }
        self.clear_unchecked();
        self.invoke_pressure_callback(&self.on_background);
    }

    fn invoke_pressure_callback(&self, slot: &Mutex<Option<Box<PressureCallback<V>>>>) {
        let callback = slot.lock();
        if let Some(callback) = callback.as_ref() {
            IN_PRESSURE_CALLBACK.with(|c| c.set(true));
            callback(self);
            IN_PRESSURE_CALLBACK.with(|c| c.set(false));
        }
    }

    fn release(&self, value: V) {
        if self.config.release_on_main_thread || self.config.release_asynchronously {
            self.release_executor.release(value);
        } else {
            drop(value);
        }
    }
}

impl<V: Clone + Send + 'static> std::fmt::Debug for MemoryTier<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("total_count", &self.total_count())
            .field("total_cost", &self.total_cost())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(cfg: MemoryConfig) -> MemoryTier<String> {
        MemoryTier::new(cfg)
    }

    #[test]
    fn basic_set_get_remove() {
        let t = tier(MemoryConfig::default());
        t.set("a", "1".into(), 1);
        assert_eq!(t.get("a"), Some("1".to_string()));
        assert!(t.contains("a"));
        t.remove("a");
        assert!(!t.contains("a"));
        assert_eq!(t.get("a"), None);
    }

    #[test]
    fn empty_key_is_rejected() {
        let t = tier(MemoryConfig::default());
        t.set("", "x".into(), 1);
        assert_eq!(t.total_count(), 0);
        assert!(!t.contains(""));
        assert_eq!(t.get(""), None);
    }

    #[test]
    fn total_count_and_cost_invariants() {
        let t = tier(MemoryConfig::default());
        t.set("a", "1".into(), 1);
        t.set("b", "2".into(), 2);
        t.set("c", "3".into(), 3);
        assert_eq!(t.total_count(), 3);
        assert_eq!(t.total_cost(), 6);
        t.remove("b");
        assert_eq!(t.total_count(), 2);
        assert_eq!(t.total_cost(), 4);
    }

    #[test]
    fn trim_to_count_evicts_oldest_first() {
        let t = tier(MemoryConfig::default());
        t.set("a", "1".into(), 1);
        t.set("b", "2".into(), 1);
        t.set("c", "3".into(), 1);
        t.trim_to_count(2);
        assert_eq!(t.total_count(), 2);
        assert!(t.contains("b"));
        assert!(t.contains("c"));
        assert!(!t.contains("a"));
    }

    #[test]
    fn trim_to_cost_evicts_tail_first() {
        let t = tier(MemoryConfig::default());
        t.set("a", "1".into(), 5);
        t.set("b", "2".into(), 5);
        t.set("c", "3".into(), 5);
        t.trim_to_cost(10);
        assert!(t.total_cost() <= 10);
        assert!(!t.contains("a"));
    }

    #[test]
    fn get_moves_entry_to_front() {
        let t = tier(MemoryConfig::default());
        t.set("a", "1".into(), 1);
        t.set("b", "2".into(), 1);
        t.set("c", "3".into(), 1);
        t.get("a"); // touch "a", making "b" the new tail
        t.trim_to_count(2);
        assert!(t.contains("a"));
        assert!(t.contains("c"));
        assert!(!t.contains("b"));
    }

    #[test]
    fn set_with_none_value_removes() {
        let t = tier(MemoryConfig::default());
        t.set("a", "1".into(), 1);
        t.set_or_remove("a", None, 0);
        assert!(!t.contains("a"));
    }

    #[test]
    fn low_memory_signal_clears_and_invokes_callback() {
        let t = tier(MemoryConfig::default());
        t.set("a", "1".into(), 1);
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = called.clone();
        t.set_on_low_memory(move |_tier| {
            flag.store(true, Ordering::SeqCst);
        });
        t.on_low_memory_signal();
        assert_eq!(t.total_count(), 0);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn low_memory_signal_respects_disabled_flag() {
        let mut cfg = MemoryConfig::default();
        cfg.clear_on_low_memory = false;
        let t = tier(cfg);
        t.set("a", "1".into(), 1);
        t.on_low_memory_signal();
        assert_eq!(t.total_count(), 1);
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let t = tier(MemoryConfig::default());
        t.set("a", "1".into(), 1);
        t.get("a");
        t.get("missing");
        let stats = t.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.inserts, 1);
    }
}
