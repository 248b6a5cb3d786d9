//! Disk tier (component E): composes the SQL index and file store behind a
//! single contract, enforcing count/cost/age/free-space limits and running
//! a background auto-trim timer plus an async dispatch queue.
//!
//! Follows `storage::tiered::TieredStorageManager`'s composition style: one
//! lock (here, the SQL index's own transactional guarantees) decides row
//! state, file I/O happens outside of it, and a background task performs
//! periodic reclassification/eviction on a timer.

use super::file_store::FileStore;
use super::sql_index::{EntryMeta, SqlIndex};
use crate::error::{CacheError, Result};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Configuration for a [`DiskTier`]. Mirrors [`crate::memory::MemoryConfig`]
/// in shape, with disk-specific additions for space and file routing.
#[derive(Clone)]
pub struct DiskConfig {
    pub count_limit: Option<u64>,
    pub cost_limit: Option<u64>,
    pub age_limit: Option<Duration>,
    pub free_disk_space_limit: u64,
    pub auto_trim_interval: Duration,
    pub inline_threshold: u64,
    pub coalesce_access_updates: bool,
    pub flush_on_drop: bool,
    pub trim_batch_size: u32,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            count_limit: None,
            cost_limit: None,
            age_limit: None,
            free_disk_space_limit: 0,
            auto_trim_interval: Duration::from_secs(60),
            inline_threshold: 20 * 1024,
            coalesce_access_updates: true,
            flush_on_drop: true,
            trim_batch_size: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStats {
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

    fn snapshot(&self) -> DiskStats {
        DiskStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
        }
    }
}

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A fetched disk-tier value: the blob bytes plus caller-opaque
/// `extended_data`.
#[derive(Debug, Clone)]
pub struct DiskValue {
    pub data: Vec<u8>,
    pub extended_data: Vec<u8>,
}

/// The hybrid relational-index / external-file disk tier.
pub struct DiskTier {
    root: PathBuf,
    index: SqlIndex,
    files: FileStore,
    config: DiskConfig,
    counters: Counters,
    dispatch_tx: mpsc::UnboundedSender<BoxedJob>,
    /// Captured at `open()` time so `Drop` can schedule a best-effort
    /// shutdown checkpoint without needing the dropping thread to already
    /// be inside this runtime.
    runtime: tokio::runtime::Handle,
}

impl DiskTier {
    /// Open (creating if necessary) the disk tier rooted at `root`.
    ///
    /// Startup sequence:
    /// 1. open/create the index, running schema migration if needed,
    /// 2. reconcile file store and index (drop orphan files, drop rows
    ///    whose file is missing),
    /// 3. empty `trash/` asynchronously (handled inside [`FileStore::open`]).
    pub async fn open(root: impl AsRef<Path>, config: DiskConfig) -> Result<Arc<Self>> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        let index = SqlIndex::open(&root.join("manifest.db"), config.coalesce_access_updates).await?;
        let files = FileStore::open(&root).await?;

        let known: HashSet<String> = index.all_filenames().await?.into_iter().collect();
        let rows_missing_files = files.reconcile_with_index(&known).await?;
        for filename in rows_missing_files {
            tracing::warn!(filename = %filename, "index row references a missing file; purging row");
            delete_rows_with_filename(&index, &filename).await?;
        }

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        spawn_dispatch_worker(dispatch_rx);

        let tier = Arc::new(Self {
            root,
            index,
            files,
            config,
            counters: Counters::new(),
            dispatch_tx,
            runtime: tokio::runtime::Handle::current(),
        });

        tier.start_background_trimmer();
        Ok(tier)
    }

    fn start_background_trimmer(self: &Arc<Self>) {
        if self.config.auto_trim_interval.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.config.auto_trim_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tier) = weak.upgrade() else { break };
                if let Err(e) = tier.run_auto_trim().await {
                    tracing::warn!(error = %e, "disk tier background trim failed");
                }
            }
        });
    }

    async fn run_auto_trim(&self) -> Result<()> {
        if let Some(limit) = self.config.cost_limit {
            self.trim_to_cost(limit).await?;
        }
        if let Some(limit) = self.config.count_limit {
            self.trim_to_count(limit).await?;
        }
        if let Some(limit) = self.config.age_limit {
            self.trim_to_age(limit).await?;
        }
        if self.config.free_disk_space_limit > 0 {
            self.enforce_free_space_floor().await?;
        }
        Ok(())
    }

    async fn enforce_free_space_floor(&self) -> Result<()> {
        let Some(free) = free_space_bytes(&self.root) else {
            return Ok(());
        };
        if free >= self.config.free_disk_space_limit {
            return Ok(());
        }
        tracing::warn!(
            free_bytes = free,
            floor = self.config.free_disk_space_limit,
            "free disk space below configured floor; evicting"
        );
        loop {
            let batch = self
                .index
                .select_lru_batch(self.config.trim_batch_size as i64)
                .await?;
            if batch.is_empty() {
                break;
            }
            for row in batch {
                self.evict_row(row).await?;
            }
            if free_space_bytes(&self.root).map(|f| f >= self.config.free_disk_space_limit).unwrap_or(true) {
                break;
            }
        }
        Ok(())
    }

    /// Submit a unit of work to the disk tier's single background
    /// dispatch queue — the mechanism behind every `*_async` method.
    pub fn dispatch<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let boxed: BoxedJob = Box::pin(job);
        let _ = self.dispatch_tx.send(boxed);
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        Ok(self.index.get(key).await?.is_some())
    }

    pub async fn get(&self, key: &str) -> Result<Option<DiskValue>> {
        if key.is_empty() {
            return Ok(None);
        }
        let Some(meta) = self.index.get(key).await? else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let data = match &meta.filename {
            None => meta.inline_data.clone().unwrap_or_default(),
            Some(filename) => match self.files.read(filename).await? {
                Some(bytes) => bytes,
                None => {
                    tracing::warn!(key, filename, "external blob missing; purging row");
                    self.index.delete(key).await?;
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
            },
        };

        self.index.touch_access_time(key).await?;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(DiskValue {
            data,
            extended_data: meta.extended_data,
        }))
    }

    /// Write-through set. Routes inline vs. external by
    /// `config.inline_threshold`. On failure, any newly created file is
    /// trashed and no row is left dangling.
    pub async fn set(&self, key: &str, data: &[u8], extended_data: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }

        let previous = self.index.get(key).await?;
        let inline = data.len() as u64 <= self.config.inline_threshold;

        let new_filename = if inline {
            None
        } else {
            Some(
                self.files
                    .write(key, data)
                    .await
                    .map_err(|e| CacheError::WriteFailed(e.to_string()))?,
            )
        };

        let upsert = self
            .index
            .upsert(
                key,
                new_filename.as_deref(),
                data.len() as u64,
                inline.then_some(data),
                extended_data,
            )
            .await;

        match upsert {
            Ok(()) => {
                self.counters.inserts.fetch_add(1, Ordering::Relaxed);
                if let Some(previous) = previous {
                    if let Some(old_filename) = previous.filename {
                        if new_filename.as_deref() != Some(old_filename.as_str()) {
                            let _ = self.files.move_to_trash(&old_filename).await;
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                if let Some(filename) = &new_filename {
                    let _ = self.files.move_to_trash(filename).await;
                }
                Err(CacheError::WriteFailed(e.to_string()))
            }
        }
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        if let Some(meta) = self.index.delete(key).await? {
            if let Some(filename) = meta.filename {
                let _ = self.files.move_to_trash(&filename).await;
            }
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let rows = self.index.clear().await?;
        for row in rows {
            if let Some(filename) = row.filename {
                let _ = self.files.move_to_trash(&filename).await;
            }
        }
        Ok(())
    }

    async fn evict_row(&self, row: EntryMeta) -> Result<()> {
        self.index.delete(&row.key).await?;
        if let Some(filename) = row.filename {
            let _ = self.files.move_to_trash(&filename).await;
        }
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn trim_to_count(&self, n: u64) -> Result<()> {
        loop {
            let count = self.index.total_count().await?;
            if count <= n {
                break;
            }
            let need = (count - n).min(self.config.trim_batch_size as u64);
            let batch = self.index.select_lru_batch(need as i64).await?;
            if batch.is_empty() {
                break;
            }
            for row in batch {
                self.evict_row(row).await?;
            }
        }
        Ok(())
    }

    pub async fn trim_to_cost(&self, c: u64) -> Result<()> {
        loop {
            let cost = self.index.total_cost().await?;
            if cost <= c {
                break;
            }
            let batch = self
                .index
                .select_lru_batch(self.config.trim_batch_size as i64)
                .await?;
            if batch.is_empty() {
                break;
            }
            for row in batch {
                self.evict_row(row).await?;
                if self.index.total_cost().await? <= c {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Deletes all rows with `last_access_time < now - age_limit` — every
    /// matching row at once, not batch-by-batch.
    pub async fn trim_to_age(&self, age_limit: Duration) -> Result<()> {
        let rows = self.index.select_older_than(age_limit.as_secs() as i64).await?;
        for row in rows {
            self.evict_row(row).await?;
        }
        Ok(())
    }

    pub async fn total_count(&self) -> Result<u64> {
        self.index.total_count().await
    }

    pub async fn total_cost(&self) -> Result<u64> {
        self.index.total_cost().await
    }

    pub fn stats(&self) -> DiskStats {
        self.counters.snapshot()
    }

    /// Issue an explicit WAL checkpoint.
    pub async fn flush(&self) -> Result<()> {
        self.index.checkpoint().await
    }
}

impl Drop for DiskTier {
    /// Best-effort shutdown checkpoint (spec.md §4.C: "a short-lived
    /// checkpoint is issued on explicit `flush` and on shutdown"). Spawned
    /// detached on `self.runtime` rather than awaited here — `Drop` has no
    /// async context to block on, and the runtime itself may be mid-teardown
    /// by the time this task is scheduled, so this is advisory, not a
    /// durability guarantee.
    fn drop(&mut self) {
        if !self.config.flush_on_drop {
            return;
        }
        let pool = self.index.pool_handle();
        self.runtime.spawn(async move {
            if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(PASSIVE)").execute(&pool).await {
                tracing::debug!(error = %e, "checkpoint on drop failed");
            }
        });
    }
}

async fn delete_rows_with_filename(index: &SqlIndex, filename: &str) -> Result<()> {
    // The index has no secondary lookup by filename (it's 1:1 with the
    // hashed key by construction), so recover the key by re-deriving it is
    // not possible in general; instead sweep once at startup via a direct
    // scan, which is cheap since it only runs during reconciliation.
    let rows = index.select_lru_batch(i64::MAX).await?;
    for row in rows {
        if row.filename.as_deref() == Some(filename) {
            index.delete(&row.key).await?;
        }
    }
    Ok(())
}

fn spawn_dispatch_worker(mut rx: mpsc::UnboundedReceiver<BoxedJob>) {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            job.await;
        }
    });
}

#[cfg(unix)]
fn free_space_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    unsafe {
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        if libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) != 0 {
            return None;
        }
        let stat = stat.assume_init();
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

#[cfg(not(unix))]
fn free_space_bytes(_path: &Path) -> Option<u64> {
    None
}
