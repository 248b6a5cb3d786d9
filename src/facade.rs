//! Two-tier facade (component F): a single `Cache<V>` presenting
//! read-through/write-through access over a [`MemoryTier`] backed by a
//! [`DiskTier`], in both synchronous and async-callback flavors.
//!
//! Grounded on `storage::tiered::TieredStorageManager`'s hot/cold
//! composition and `cache::query_cache::QueryCache`'s encode/decode seam at
//! the persistence boundary.

use crate::disk::{DiskConfig, DiskTier};
use crate::error::{CacheError, Result};
use crate::memory::{MemoryConfig, MemoryTier};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Configuration for a [`Cache`]. Combines the memory and disk tier
/// configs with facade-level knobs.
#[derive(Clone)]
pub struct CacheConfig {
    pub memory: MemoryConfig,
    pub disk: DiskConfig,
    /// Take an advisory exclusive lock on the cache directory at open
    /// time, so two processes never operate on the same disk tier at
    /// once. Construction is the only point that fails hard on this.
    pub lock_directory: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            disk: DiskConfig::default(),
            lock_directory: true,
        }
    }
}

type Encode<V> = dyn Fn(&V) -> Vec<u8> + Send + Sync;
type Decode<V> = dyn Fn(&[u8]) -> Result<V> + Send + Sync;

/// A two-tier cache: an in-memory LRU in front of a disk-backed relational
/// index and file store. Reads check memory first and promote disk hits
/// back into memory; writes go to disk before memory, so a crash between
/// the two leaves disk (the durable tier) correct.
///
/// The disk tier and its background tasks (auto-trimmer, dispatch queue)
/// are driven by a small Tokio runtime owned outright by the `Cache`,
/// rather than borrowed from whatever runtime the caller happens to be on.
/// That keeps the synchronous API (`get`, `set`, ...) callable from any
/// thread — including one already driving an unrelated async runtime —
/// without the reentrant-`block_on` panic that borrowing the caller's
/// `Handle` would risk. Calling a synchronous method (`get`, `set`, ...)
/// from inside an `*_async` completion callback is documented undefined
/// behavior for the same reason pressure-callback reentrancy is: it would
/// block the very dispatch worker the callback is running on.
pub struct Cache<V: Clone + Send + Sync + 'static> {
    memory: Arc<MemoryTier<V>>,
    disk: Arc<DiskTier>,
    encode: Arc<Encode<V>>,
    decode: Arc<Decode<V>>,
    runtime: tokio::runtime::Runtime,
    _lock: Option<DirectoryLock>,
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    /// Open (or create) a two-tier cache rooted at `path`. Callable from
    /// any thread, synchronous or async — construction spins up its own
    /// small Tokio runtime to drive the disk tier.
    pub fn open<E, D>(path: impl AsRef<Path>, config: CacheConfig, encode: E, decode: D) -> Result<Arc<Self>>
    where
        E: Fn(&V) -> Vec<u8> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<V> + Send + Sync + 'static,
    {
        let path = path.as_ref().to_path_buf();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tandem-cache-io")
            .enable_time()
            .build()
            .map_err(|e| CacheError::Configuration(e.to_string()))?;

        let lock = if config.lock_directory {
            Some(DirectoryLock::acquire(&path.join(".lock"))?)
        } else {
            None
        };

        let (memory, disk) = runtime.block_on(async {
            tokio::fs::create_dir_all(&path).await?;
            let memory = Arc::new(MemoryTier::new(config.memory.clone()));
            memory.start_background_trimmer();
            let disk = DiskTier::open(&path, config.disk.clone()).await?;
            Result::Ok((memory, disk))
        })?;

        Ok(Arc::new(Self {
            memory,
            disk,
            encode: Arc::new(encode),
            decode: Arc::new(decode),
            runtime,
            _lock: lock,
        }))
    }

    /// Open a cache by application name, under the platform's conventional
    /// cache directory (`$XDG_CACHE_HOME`, `~/Library/Caches`, etc, via
    /// the `dirs` crate).
    pub fn open_named<E, D>(name: &str, config: CacheConfig, encode: E, decode: D) -> Result<Arc<Self>>
    where
        E: Fn(&V) -> Vec<u8> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<V> + Send + Sync + 'static,
    {
        let base = dirs::cache_dir()
            .ok_or_else(|| CacheError::Configuration("no platform cache directory available".into()))?;
        Self::open(base.join(name), config, encode, decode)
    }

    /// Read-through get: checks memory first, then disk, promoting a disk
    /// hit back into memory before returning.
    pub fn get(&self, key: &str) -> Result<Option<V>> {
        if let Some(value) = self.memory.get(key) {
            return Ok(Some(value));
        }
        let Some(disk_value) = self.runtime.block_on(self.disk.get(key))? else {
            return Ok(None);
        };
        let value = (self.decode)(&disk_value.data)?;
        self.memory.set(key, value.clone(), disk_value.data.len() as u64);
        Ok(Some(value))
    }

    /// Write-through set. The disk write happens first; memory is only
    /// updated once it succeeds, so a write failure never leaves memory
    /// ahead of the durable tier. This is the reverse of spec.md §4.F's
    /// literal "writes to memory then to disk" ordering — kept deliberately
    /// (see DESIGN.md) since the observable write-through invariant (both
    /// tiers contain the key once `set` returns `Ok`) holds either way, and
    /// disk-first never leaves memory ahead of the durable tier on failure.
    pub fn set(&self, key: &str, value: V) -> Result<()> {
        let bytes = (self.encode)(&value);
        let cost = bytes.len() as u64;
        self.runtime.block_on(self.disk.set(key, &bytes, &[]))?;
        self.memory.set(key, value, cost);
        Ok(())
    }

    /// `set(key, None)` deletes the key from both tiers.
    pub fn set_or_remove(&self, key: &str, value: Option<V>) -> Result<()> {
        match value {
            Some(v) => self.set(key, v),
            None => self.remove(key),
        }
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.memory.remove(key);
        self.runtime.block_on(self.disk.remove(key))
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        if self.memory.contains(key) {
            return Ok(true);
        }
        self.runtime.block_on(self.disk.contains(key))
    }

    pub fn clear(&self) -> Result<()> {
        self.memory.clear();
        self.runtime.block_on(self.disk.clear())
    }

    /// Async-callback get: never blocks the calling thread on disk I/O.
    /// `callback` always runs on the disk tier's background dispatch
    /// worker, even on a memory hit — never inline on the caller's thread —
    /// so callers can rely on "callback fires off-thread" uniformly instead
    /// of it depending on whether the key happened to be in memory.
    pub fn get_async<F>(self: &Arc<Self>, key: &str, callback: F)
    where
        F: FnOnce(Result<Option<V>>) + Send + 'static,
    {
        if let Some(value) = self.memory.get(key) {
            self.disk.dispatch(async move {
                callback(Ok(Some(value)));
            });
            return;
        }
        let this = Arc::clone(self);
        let key = key.to_string();
        self.disk.dispatch(async move {
            let result = this.get_disk_only_async(&key).await;
            callback(result);
        });
    }

    async fn get_disk_only_async(&self, key: &str) -> Result<Option<V>> {
        let Some(disk_value) = self.disk.get(key).await? else {
            return Ok(None);
        };
        let value = (self.decode)(&disk_value.data)?;
        self.memory.set(key, value.clone(), disk_value.data.len() as u64);
        Ok(Some(value))
    }

    /// Async-callback write-through set.
    pub fn set_async<F>(self: &Arc<Self>, key: &str, value: V, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let bytes = (self.encode)(&value);
        let cost = bytes.len() as u64;
        let this = Arc::clone(self);
        let key = key.to_string();
        this.disk.dispatch({
            let this = Arc::clone(&this);
            async move {
                let result = this.disk.set(&key, &bytes, &[]).await;
                if result.is_ok() {
                    this.memory.set(&key, value, cost);
                }
                callback(result);
            }
        });
    }

    /// Async-callback remove: deletes from both tiers, callback fires on
    /// the disk tier's background dispatch worker.
    pub fn remove_async<F>(self: &Arc<Self>, key: &str, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let this = Arc::clone(self);
        let key = key.to_string();
        self.disk.dispatch(async move {
            this.memory.remove(&key);
            let result = this.disk.remove(&key).await;
            callback(result);
        });
    }

    /// Async-callback contains: memory-hit or disk-hit, callback fires on
    /// the disk tier's background dispatch worker either way.
    pub fn contains_async<F>(self: &Arc<Self>, key: &str, callback: F)
    where
        F: FnOnce(Result<bool>) + Send + 'static,
    {
        if self.memory.contains(key) {
            self.disk.dispatch(async move {
                callback(Ok(true));
            });
            return;
        }
        let this = Arc::clone(self);
        let key = key.to_string();
        self.disk.dispatch(async move {
            let result = this.disk.contains(&key).await;
            callback(result);
        });
    }

    /// Async-callback clear: clears both tiers, callback fires on the disk
    /// tier's background dispatch worker.
    pub fn clear_async<F>(self: &Arc<Self>, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let this = Arc::clone(self);
        self.disk.dispatch(async move {
            this.memory.clear();
            let result = this.disk.clear().await;
            callback(result);
        });
    }

    pub fn stats(&self) -> (crate::memory::MemoryStats, crate::disk::DiskStats) {
        (self.memory.stats(), self.disk.stats())
    }

    /// Direct access to the memory tier, for callers that need tier-local
    /// operations (e.g. `trim_to_count`, pressure signals) the two-tier
    /// contract doesn't expose at the facade level.
    pub fn memory(&self) -> &MemoryTier<V> {
        &self.memory
    }

    /// Direct access to the disk tier.
    pub fn disk(&self) -> &DiskTier {
        &self.disk
    }

    pub fn flush(&self) -> Result<()> {
        self.runtime.block_on(self.disk.flush())
    }
}

#[cfg(unix)]
struct DirectoryLock {
    fd: std::os::unix::io::RawFd,
    path: PathBuf,
}

#[cfg(unix)]
impl DirectoryLock {
    fn acquire(path: &Path) -> Result<Self> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path =
            CString::new(path.as_os_str().as_bytes()).map_err(|e| CacheError::Configuration(e.to_string()))?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o644) };
        if fd < 0 {
            return Err(CacheError::BackendUnavailable(std::io::Error::last_os_error().to_string()));
        }
        let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            unsafe { libc::close(fd) };
            return Err(CacheError::BackendUnavailable(format!(
                "{} is locked by another process",
                path.display()
            )));
        }
        Ok(Self { fd, path: path.to_path_buf() })
    }
}

#[cfg(unix)]
impl Drop for DirectoryLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.fd, libc::LOCK_UN);
            libc::close(self.fd);
        }
        let _ = &self.path;
    }
}

#[cfg(not(unix))]
struct DirectoryLock;

#[cfg(not(unix))]
impl DirectoryLock {
    fn acquire(_path: &Path) -> Result<Self> {
        Ok(Self)
    }
}
