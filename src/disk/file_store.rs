//! Disk file store (component D): external-file storage for large blobs,
//! named by a strong hash of the key, with crash-safe two-phase deletion
//! through a `trash/` staging directory and startup orphan recovery.
//!
//! Follows `cache::query_cache::CacheKey::from_sql`'s "hash the lookup key
//! into a stable string" idiom (there SHA-256 of normalized SQL; here
//! SHA-256 of the cache key) and `storage::disk`'s direct `std::fs`/`File`
//! usage style, adapted to `tokio::fs` since the disk tier is async end to
//! end.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct FileStore {
    data_dir: PathBuf,
    trash_dir: PathBuf,
    trash_tx: mpsc::UnboundedSender<PathBuf>,
    trash_seq: AtomicU64,
}

impl FileStore {
    pub async fn open(root: &Path) -> Result<Self> {
        let data_dir = root.join("data");
        let trash_dir = root.join("trash");
        tokio::fs::create_dir_all(&data_dir).await?;
        tokio::fs::create_dir_all(&trash_dir).await?;

        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
        spawn_trash_collector(rx);

        let store = Self {
            data_dir,
            trash_dir,
            trash_tx: tx,
            trash_seq: AtomicU64::new(0),
        };

        store.empty_trash_async().await?;
        Ok(store)
    }

    pub fn filename_for_key(key: &str) -> String {
        hash_key(key)
    }

    fn data_path(&self, filename: &str) -> PathBuf {
        self.data_dir.join(filename)
    }

    pub async fn write(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let filename = Self::filename_for_key(key);
        let path = self.data_path(&filename);
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(filename = %filename, bytes = bytes.len(), "wrote external blob");
        Ok(filename)
    }

    /// Read a previously written blob. Returns `Ok(None)` if the file is
    /// missing, which the disk tier treats as a cache miss and uses as the
    /// trigger to delete the now-dangling index row.
    pub async fn read(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.data_path(filename)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a blob file into `trash/` (a fast, atomic rename) and schedule
    /// its actual unlink on the background collector, so callers never
    /// block on the unlink itself.
    pub async fn move_to_trash(&self, filename: &str) -> Result<()> {
        let source = self.data_path(filename);
        let seq = self.trash_seq.fetch_add(1, Ordering::Relaxed);
        let dest = self.trash_dir.join(format!("{filename}.{seq}"));

        match tokio::fs::rename(&source, &dest).await {
            Ok(()) => {
                let _ = self.trash_tx.send(dest);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Already gone (e.g. prior corruption cleanup) — nothing to do.
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Unlink everything currently in `trash/`. Called once at startup in
    /// case the process crashed mid-collection last time.
    async fn empty_trash_async(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.trash_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let _ = self.trash_tx.send(entry.path());
        }
        Ok(())
    }

    /// Delete any file in `data/` with no corresponding index row, and
    /// return the set of known filenames missing their file, for the
    /// caller to purge from the index.
    pub async fn reconcile_with_index(&self, known_filenames: &HashSet<String>) -> Result<Vec<String>> {
        let mut on_disk = HashSet::new();
        let mut entries = tokio::fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                on_disk.insert(name.to_string());
            }
        }

        for orphan in on_disk.difference(known_filenames) {
            tracing::debug!(filename = %orphan, "removing orphaned blob file");
            let _ = tokio::fs::remove_file(self.data_path(orphan)).await;
        }

        Ok(known_filenames.difference(&on_disk).cloned().collect())
    }
}

fn spawn_trash_collector(mut rx: mpsc::UnboundedReceiver<PathBuf>) {
    tokio::spawn(async move {
        while let Some(path) = rx.recv().await {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %e, path = ?path, "failed to unlink trashed file");
                }
            }
        }
    });
}
