//! Disk SQL index (component C): the single relational table tracking every
//! disk-tier entry, with inline storage for small blobs.
//!
//! Built on `sqlx`'s SQLite driver, applying the same coalesce-and-batch
//! discipline `storage::disk::IoScheduler` uses for page I/O to
//! `last_access_time` updates instead.

use crate::error::{CacheError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Schema version written to `PRAGMA user_version`. An on-disk version
/// that doesn't match this constant is rejected at open time rather than
/// silently reinterpreted.
const SCHEMA_VERSION: i64 = 1;

/// One row of `manifest.db`.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub key: String,
    pub filename: Option<String>,
    pub size: u64,
    pub inline_data: Option<Vec<u8>>,
    pub modification_time: i64,
    pub last_access_time: i64,
    pub extended_data: Vec<u8>,
}

impl EntryMeta {
    pub fn is_inline(&self) -> bool {
        self.filename.is_none()
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// The relational metadata index backing the disk tier.
pub struct SqlIndex {
    pool: SqlitePool,
    /// Coalesced `last_access_time` updates, flushed in a single batched
    /// statement rather than one write per read.
    pending_access: Mutex<HashMap<String, i64>>,
    coalesce_access_updates: bool,
}

impl SqlIndex {
    pub async fn open(manifest_path: &Path, coalesce_access_updates: bool) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(manifest_path)
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| CacheError::BackendUnavailable(e.to_string()))?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await
            .map_err(|e| CacheError::BackendUnavailable(e.to_string()))?;

        Self::check_and_set_schema_version(&pool).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entries (
                key TEXT PRIMARY KEY,
                filename TEXT,
                size INTEGER NOT NULL,
                inline_data BLOB,
                modification_time INTEGER NOT NULL,
                last_access_time INTEGER NOT NULL,
                extended_data BLOB NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_last_access ON entries(last_access_time)")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            pending_access: Mutex::new(HashMap::new()),
            coalesce_access_updates,
        })
    }

    async fn check_and_set_schema_version(pool: &SqlitePool) -> Result<()> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(pool)
            .await?;

        if version == 0 {
            sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
                .execute(pool)
                .await?;
        } else if version != SCHEMA_VERSION {
            return Err(CacheError::BackendUnavailable(format!(
                "unsupported manifest schema version {version}, expected {SCHEMA_VERSION}"
            )));
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<EntryMeta>> {
        let row = sqlx::query(
            "SELECT key, filename, size, inline_data, modification_time, last_access_time, extended_data
             FROM entries WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let last_access_time = self
            .pending_access
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or_else(|| row.get("last_access_time"));

        Ok(Some(EntryMeta {
            key: row.get("key"),
            filename: row.get("filename"),
            size: row.get::<i64, _>("size") as u64,
            inline_data: row.get("inline_data"),
            modification_time: row.get("modification_time"),
            last_access_time,
            extended_data: row.get("extended_data"),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        &self,
        key: &str,
        filename: Option<&str>,
        size: u64,
        inline_data: Option<&[u8]>,
        extended_data: &[u8],
    ) -> Result<()> {
        let now = now_secs();
        sqlx::query(
            "INSERT INTO entries (key, filename, size, inline_data, modification_time, last_access_time, extended_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6)
             ON CONFLICT(key) DO UPDATE SET
                filename = excluded.filename,
                size = excluded.size,
                inline_data = excluded.inline_data,
                modification_time = excluded.modification_time,
                last_access_time = excluded.last_access_time,
                extended_data = excluded.extended_data",
        )
        .bind(key)
        .bind(filename)
        .bind(size as i64)
        .bind(inline_data)
        .bind(now)
        .bind(extended_data)
        .execute(&self.pool)
        .await?;

        self.pending_access.lock().unwrap().remove(key);
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<Option<EntryMeta>> {
        let existing = self.get(key).await?;
        sqlx::query("DELETE FROM entries WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        self.pending_access.lock().unwrap().remove(key);
        Ok(existing)
    }

    /// Update `last_access_time`, coalescing when configured to do so
    /// rather than writing on every read.
    pub async fn touch_access_time(&self, key: &str) -> Result<()> {
        let now = now_secs();
        if self.coalesce_access_updates {
            self.pending_access.lock().unwrap().insert(key.to_string(), now);
            Ok(())
        } else {
            sqlx::query("UPDATE entries SET last_access_time = ?1 WHERE key = ?2")
                .bind(now)
                .bind(key)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }

    /// Flush coalesced access-time updates to the table in one
    /// transaction. Called by the disk tier's background timer.
    pub async fn flush_pending_access_updates(&self) -> Result<()> {
        let pending: Vec<(String, i64)> = {
            let mut guard = self.pending_access.lock().unwrap();
            let drained = guard.drain().collect();
            drained
        };
        if pending.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (key, ts) in pending {
            sqlx::query("UPDATE entries SET last_access_time = ?1 WHERE key = ?2")
                .bind(ts)
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Select up to `limit` rows in ascending `last_access_time` order —
    /// the next eviction victims.
    pub async fn select_lru_batch(&self, limit: i64) -> Result<Vec<EntryMeta>> {
        self.flush_pending_access_updates().await?;
        let rows = sqlx::query(
            "SELECT key, filename, size, inline_data, modification_time, last_access_time, extended_data
             FROM entries ORDER BY last_access_time ASC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| EntryMeta {
                key: row.get("key"),
                filename: row.get("filename"),
                size: row.get::<i64, _>("size") as u64,
                inline_data: row.get("inline_data"),
                modification_time: row.get("modification_time"),
                last_access_time: row.get("last_access_time"),
                extended_data: row.get("extended_data"),
            })
            .collect())
    }

    /// All rows with `last_access_time < now - age_limit_secs`.
    pub async fn select_older_than(&self, age_limit_secs: i64) -> Result<Vec<EntryMeta>> {
        self.flush_pending_access_updates().await?;
        let cutoff = now_secs() - age_limit_secs;
        let rows = sqlx::query(
            "SELECT key, filename, size, inline_data, modification_time, last_access_time, extended_data
             FROM entries WHERE last_access_time < ?1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| EntryMeta {
                key: row.get("key"),
                filename: row.get("filename"),
                size: row.get::<i64, _>("size") as u64,
                inline_data: row.get("inline_data"),
                modification_time: row.get("modification_time"),
                last_access_time: row.get("last_access_time"),
                extended_data: row.get("extended_data"),
            })
            .collect())
    }

    pub async fn total_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn total_cost(&self) -> Result<u64> {
        let total: Option<i64> = sqlx::query_scalar("SELECT SUM(size) FROM entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.unwrap_or(0) as u64)
    }

    /// All filenames currently referenced by the index, for orphan
    /// reconciliation at startup.
    pub async fn all_filenames(&self) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT filename FROM entries WHERE filename IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn clear(&self) -> Result<Vec<EntryMeta>> {
        self.flush_pending_access_updates().await?;
        let rows = sqlx::query(
            "SELECT key, filename, size, inline_data, modification_time, last_access_time, extended_data
             FROM entries",
        )
        .fetch_all(&self.pool)
        .await?;
        sqlx::query("DELETE FROM entries").execute(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| EntryMeta {
                key: row.get("key"),
                filename: row.get("filename"),
                size: row.get::<i64, _>("size") as u64,
                inline_data: row.get("inline_data"),
                modification_time: row.get("modification_time"),
                last_access_time: row.get("last_access_time"),
                extended_data: row.get("extended_data"),
            })
            .collect())
    }

    /// Issue a short-lived WAL checkpoint. Called on explicit flush and
    /// on shutdown.
    pub async fn checkpoint(&self) -> Result<()> {
        self.flush_pending_access_updates().await?;
        sqlx::query("PRAGMA wal_checkpoint(PASSIVE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// A cheap, `'static` clone of the underlying connection pool (`sqlx`
    /// pools are themselves `Arc`-backed), for the disk tier's `Drop` impl
    /// to issue a detached best-effort checkpoint on shutdown without
    /// borrowing from `self`.
    pub(crate) fn pool_handle(&self) -> SqlitePool {
        self.pool.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_index() -> (tempfile::TempDir, SqlIndex) {
        let dir = tempdir().unwrap();
        let index = SqlIndex::open(&dir.path().join("manifest.db"), true).await.unwrap();
        (dir, index)
    }

    #[tokio::test]
    async fn upsert_and_get_roundtrip() {
        let (_dir, index) = open_index().await;
        index.upsert("a", None, 3, Some(b"abc"), b"").await.unwrap();
        let row = index.get("a").await.unwrap().unwrap();
        assert_eq!(row.inline_data.as_deref(), Some(&b"abc"[..]));
        assert!(row.is_inline());
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let (_dir, index) = open_index().await;
        index.upsert("a", None, 1, Some(b"a"), b"").await.unwrap();
        index.delete("a").await.unwrap();
        assert!(index.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn total_count_and_cost_track_rows() {
        let (_dir, index) = open_index().await;
        index.upsert("a", None, 10, Some(b"0123456789"), b"").await.unwrap();
        index.upsert("b", None, 5, Some(b"01234"), b"").await.unwrap();
        assert_eq!(index.total_count().await.unwrap(), 2);
        assert_eq!(index.total_cost().await.unwrap(), 15);
    }

    #[tokio::test]
    async fn lru_batch_orders_by_access_time_ascending() {
        let (_dir, index) = open_index().await;
        index.upsert("old", None, 1, Some(b"a"), b"").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        index.upsert("new", None, 1, Some(b"a"), b"").await.unwrap();
        let batch = index.select_lru_batch(10).await.unwrap();
        assert_eq!(batch[0].key, "old");
    }

    #[tokio::test]
    async fn coalesced_access_time_visible_before_flush() {
        let (_dir, index) = open_index().await;
        index.upsert("a", None, 1, Some(b"a"), b"").await.unwrap();
        let initial = index.get("a").await.unwrap().unwrap().last_access_time;
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        index.touch_access_time("a").await.unwrap();
        let touched = index.get("a").await.unwrap().unwrap().last_access_time;
        assert!(touched > initial);
        index.flush_pending_access_updates().await.unwrap();
        let after_flush = index.get("a").await.unwrap().unwrap().last_access_time;
        assert_eq!(after_flush, touched);
    }
}
