// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The Audio Cache (spec §4.10), grounded verbatim on
//! `yapit/gateway/cache.py`'s `SqliteCache` — same table shape, same
//! `idx_cache_last_accessed` index, same size-bounded LRU eviction and
//! `VACUUM`/bloat-ratio maintenance. The `pinned` column and pin-protected
//! eviction are this spec's own addition; the original has no pin concept.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::CacheError;

/// Configuration for a [`SqliteCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum total size, in bytes, before LRU eviction kicks in.
    pub max_size_bytes: i64,
    /// `VACUUM` is run when the freelist-to-total-page ratio exceeds this.
    pub bloat_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 * 1024 * 1024 * 1024,
            bloat_threshold: 0.2,
        }
    }
}

/// Aggregate statistics over the cache's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Sum of all entries' `size` columns.
    pub total_size_bytes: i64,
    /// Number of rows in the cache table.
    pub entry_count: i64,
    /// Number of rows marked `pinned`.
    pub pinned_count: i64,
}

/// Content-addressed byte store with size-bounded LRU eviction and pin
/// protection.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Write `data` under `key`, touching `last_accessed`, then evict if
    /// the store is now over budget.
    async fn store(&self, key: &str, data: &[u8]) -> Result<(), CacheError>;

    /// Return bytes for `key` and touch `last_accessed`, or `None` if
    /// absent.
    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Membership test without reading bytes.
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Membership test over many keys in a single round trip.
    async fn batch_exists(&self, keys: &[String]) -> Result<HashSet<String>, CacheError>;

    /// Mark entries as non-evictable.
    async fn pin(&self, keys: &[String]) -> Result<(), CacheError>;

    /// Remove an entry outright.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Run `VACUUM` if the database's bloat ratio exceeds the configured
    /// threshold. Returns `true` if a vacuum ran.
    async fn vacuum_if_needed(&self) -> Result<bool, CacheError>;

    /// Aggregate statistics, for admin/monitoring surfaces.
    async fn stats(&self) -> Result<CacheStats, CacheError>;
}

/// SQLite-backed `Cache`.
pub struct SqliteCache {
    pool: SqlitePool,
    config: CacheConfig,
}

impl SqliteCache {
    /// Wrap an existing pool. Callers should open it with
    /// `PRAGMA journal_mode=WAL` (matching the original's aiosqlite setup)
    /// before passing it here.
    pub fn new(pool: SqlitePool, config: CacheConfig) -> Self {
        Self { pool, config }
    }

    /// Run the schema migration for the `cache` table and its index.
    pub async fn migrate(&self) -> Result<(), CacheError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                size INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL,
                pinned BOOLEAN NOT NULL DEFAULT FALSE
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_last_accessed ON cache (last_accessed)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn enforce_max_size(&self) -> Result<(), CacheError> {
        let (total,): (i64,) = sqlx::query_as("SELECT COALESCE(SUM(size), 0) FROM cache")
            .fetch_one(&self.pool)
            .await?;

        if total <= self.config.max_size_bytes {
            return Ok(());
        }

        let mut over_budget = total - self.config.max_size_bytes;
        let candidates: Vec<(String, i64)> = sqlx::query_as(
            "SELECT key, size FROM cache WHERE pinned = FALSE ORDER BY last_accessed ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        for (key, size) in candidates {
            if over_budget <= 0 {
                break;
            }
            sqlx::query("DELETE FROM cache WHERE key = ?")
                .bind(&key)
                .execute(&self.pool)
                .await?;
            over_budget -= size;
            tracing::debug!(key, size, "evicted cache entry over budget");
        }

        Ok(())
    }
}

#[async_trait]
impl Cache for SqliteCache {
    async fn store(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r"
            INSERT INTO cache (key, data, size, created_at, last_accessed, pinned)
            VALUES (?, ?, ?, ?, ?, FALSE)
            ON CONFLICT (key) DO UPDATE SET
                data = excluded.data, size = excluded.size, last_accessed = excluded.last_accessed
            ",
        )
        .bind(key)
        .bind(data)
        .bind(data.len() as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.enforce_max_size().await?;
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT data FROM cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        if row.is_some() {
            let now = Utc::now().timestamp();
            sqlx::query("UPDATE cache SET last_accessed = ? WHERE key = ?")
                .bind(now)
                .bind(key)
                .execute(&self.pool)
                .await?;
        }
        Ok(row.map(|(data,)| data))
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn batch_exists(&self, keys: &[String]) -> Result<HashSet<String>, CacheError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = keys.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!("SELECT key FROM cache WHERE key IN ({placeholders})");
        let mut query = sqlx::query_as::<_, (String,)>(&sql);
        for key in keys {
            query = query.bind(key);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn pin(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let placeholders = keys.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!("UPDATE cache SET pinned = TRUE WHERE key IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn vacuum_if_needed(&self) -> Result<bool, CacheError> {
        let (page_count,): (i64,) = sqlx::query_as("PRAGMA page_count").fetch_one(&self.pool).await?;
        let (freelist_count,): (i64,) =
            sqlx::query_as("PRAGMA freelist_count").fetch_one(&self.pool).await?;

        if page_count == 0 {
            return Ok(false);
        }
        let bloat_ratio = freelist_count as f64 / page_count as f64;
        if bloat_ratio > self.config.bloat_threshold {
            sqlx::query("VACUUM").execute(&self.pool).await?;
            tracing::info!(bloat_ratio, "vacuumed audio cache");
            return Ok(true);
        }
        Ok(false)
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let (total_size_bytes, entry_count, pinned_count): (i64, i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(size), 0), COUNT(*), COALESCE(SUM(pinned), 0) FROM cache",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(CacheStats {
            total_size_bytes,
            entry_count,
            pinned_count,
        })
    }
}
