use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Durable warm-start mirror for the client cache.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredCacheEntry {
    pub key: String,
    pub namespace: String,
    pub payload: serde_json::Value,
    pub written_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` opens its own database.
        let max_connections = if is_memory_url(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn put_cache_entry(
        &self,
        key: &str,
        namespace: &str,
        payload: &serde_json::Value,
        written_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_entries (cache_key, namespace, payload, written_at_ms)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(cache_key) DO UPDATE SET
                namespace = excluded.namespace,
                payload = excluded.payload,
                written_at_ms = excluded.written_at_ms",
        )
        .bind(key)
        .bind(namespace)
        .bind(payload.to_string())
        .bind(written_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write cache entry '{key}'"))?;
        Ok(())
    }

    pub async fn load_cache_entry(&self, key: &str) -> Result<Option<StoredCacheEntry>> {
        let row = sqlx::query(
            "SELECT cache_key, namespace, payload, written_at_ms FROM cache_entries WHERE cache_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read cache entry '{key}'"))?;

        row.map(|row| stored_entry_from_row(&row)).transpose()
    }

    pub async fn list_cache_entries(&self, namespace: &str) -> Result<Vec<StoredCacheEntry>> {
        let rows = sqlx::query(
            "SELECT cache_key, namespace, payload, written_at_ms FROM cache_entries
             WHERE namespace = ?
             ORDER BY written_at_ms ASC",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list cache namespace '{namespace}'"))?;

        rows.iter().map(stored_entry_from_row).collect()
    }

    pub async fn delete_cache_entry(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE cache_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete cache entry '{key}'"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_cache_prefix(&self, prefix: &str) -> Result<u64> {
        // substr comparison avoids escaping `%`/`_` in ids for LIKE.
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE substr(cache_key, 1, length(?)) = ?",
        )
        .bind(prefix)
        .bind(prefix)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to delete cache prefix '{prefix}'"))?;
        Ok(result.rows_affected())
    }

    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE written_at_ms < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .context("failed to purge expired cache entries")?;
        Ok(result.rows_affected())
    }
}

fn stored_entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredCacheEntry> {
    let key: String = row.try_get("cache_key")?;
    let raw_payload: String = row.try_get("payload")?;
    let payload = serde_json::from_str(&raw_payload)
        .with_context(|| format!("corrupt payload for cache entry '{key}'"))?;
    let written_at_ms: i64 = row.try_get("written_at_ms")?;
    let written_at = DateTime::<Utc>::from_timestamp_millis(written_at_ms)
        .with_context(|| format!("invalid timestamp for cache entry '{key}'"))?;
    Ok(StoredCacheEntry {
        namespace: row.try_get("namespace")?,
        written_at,
        payload,
        key,
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
