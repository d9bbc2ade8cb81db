//! Embedded-file storage on SQLite.
//!
//! Every operation opens its own connection, makes sure the table exists and
//! commits before returning. Nothing is held open between calls.

use super::{KvStore, TABLE};
use crate::error::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, Row};
use std::path::Path;

/// SQLite file storage.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: String,
}

impl SqliteStore {
    pub fn new(path: impl Into<String>) -> Self {
        SqliteStore { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Open a connection with the schema in place.
    async fn connect(&self) -> Result<SqliteConnection> {
        if let Some(parent) = Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::Storage(format!(
                        "Failed to create directory for {}: {}",
                        self.path, e
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| Error::Storage(format!("Failed to open {}: {}", self.path, e)))?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT)",
            TABLE
        ))
        .execute(&mut conn)
        .await?;

        Ok(conn)
    }
}

impl KvStore for SqliteStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO {} (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            TABLE
        ))
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        conn.close().await?;

        debug!("✓ SQLite PUT {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connect().await?;
        let row = sqlx::query(&format!("SELECT value FROM {} WHERE key = ?", TABLE))
            .bind(key)
            .fetch_optional(&mut conn)
            .await?;
        conn.close().await?;

        match row {
            Some(row) => Ok(row.try_get::<Option<String>, _>(0)?),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        sqlx::query(&format!("DELETE FROM {} WHERE key = ?", TABLE))
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        conn.close().await?;

        debug!("✓ SQLite DELETE {}", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("kv.db");
        let store = SqliteStore::new(path.to_string_lossy().to_string());
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (_dir, store) = temp_store();

        assert_eq!(store.get("a").await.expect("get"), None);
        store.put("a", "1").await.expect("put");
        assert_eq!(store.get("a").await.expect("get").as_deref(), Some("1"));
        store.delete("a").await.expect("delete");
        assert_eq!(store.get("a").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_upsert_replaces_value() {
        let (_dir, store) = temp_store();
        store.put("a", "1").await.expect("put");
        store.put("a", "2").await.expect("put");
        assert_eq!(store.get("a").await.expect("get").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_data_survives_new_store_instance() {
        let (_dir, store) = temp_store();
        store.put("durable", "yes").await.expect("put");

        let reopened = SqliteStore::new(store.path().to_string());
        assert_eq!(
            reopened.get("durable").await.expect("get").as_deref(),
            Some("yes")
        );
    }

    #[tokio::test]
    async fn test_delete_twice_is_ok() {
        let (_dir, store) = temp_store();
        store.put("a", "1").await.expect("put");
        store.delete("a").await.expect("delete");
        store.delete("a").await.expect("delete again");
    }
}
