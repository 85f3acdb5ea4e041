//! services/api/src/adapters/store.rs
//!
//! This module contains the durable store adapter, the concrete implementation of the
//! `DocumentStore` port from the `core` crate. Every collection is a SQLite table of
//! `(id, body)` rows where `body` is the record's JSON document.
//!
//! The connection pool is opened lazily on first use. The schema version lives in
//! SQLite's `user_version` header field and is bumped in the same transaction that
//! creates the collections it introduces.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bedtales_core::ports::{DocumentStore, PortError, PortResult};
use bedtales_core::store::StoreName;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// The schema version this build expects.
pub const SCHEMA_VERSION: i64 = 3;

/// Collections introduced by each schema version. Migrations only ever add.
fn collections_added_in(version: i64) -> &'static [StoreName] {
    match version {
        1 => &[StoreName::Stories, StoreName::History, StoreName::Characters],
        2 => &[StoreName::Settings],
        3 => &[StoreName::ApiUsage],
        _ => &[],
    }
}

fn transaction_failed(e: sqlx::Error) -> PortError {
    PortError::TransactionFailed(e.to_string())
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A document store backed by an embedded SQLite database.
pub struct SqliteDocumentStore {
    database_url: String,
    pool: OnceCell<SqlitePool>,
}

impl SqliteDocumentStore {
    /// Creates the adapter without touching the database.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            pool: OnceCell::new(),
        }
    }

    /// Opens the database and brings its schema up to date.
    ///
    /// Idempotent. Callers racing the first open all wait on the same attempt; a
    /// failed attempt leaves the cell empty so a later call can retry.
    pub async fn open(&self) -> PortResult<&SqlitePool> {
        self.pool
            .get_or_try_init(|| async {
                let pool = Self::connect(&self.database_url)
                    .await
                    .map_err(|e| PortError::StorageUnavailable(e.to_string()))?;
                Self::migrate(&pool)
                    .await
                    .map_err(|e| PortError::StorageUnavailable(format!("migration failed: {}", e)))?;
                Ok(pool)
            })
            .await
    }

    async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
    }

    /// Runs every migration between the stored version and `SCHEMA_VERSION`.
    async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        let (current,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&mut *tx)
            .await?;

        if current > SCHEMA_VERSION {
            warn!(
                "Database schema v{} is newer than this build (v{}); opening as is",
                current, SCHEMA_VERSION
            );
            return Ok(());
        }
        if current == SCHEMA_VERSION {
            debug!("Database schema is current (v{})", current);
            return Ok(());
        }

        info!("Migrating database schema from v{} to v{}", current, SCHEMA_VERSION);
        for version in (current + 1)..=SCHEMA_VERSION {
            for store in collections_added_in(version) {
                Self::create_collection(&mut tx, *store).await?;
            }
        }
        // PRAGMA values cannot be bound as parameters.
        sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    async fn create_collection(
        tx: &mut Transaction<'_, Sqlite>,
        store: StoreName,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (
                id   TEXT PRIMARY KEY NOT NULL,
                body TEXT NOT NULL
            )"#,
            store.as_str()
        ))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn begin(&self) -> PortResult<Transaction<'static, Sqlite>> {
        self.open().await?.begin().await.map_err(transaction_failed)
    }

    async fn upsert(
        tx: &mut Transaction<'_, Sqlite>,
        store: StoreName,
        id: &str,
        value: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            r#"INSERT INTO "{}" (id, body) VALUES (?, ?)
               ON CONFLICT(id) DO UPDATE SET body = excluded.body"#,
            store.as_str()
        ))
        .bind(id)
        .bind(value.to_string())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

//=========================================================================================
// `DocumentStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get_all(&self, store: StoreName) -> PortResult<Vec<serde_json::Value>> {
        let pool = self.open().await?;
        let rows: Vec<(String, String)> =
            sqlx::query_as(&format!(r#"SELECT id, body FROM "{}""#, store.as_str()))
                .fetch_all(pool)
                .await
                .map_err(transaction_failed)?;

        let mut values = Vec::with_capacity(rows.len());
        for (id, body) in rows {
            match serde_json::from_str(&body) {
                Ok(value) => values.push(value),
                Err(e) => warn!("Skipping unreadable row {} in {}: {}", id, store, e),
            }
        }
        Ok(values)
    }

    async fn put(&self, store: StoreName, id: &str, value: serde_json::Value) -> PortResult<()> {
        let mut tx = self.begin().await?;
        Self::upsert(&mut tx, store, id, &value)
            .await
            .map_err(transaction_failed)?;
        tx.commit().await.map_err(transaction_failed)
    }

    async fn delete(&self, store: StoreName, id: &str) -> PortResult<()> {
        let pool = self.open().await?;
        sqlx::query(&format!(r#"DELETE FROM "{}" WHERE id = ?"#, store.as_str()))
            .bind(id)
            .execute(pool)
            .await
            .map_err(transaction_failed)?;
        Ok(())
    }

    async fn delete_many(&self, store: StoreName, ids: &[String]) -> PortResult<()> {
        let mut tx = self.begin().await?;
        let statement = format!(r#"DELETE FROM "{}" WHERE id = ?"#, store.as_str());
        for id in ids {
            sqlx::query(&statement)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(transaction_failed)?;
        }
        tx.commit().await.map_err(transaction_failed)
    }

    async fn clear(&self, store: StoreName) -> PortResult<()> {
        let pool = self.open().await?;
        sqlx::query(&format!(r#"DELETE FROM "{}""#, store.as_str()))
            .execute(pool)
            .await
            .map_err(transaction_failed)?;
        Ok(())
    }

    async fn bulk_put(
        &self,
        store: StoreName,
        items: Vec<(String, serde_json::Value)>,
    ) -> PortResult<()> {
        let mut tx = self.begin().await?;
        for (id, value) in &items {
            Self::upsert(&mut tx, store, id, value)
                .await
                .map_err(transaction_failed)?;
        }
        tx.commit().await.map_err(transaction_failed)?;
        debug!("Bulk upserted {} records into {}", items.len(), store);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn url_in(dir: &tempfile::TempDir, name: &str) -> String {
        format!("sqlite://{}", dir.path().join(name).display())
    }

    async fn user_version(pool: &SqlitePool) -> i64 {
        let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(pool)
            .await
            .unwrap();
        version
    }

    async fn table_names(pool: &SqlitePool) -> Vec<String> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(pool)
        .await
        .unwrap();
        rows.into_iter().map(|r| r.0).collect()
    }

    #[tokio::test]
    async fn test_open_creates_every_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDocumentStore::new(url_in(&dir, "fresh.db"));

        let pool = store.open().await.unwrap();

        assert_eq!(user_version(pool).await, SCHEMA_VERSION);
        let tables = table_names(pool).await;
        for name in StoreName::ALL {
            assert!(tables.contains(&name.as_str().to_string()), "{} missing", name);
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_use_shares_one_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteDocumentStore::new(url_in(&dir, "race.db")));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get_all(StoreName::Stories).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_empty());
        }
        assert!(store.pool.initialized());
    }

    #[tokio::test]
    async fn test_unopenable_database_is_storage_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}",
            dir.path().join("missing").join("nested").join("x.db").display()
        );
        let store = SqliteDocumentStore::new(url);

        let err = store.get_all(StoreName::Stories).await.unwrap_err();
        assert!(matches!(err, PortError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_upgrade_from_v1_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let url = url_in(&dir, "old.db");
        {
            let pool = SqliteDocumentStore::connect(&url).await.unwrap();
            sqlx::query(r#"CREATE TABLE "stories" (id TEXT PRIMARY KEY NOT NULL, body TEXT NOT NULL)"#)
                .execute(&pool)
                .await
                .unwrap();
            sqlx::query(r#"INSERT INTO "stories" (id, body) VALUES ('s1', '{"id":"s1"}')"#)
                .execute(&pool)
                .await
                .unwrap();
            sqlx::query("PRAGMA user_version = 1")
                .execute(&pool)
                .await
                .unwrap();
            pool.close().await;
        }

        let store = SqliteDocumentStore::new(url);
        let stories = store.get_all(StoreName::Stories).await.unwrap();
        assert_eq!(stories, vec![json!({"id": "s1"})]);
        assert!(store.get_all(StoreName::ApiUsage).await.unwrap().is_empty());
        assert_eq!(user_version(store.open().await.unwrap()).await, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_put_is_insert_or_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDocumentStore::new(url_in(&dir, "put.db"));

        store
            .put(StoreName::Settings, "k", json!({"id": "k", "value": 1}))
            .await
            .unwrap();
        store
            .put(StoreName::Settings, "k", json!({"id": "k", "value": 1}))
            .await
            .unwrap();
        store
            .put(StoreName::Settings, "k", json!({"id": "k", "value": 2}))
            .await
            .unwrap();

        let rows = store.get_all(StoreName::Settings).await.unwrap();
        assert_eq!(rows, vec![json!({"id": "k", "value": 2})]);
    }

    #[tokio::test]
    async fn test_delete_many_with_missing_id_removes_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDocumentStore::new(url_in(&dir, "delete.db"));
        store
            .bulk_put(
                StoreName::History,
                ["a", "b", "c"]
                    .iter()
                    .map(|id| (id.to_string(), json!({ "id": id })))
                    .collect(),
            )
            .await
            .unwrap();

        store
            .delete_many(StoreName::History, &["a".to_string(), "zzz".to_string(), "c".to_string()])
            .await
            .unwrap();
        store.delete(StoreName::History, "never-existed").await.unwrap();

        let rows = store.get_all(StoreName::History).await.unwrap();
        assert_eq!(rows, vec![json!({"id": "b"})]);
    }

    #[tokio::test]
    async fn test_clear_only_touches_one_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDocumentStore::new(url_in(&dir, "clear.db"));
        store
            .put(StoreName::Stories, "s", json!({"id": "s"}))
            .await
            .unwrap();
        store
            .put(StoreName::Characters, "c", json!({"id": "c"}))
            .await
            .unwrap();

        store.clear(StoreName::Stories).await.unwrap();

        assert!(store.get_all(StoreName::Stories).await.unwrap().is_empty());
        assert_eq!(store.get_all(StoreName::Characters).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = url_in(&dir, "reopen.db");
        {
            let store = SqliteDocumentStore::new(url.clone());
            store
                .put(StoreName::ApiUsage, "createStory", json!({"id": "createStory", "count": 1}))
                .await
                .unwrap();
            store.open().await.unwrap().close().await;
        }

        let store = SqliteDocumentStore::new(url);
        let rows = store.get_all(StoreName::ApiUsage).await.unwrap();
        assert_eq!(rows[0]["count"], json!(1));
    }
}
