use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::StoreError;

/// Durable snapshot plus ordered update log, partitioned by session id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load_snapshot(&self, session_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Updates recorded since the last snapshot, oldest first.
    async fn load_updates(&self, session_id: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    async fn append_update(&self, session_id: &str, update: &[u8]) -> Result<(), StoreError>;

    async fn write_snapshot(&self, session_id: &str, state: &[u8]) -> Result<(), StoreError>;

    async fn clear_updates(&self, session_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        Self::migrated(pool).await
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn load_snapshot(&self, session_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let state = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT state FROM document_snapshots WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    async fn load_updates(&self, session_id: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let updates = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT payload FROM document_updates WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(updates)
    }

    async fn append_update(&self, session_id: &str, update: &[u8]) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO document_updates (session_id, payload) VALUES (?, ?)")
            .bind(session_id)
            .bind(update)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_snapshot(&self, session_id: &str, state: &[u8]) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO document_snapshots (session_id, state, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(session_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
        )
        .bind(session_id)
        .bind(state)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_updates(&self, session_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM document_updates WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn it_keeps_updates_in_arrival_order() {
        let store = SqliteDocumentStore::in_memory().await.expect("store");
        store.append_update("S1", b"one").await.expect("append");
        store.append_update("S2", b"other").await.expect("append");
        store.append_update("S1", b"two").await.expect("append");

        let updates = store.load_updates("S1").await.expect("load");
        assert_eq!(updates, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn it_overwrites_snapshot_and_clears_only_own_log() {
        let store = SqliteDocumentStore::in_memory().await.expect("store");
        assert_eq!(store.load_snapshot("S1").await.expect("load"), None);

        store.write_snapshot("S1", b"v1").await.expect("write");
        store.write_snapshot("S1", b"v2").await.expect("write");
        store.append_update("S1", b"a").await.expect("append");
        store.append_update("S2", b"b").await.expect("append");
        store.clear_updates("S1").await.expect("clear");

        assert_eq!(
            store.load_snapshot("S1").await.expect("load"),
            Some(b"v2".to_vec())
        );
        assert!(store.load_updates("S1").await.expect("load").is_empty());
        assert_eq!(store.load_updates("S2").await.expect("load").len(), 1);
    }

    #[tokio::test]
    async fn it_fails_to_connect_to_unusable_path() {
        let result =
            SqliteDocumentStore::connect("sqlite:///nonexistent-dir/for/sure/doc.db?mode=ro")
                .await;
        assert!(result.is_err());
    }
}
