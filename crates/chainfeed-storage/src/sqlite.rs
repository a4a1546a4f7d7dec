//! SQLite snapshot store.
//!
//! One table, one row per actor: `(kind, key) → JSON snapshot`. Saves are
//! upserts, so the table only ever holds the latest snapshot of each actor.
//!
//! # Usage
//! ```rust,no_run
//! use chainfeed_storage::sqlite::SqliteStateStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStateStore::open("./feed.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStateStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainfeed_core::error::FeedError;
use chainfeed_core::store::StateStore;

/// SQLite-backed [`StateStore`].
pub struct SqliteStateStore {
    pool: SqlitePool,
}

fn storage_err(e: sqlx::Error) -> FeedError {
    FeedError::Storage(e.to_string())
}

impl SqliteStateStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./feed.db"`) or a full
    /// SQLite URL (`"sqlite:./feed.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, FeedError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory database. Data is lost when the store is dropped.
    pub async fn in_memory() -> Result<Self, FeedError> {
        // Every connection to `:memory:` is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), FeedError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS actor_state (
                kind       TEXT    NOT NULL,
                key        TEXT    NOT NULL,
                snapshot   TEXT    NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (kind, key)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Unix time (seconds) of the last save of (`kind`, `key`).
    pub async fn updated_at(&self, kind: &str, key: &str) -> Result<Option<i64>, FeedError> {
        let row = sqlx::query("SELECT updated_at FROM actor_state WHERE kind = ? AND key = ?")
            .bind(kind)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|r| r.get::<i64, _>("updated_at")))
    }

    /// Number of stored snapshots across all kinds.
    pub async fn snapshot_count(&self) -> Result<u64, FeedError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM actor_state")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

// ─── StateStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, kind: &str, key: &str) -> Result<Option<serde_json::Value>, FeedError> {
        let row = sqlx::query("SELECT snapshot FROM actor_state WHERE kind = ? AND key = ?")
            .bind(kind)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let text: String = row.get("snapshot");
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| FeedError::Storage(format!("unreadable {kind} snapshot '{key}': {e}")))
    }

    async fn save(&self, kind: &str, key: &str, value: serde_json::Value) -> Result<(), FeedError> {
        let text = serde_json::to_string(&value).map_err(|e| FeedError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT OR REPLACE INTO actor_state (kind, key, snapshot, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(kind)
        .bind(key)
        .bind(&text)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(kind, key, bytes = text.len(), "snapshot saved");
        Ok(())
    }

    async fn delete(&self, kind: &str, key: &str) -> Result<(), FeedError> {
        sqlx::query("DELETE FROM actor_state WHERE kind = ? AND key = ?")
            .bind(kind)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn keys(&self, kind: &str) -> Result<Vec<String>, FeedError> {
        let rows = sqlx::query("SELECT key FROM actor_state WHERE kind = ? ORDER BY key")
            .bind(kind)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("key")).collect())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chainfeed_core::keys::{PusherId, StateKey};
    use chainfeed_core::ledger::ChainLedger;
    use chainfeed_core::store::{load_state, save_state};
    use chainfeed_core::subscription::VersionId;
    use chainfeed_core::types::Block;

    #[tokio::test]
    async fn snapshot_upsert_and_load() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        store.save("app", "demo", serde_json::json!({ "v": 1 })).await.unwrap();
        store.save("app", "demo", serde_json::json!({ "v": 2 })).await.unwrap();

        let loaded = store.load("app", "demo").await.unwrap().unwrap();
        assert_eq!(loaded["v"], 2);
        assert_eq!(store.snapshot_count().await.unwrap(), 1);
        assert!(store.updated_at("app", "demo").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_snapshot_returns_none() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        assert!(store.load("ledger", "AELF/0x0").await.unwrap().is_none());
        assert!(store.updated_at("ledger", "AELF/0x0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn kinds_are_isolated_and_keys_sorted() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let a = PusherId::new("app", VersionId(2), "tDVV");
        let b = PusherId::new("app", VersionId(1), "AELF");
        store.save("pusher", &a.storage_key(), serde_json::json!(1)).await.unwrap();
        store.save("pusher", &b.storage_key(), serde_json::json!(2)).await.unwrap();
        store.save("app", "app", serde_json::json!(3)).await.unwrap();

        assert_eq!(
            store.keys("pusher").await.unwrap(),
            vec!["app/v1/AELF".to_string(), "app/v2/tDVV".to_string()]
        );
        assert_eq!(store.keys("app").await.unwrap(), vec!["app".to_string()]);

        store.delete("pusher", &a.storage_key()).await.unwrap();
        store.delete("pusher", &a.storage_key()).await.unwrap();
        assert_eq!(store.keys("pusher").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn typed_ledger_snapshot_survives() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let mut ledger = ChainLedger::new("AELF");
        ledger
            .record_block(
                Block {
                    chain_id: "AELF".into(),
                    block_hash: "0xa".into(),
                    block_number: 10,
                    previous_block_hash: "0x9".into(),
                    lib_block_number: 0,
                    is_confirmed: false,
                    block_time: 0,
                    transactions: vec![],
                },
                true,
            )
            .unwrap();

        save_state(&store, "ledger", "AELF/0xa", &ledger).await.unwrap();
        let loaded: ChainLedger = load_state(&store, "ledger", "AELF/0xa").await.unwrap().unwrap();
        assert_eq!(loaded, ledger);
    }

    #[tokio::test]
    async fn file_backed_store_persists() {
        let path = std::env::temp_dir().join(format!("chainfeed-{}.db", std::process::id()));
        let path = path.to_string_lossy().to_string();
        {
            let store = SqliteStateStore::open(&path).await.unwrap();
            store.save("registry", "global", serde_json::json!({ "pushers": {} })).await.unwrap();
            store.pool.close().await;
        }
        let reopened = SqliteStateStore::open(&path).await.unwrap();
        assert!(reopened.load("registry", "global").await.unwrap().is_some());
        reopened.pool.close().await;
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(format!("{path}-wal"));
        let _ = std::fs::remove_file(format!("{path}-shm"));
    }
}
