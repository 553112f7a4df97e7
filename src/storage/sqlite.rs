use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{error, info, warn};

use super::{BatchOp, KeyValueStore};
use crate::time::now_ms;
use crate::{AppError, AppResult};

const CREATE_KV: &str = "CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)";

const UPSERT: &str = "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

/// Key-value store backed by a single SQLite table.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    error!(
                        target: "dosekeeper",
                        event = "data_dir_create_failed",
                        error = %err,
                        path = %parent.display()
                    );
                    AppError::from(err).with_context("path", parent.display().to_string())
                })?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    sqlx::query("PRAGMA busy_timeout = 5000;")
                        .execute(&mut *conn)
                        .await?;
                    Ok::<_, sqlx::Error>(())
                })
            })
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        store.log_effective_pragmas(path).await;
        Ok(store)
    }

    /// Private in-memory database; one connection so every query sees the same data.
    pub async fn open_in_memory() -> AppResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn ensure_schema(&self) -> AppResult<()> {
        sqlx::query(CREATE_KV).execute(&self.pool).await?;
        Ok(())
    }

    async fn log_effective_pragmas(&self, path: &Path) {
        let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
            .fetch_one(&self.pool)
            .await
            .unwrap_or((String::from("unknown"),));
        let sync: (i64,) = sqlx::query_as("PRAGMA synchronous;")
            .fetch_one(&self.pool)
            .await
            .unwrap_or((i64::MIN,));

        info!(
            target: "dosekeeper",
            event = "db_open",
            path = %path.display(),
            journal_mode = %jm.0,
            synchronous = %sync.0
        );

        if !jm.0.eq_ignore_ascii_case("wal") {
            warn!(
                target: "dosekeeper",
                event = "db_open_warning",
                msg = "journal_mode != WAL; running with reduced crash safety"
            );
        }
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<String, _>(0)))
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        sqlx::query(UPSERT)
            .bind(key)
            .bind(value)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> AppResult<Vec<String>> {
        // substr comparison avoids LIKE wildcard escaping for `_` in owner ids.
        let rows = sqlx::query(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.get::<String, _>(0)).collect())
    }

    async fn apply_batch(&self, ops: Vec<BatchOp>) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        let stamp = now_ms();
        let count = ops.len();

        let mut outcome: Result<(), sqlx::Error> = Ok(());
        for op in &ops {
            let result = match op {
                BatchOp::Set { key, value } => sqlx::query(UPSERT)
                    .bind(key)
                    .bind(value)
                    .bind(stamp)
                    .execute(&mut *tx)
                    .await,
                BatchOp::Remove { key } => sqlx::query("DELETE FROM kv WHERE key = ?1")
                    .bind(key)
                    .execute(&mut *tx)
                    .await,
            };
            if let Err(err) = result {
                outcome = Err(err);
                break;
            }
        }

        match outcome {
            Ok(()) => {
                tx.commit().await?;
                info!(target: "dosekeeper", event = "db_batch_commit", ops = count);
                Ok(())
            }
            Err(err) => {
                if let Err(rb) = tx.rollback().await {
                    error!(target: "dosekeeper", event = "db_batch_rollback_failed", error = %rb);
                } else {
                    warn!(target: "dosekeeper", event = "db_batch_rollback", ops = count);
                }
                Err(err.into())
            }
        }
    }
}
