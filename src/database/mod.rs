use sqlx::{
    SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{path::PathBuf, sync::LazyLock, time::Duration};
use thiserror::Error;

pub mod messages;
pub mod utils;

pub static MIGRATOR: LazyLock<Migrator> = LazyLock::new(|| sqlx::migrate!("./db_migrations"));

const DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;
const DB_MAX_CONNECTIONS: u32 = 10;
const DB_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),
    #[error("Invalid timestamp: {timestamp} cannot be converted to DateTime")]
    InvalidTimestamp { timestamp: i64 },
}

/// Message database file plus its connection pool.
#[derive(Clone, Debug)]
pub struct Database {
    pub pool: SqlitePool,
    pub path: PathBuf,
}

impl Database {
    /// Opens (creating if needed) the database at `db_path` and applies pending
    /// migrations.
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::debug!(
            target: "quadchat::database",
            "Opening message database at {}",
            db_path.display()
        );

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            // Subscribers re-read snapshots while a writer holds the lock
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(DB_BUSY_TIMEOUT_MS))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(DB_ACQUIRE_TIMEOUT_SECS))
            .max_connections(DB_MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|e| {
                tracing::error!(target: "quadchat::database", "Error opening DB: {:?}", e);
                DatabaseError::Sqlx(e)
            })?;

        MIGRATOR.run(&pool).await?;

        Ok(Self {
            pool,
            path: db_path,
        })
    }

    /// Closes every pooled connection. Further queries fail with `PoolClosed`.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path)
            .await
            .expect("Failed to create test database");
        (db, temp_dir)
    }

    #[tokio::test]
    async fn test_database_creation() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("nested").join("test.db");

        let db = Database::new(db_path.clone()).await;
        assert!(db.is_ok());

        let db = db.unwrap();
        assert_eq!(db.path, db_path);
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_migrations_create_messages_table() {
        let (db, _temp_dir) = create_test_db().await;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name = 'messages'",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();

        assert_eq!(tables.len(), 1);
    }

    #[tokio::test]
    async fn test_connections_use_wal() {
        let (db, _temp_dir) = create_test_db().await;

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows_and_skips_applied_migrations() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");

        let first = Database::new(db_path.clone()).await.unwrap();
        sqlx::query(
            "INSERT INTO messages
             (id, sender_id, receiver_id, conversation_key, content, timestamp, read)
             VALUES ('m1', 'a', 'b', 'a|b', 'hi', 1, 0)",
        )
        .execute(&first.pool)
        .await
        .unwrap();
        first.close().await;

        let second = Database::new(db_path).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&second.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_queries() {
        let (db, _temp_dir) = create_test_db().await;
        db.close().await;

        let result = sqlx::query("SELECT 1").execute(&db.pool).await;
        assert!(result.is_err());
    }
}
