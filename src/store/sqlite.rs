use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use super::{validate_name, DurableStore, StoreError};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS "roster_snapshots" (
        "name" TEXT PRIMARY KEY NOT NULL,
        "payload" BLOB NOT NULL,
        "updated_at" TEXT NOT NULL
    )
"#;

/// Snapshots kept as rows of a single SQLite table, keyed by name.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Self::new(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn write(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_name(name)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO "roster_snapshots" ("name", "payload", "updated_at")
            VALUES (?, ?, CURRENT_TIMESTAMP)
            "#,
        )
        .bind(name)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_name(name)?;
        let payload: Option<Vec<u8>> =
            sqlx::query_scalar(r#"SELECT "payload" FROM "roster_snapshots" WHERE "name" = ?"#)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(payload)
    }
}
