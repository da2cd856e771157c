//! SQLite database setup and migrations.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::error::{StoreError, StoreResult};

/// The relational store of record.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) and migrate the database.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> StoreResult<Self> {
        // A single connection keeps the shared in-memory schema alive.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run the embedded migrations. Every statement is idempotent
    /// (`IF NOT EXISTS` / `INSERT OR IGNORE`), so this is safe at every
    /// startup.
    async fn run_migrations(pool: &SqlitePool) -> StoreResult<()> {
        const MIGRATIONS: &[(&str, &str)] = &[
            ("001_catalog", include_str!("migrations/001_catalog.sql")),
            (
                "002_processing_jobs",
                include_str!("migrations/002_processing_jobs.sql"),
            ),
            (
                "003_fingerprints",
                include_str!("migrations/003_fingerprints.sql"),
            ),
            ("004_settings", include_str!("migrations/004_settings.sql")),
        ];

        for (name, sql) in MIGRATIONS {
            sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        }

        info!("database migrations applied");
        Ok(())
    }
}
