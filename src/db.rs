use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, SqlitePool};
use tracing::info;

use crate::config::Config;

pub async fn create_pool(config: &Config) -> Result<SqlitePool> {
    let db_path = config.db_path();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating data directory: {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(10))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to database: {}", db_path.display()))?;

    info!(path = %db_path.display(), "database connected (WAL mode, foreign keys enabled)");

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Schema is idempotent and applied on every start, in order
    const MIGRATIONS: [(&str, &str); 2] = [
        ("initial_schema", include_str!("../migrations/20261016_000001_initial_schema.sql")),
        ("leads", include_str!("../migrations/20261016_000002_leads.sql")),
    ];

    for (name, sql) in MIGRATIONS {
        pool.execute(sql)
            .await
            .with_context(|| format!("running database migration {name}"))?;
    }

    info!("database migrations applied");
    Ok(())
}

/// Single-connection in-memory database with the schema applied.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    use std::str::FromStr;

    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("valid sqlite url")
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .expect("open in-memory database");
    run_migrations(&pool).await.expect("apply schema");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM generation_configs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        let (leads,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM leads")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(leads, 0);
    }

    #[tokio::test]
    async fn file_pool_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config: Config = toml::from_str(&format!(
            "[pagecast]\ndata_dir = \"{}\"",
            dir.path().join("nested").display()
        ))
        .unwrap();
        let pool = create_pool(&config).await.unwrap();
        assert!(config.db_path().exists());
        pool.close().await;
    }
}
