use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Read the resumable floor stored for `job`, if any.
pub async fn get_checkpoint(pool: &SqlitePool, job: &str) -> Result<Option<i64>> {
    let cursor: Option<i64> = sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE job = ?")
        .bind(job)
        .fetch_optional(pool)
        .await?;
    Ok(cursor)
}

pub async fn set_checkpoint(pool: &SqlitePool, job: &str, cursor: i64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO checkpoints (job, cursor, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(job) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
        "#,
    )
    .bind(job)
    .bind(cursor)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}
