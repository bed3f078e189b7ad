//! Poll audit recorder.
//!
//! `poll_runs` is append-only: one row per attempted poll, whatever the
//! outcome. Gate skips never reach this module.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::PollRun;
use crate::status::describe_code;

/// Append one poll run and bump the source's `last_polled`, atomically.
pub async fn record_poll_run(pool: &SqlitePool, run: &PollRun) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO poll_runs (source_id, started_at, finished_at, status, retrieved, failed, stored)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(run.source_id)
    .bind(run.started_at.timestamp_millis())
    .bind(run.finished_at.timestamp_millis())
    .bind(run.status)
    .bind(run.retrieved)
    .bind(run.failed)
    .bind(run.stored)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE sources SET last_polled = ? WHERE id = ?")
        .bind(run.finished_at.timestamp())
        .bind(run.source_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(id)
}

/// Most recent poll runs, newest first, optionally for one source.
pub async fn recent_runs(
    pool: &SqlitePool,
    source_id: Option<i64>,
    limit: i64,
) -> Result<Vec<PollRun>> {
    let rows = sqlx::query(
        r#"
        SELECT source_id, started_at, finished_at, status, retrieved, failed, stored
        FROM poll_runs
        WHERE (? IS NULL OR source_id = ?)
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(source_id)
    .bind(source_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| PollRun {
            source_id: row.get("source_id"),
            started_at: from_millis(row.get("started_at")),
            finished_at: from_millis(row.get("finished_at")),
            status: row.get("status"),
            retrieved: row.get("retrieved"),
            failed: row.get("failed"),
            stored: row.get("stored"),
        })
        .collect())
}

/// `newsroom runs`: print the latest audit rows.
pub async fn run_runs(config: &Config, source_id: Option<i64>, limit: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let runs = recent_runs(&pool, source_id, limit).await?;

    println!(
        "{:<6} {:<20} {:>8} {:>9} {:>6} {:>6}  STATUS",
        "SOURCE", "STARTED", "ELAPSED", "RETRIEVED", "FAILED", "STORED"
    );
    for run in &runs {
        let elapsed = (run.finished_at - run.started_at).num_milliseconds() as f64 / 1000.0;
        println!(
            "{:<6} {:<20} {:>7.1}s {:>9} {:>6} {:>6}  {} ({})",
            run.source_id,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            elapsed,
            run.retrieved,
            run.failed,
            run.stored,
            run.status,
            describe_code(run.status)
        );
    }

    pool.close().await;
    Ok(())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;

    #[tokio::test]
    async fn test_record_appends_and_updates_last_polled() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        sqlx::query("INSERT INTO sources (id, url, language) VALUES (3, 'https://x/rss', 'it')")
            .execute(&pool)
            .await
            .unwrap();

        let started = Utc.with_ymd_and_hms(2024, 9, 30, 10, 0, 0).unwrap();
        let finished = Utc.with_ymd_and_hms(2024, 9, 30, 10, 0, 5).unwrap();
        for status in [200, -10] {
            record_poll_run(
                &pool,
                &PollRun {
                    source_id: 3,
                    started_at: started,
                    finished_at: finished,
                    status,
                    retrieved: 2,
                    failed: 1,
                    stored: 1,
                },
            )
            .await
            .unwrap();
        }

        let runs = recent_runs(&pool, Some(3), 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, -10);
        assert_eq!(runs[1].started_at, started);

        let last: Option<i64> = sqlx::query_scalar("SELECT last_polled FROM sources WHERE id = 3")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(last, Some(finished.timestamp()));
        assert!(recent_runs(&pool, Some(99), 10).await.unwrap().is_empty());
    }
}
