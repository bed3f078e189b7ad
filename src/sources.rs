//! Source registry access.
//!
//! Sources live in the `sources` table. They are normally managed by an
//! administration tool, but can also be declared as `[[sources]]` entries in
//! the config file and upserted with `newsroom sources --sync`.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::error;

use crate::config::{Config, SourceConfig};
use crate::db;
use crate::frequency::FrequencySpec;
use crate::models::Source;

fn source_from_row(row: &SqliteRow) -> Source {
    let id: i64 = row.get("id");
    let mut active: bool = row.get("active");

    let frequency = match row.get::<Option<String>, _>("frequency") {
        Some(json) if !json.trim().is_empty() => match FrequencySpec::parse(&json) {
            Ok(spec) => Some(spec),
            Err(e) => {
                // Never poll on a schedule we cannot read
                error!(source_id = id, error = %e, "invalid frequency, source disabled for this run");
                active = false;
                None
            }
        },
        _ => None,
    };

    Source {
        id,
        url: row.get("url"),
        title: row.get("title"),
        language: row.get("language"),
        exclude: row.get("exclude"),
        cookies: row.get("cookies"),
        script: row.get("script"),
        frequency,
        active,
        incomplete: row.get("incomplete"),
        salt_url: row.get("salt_url"),
        premium: row.get("premium"),
        rating: row.get("rating"),
        last_polled: row
            .get::<Option<i64>, _>("last_polled")
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
    }
}

/// All registered sources, ascending by id, optionally restricted to one.
pub async fn load_sources(pool: &SqlitePool, only: Option<i64>) -> Result<Vec<Source>> {
    let rows = sqlx::query(
        r#"
        SELECT id, url, title, language, exclude, cookies, script, frequency, active,
               incomplete, salt_url, premium, rating, last_polled
        FROM sources
        WHERE (? IS NULL OR id = ?)
        ORDER BY id
        "#,
    )
    .bind(only)
    .bind(only)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(source_from_row).collect())
}

/// Insert or update the declared sources. `last_polled` is left untouched.
pub async fn sync_sources(pool: &SqlitePool, sources: &[SourceConfig]) -> Result<usize> {
    for s in sources {
        sqlx::query(
            r#"
            INSERT INTO sources (id, url, title, language, exclude, cookies, script, frequency,
                                 active, incomplete, salt_url, premium, rating)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                title = excluded.title,
                language = excluded.language,
                exclude = excluded.exclude,
                cookies = excluded.cookies,
                script = excluded.script,
                frequency = excluded.frequency,
                active = excluded.active,
                incomplete = excluded.incomplete,
                salt_url = excluded.salt_url,
                premium = excluded.premium,
                rating = excluded.rating
            "#,
        )
        .bind(s.id)
        .bind(&s.url)
        .bind(&s.title)
        .bind(&s.language)
        .bind(&s.exclude)
        .bind(&s.cookies)
        .bind(&s.script)
        .bind(s.frequency.as_ref().map(FrequencySpec::to_json))
        .bind(s.active)
        .bind(s.incomplete)
        .bind(s.salt_url)
        .bind(s.premium)
        .bind(s.rating)
        .execute(pool)
        .await?;
    }
    Ok(sources.len())
}

/// `newsroom sources`: optionally sync from config, then print the registry.
pub async fn run_sources(config: &Config, sync: bool) -> Result<()> {
    let pool = db::connect(config).await?;

    if sync {
        let n = sync_sources(&pool, &config.sources).await?;
        println!("synced {} sources from config", n);
    }

    let sources = load_sources(&pool, None).await?;
    println!(
        "{:<6} {:<8} {:<6} {:<10} {:<20} URL",
        "ID", "ACTIVE", "LANG", "KIND", "LAST POLLED"
    );
    for s in &sources {
        let kind = if s.script.is_some() {
            "script"
        } else if s.incomplete {
            "extract"
        } else {
            "feed"
        };
        let last = s
            .last_polled
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<6} {:<8} {:<6} {:<10} {:<20} {}",
            s.id, s.active, s.language, kind, last, s.url
        );
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;

    async fn pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        pool
    }

    fn declared(id: i64, url: &str) -> SourceConfig {
        SourceConfig {
            id,
            url: url.to_string(),
            title: format!("source {}", id),
            language: "en".to_string(),
            exclude: Some(".ad".to_string()),
            cookies: None,
            script: None,
            frequency: Some(FrequencySpec {
                hour: Some([6].into_iter().collect()),
                day: None,
                weekday: None,
            }),
            active: true,
            incomplete: false,
            salt_url: true,
            premium: false,
            rating: 2,
        }
    }

    #[tokio::test]
    async fn test_sync_then_load_ordered_by_id() {
        let pool = pool().await;
        sync_sources(&pool, &[declared(5, "https://b/rss"), declared(2, "https://a/rss")])
            .await
            .unwrap();
        // Second sync updates in place
        sync_sources(&pool, &[declared(5, "https://b/feed")]).await.unwrap();

        let sources = load_sources(&pool, None).await.unwrap();
        assert_eq!(sources.iter().map(|s| s.id).collect::<Vec<_>>(), vec![2, 5]);
        assert_eq!(sources[1].url, "https://b/feed");
        assert!(sources[1].salt_url);
        assert_eq!(sources[1].exclude.as_deref(), Some(".ad"));
        assert_eq!(
            sources[1].frequency.as_ref().and_then(|f| f.hour.clone()),
            Some([6].into_iter().collect())
        );

        let only = load_sources(&pool, Some(2)).await.unwrap();
        assert_eq!(only.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_frequency_disables_source() {
        let pool = pool().await;
        sqlx::query(
            "INSERT INTO sources (id, url, language, frequency) VALUES (9, 'https://x', 'it', '{\"hour\": \"noon\"}')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let sources = load_sources(&pool, None).await.unwrap();
        assert!(!sources[0].active);
        assert!(sources[0].frequency.is_none());
    }
}
