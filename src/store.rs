//! Storage gateway for articles.
//!
//! The `articles.url` UNIQUE constraint is the only authoritative guard
//! against storing a story twice. A violation surfaces as an `Err` which the
//! retriever counts as a failed entry. Both full-text tables index the
//! title and the markup-free content under the article's id.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::models::NewArticle;
use crate::normalize::clean_text;

#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Whether an article with exactly this URL is already stored.
    async fn url_exists(&self, url: &str) -> Result<bool>;

    /// Insert the article, returning its id.
    async fn store(&self, article: &NewArticle) -> Result<i64>;
}

pub struct SqliteArticleStore {
    pool: SqlitePool,
    canonical_language: String,
}

impl SqliteArticleStore {
    pub fn new(pool: SqlitePool, canonical_language: impl Into<String>) -> Self {
        Self {
            pool,
            canonical_language: canonical_language.into(),
        }
    }
}

#[async_trait]
impl ArticleStore for SqliteArticleStore {
    async fn url_exists(&self, url: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM articles WHERE url = ?")
            .bind(url)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn store(&self, article: &NewArticle) -> Result<i64> {
        // Non-canonical articles keep their text in the *_original columns
        // until a translation fills in the canonical ones
        let canonical = article.language == self.canonical_language;
        let (title, content, title_original, content_original) = if canonical {
            (Some(&article.title), Some(&article.content), None, None)
        } else {
            (None, None, Some(&article.title), Some(&article.content))
        };

        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO articles (url, stamp, author, title, content, title_original,
                                  content_original, language, source_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&article.url)
        .bind(article.stamp.timestamp())
        .bind(&article.author)
        .bind(title)
        .bind(content)
        .bind(title_original)
        .bind(content_original)
        .bind(&article.language)
        .bind(article.source_id)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to store article {}", article.url))?;

        let plain = clean_text(&article.content);
        for table in ["articles_fts", "articles_fts_simple"] {
            sqlx::query(&format!(
                "INSERT INTO {} (rowid, title, content) VALUES (?, ?, ?)",
                table
            ))
            .bind(id)
            .bind(&article.title)
            .bind(&plain)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use chrono::{TimeZone, Utc};
    use sqlx::Row;

    async fn pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        sqlx::query("INSERT INTO sources (id, url, language) VALUES (1, 'https://a/rss', 'it')")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    fn article(url: &str, language: &str) -> NewArticle {
        NewArticle {
            url: url.to_string(),
            stamp: Utc.with_ymd_and_hms(2024, 9, 30, 10, 0, 0).unwrap(),
            author: Some("Redazione".to_string()),
            title: "Titolo".to_string(),
            content: "<p>Testo dell'articolo</p>".to_string(),
            language: language.to_string(),
            source_id: 1,
        }
    }

    #[tokio::test]
    async fn test_canonical_language_fills_primary_fields() {
        let pool = pool().await;
        let store = SqliteArticleStore::new(pool.clone(), "it");
        let id = store.store(&article("https://a/1", "it")).await.unwrap();

        let row = sqlx::query("SELECT title, content, title_original FROM articles WHERE id = ?")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<Option<String>, _>("title").as_deref(), Some("Titolo"));
        assert!(row.get::<Option<String>, _>("title_original").is_none());
    }

    #[tokio::test]
    async fn test_other_language_fills_original_fields() {
        let pool = pool().await;
        let store = SqliteArticleStore::new(pool.clone(), "it");
        let id = store.store(&article("https://a/2", "en")).await.unwrap();

        let row = sqlx::query(
            "SELECT title, content, title_original, content_original FROM articles WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(row.get::<Option<String>, _>("title").is_none());
        assert!(row.get::<Option<String>, _>("content").is_none());
        assert_eq!(
            row.get::<Option<String>, _>("content_original").as_deref(),
            Some("<p>Testo dell'articolo</p>")
        );
    }

    #[tokio::test]
    async fn test_duplicate_url_is_an_error_not_a_panic() {
        let pool = pool().await;
        let store = SqliteArticleStore::new(pool.clone(), "it");
        store.store(&article("https://a/3", "it")).await.unwrap();
        assert!(store.url_exists("https://a/3").await.unwrap());
        assert!(store.store(&article("https://a/3", "it")).await.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
        let fts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles_fts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fts, 1);
    }

    #[tokio::test]
    async fn test_full_text_indexed_in_both_configurations() {
        let pool = pool().await;
        let store = SqliteArticleStore::new(pool.clone(), "it");
        let id = store.store(&article("https://a/4", "it")).await.unwrap();

        for table in ["articles_fts", "articles_fts_simple"] {
            let hit: Option<i64> = sqlx::query_scalar(&format!(
                "SELECT rowid FROM {} WHERE {} MATCH 'testo'",
                table, table
            ))
            .fetch_optional(&pool)
            .await
            .unwrap();
            assert_eq!(hit, Some(id));
        }

        // Markup is not indexed
        let tag: Option<i64> = sqlx::query_scalar(
            "SELECT rowid FROM articles_fts_simple WHERE articles_fts_simple MATCH 'p'",
        )
        .fetch_optional(&pool)
        .await
        .unwrap();
        assert!(tag.is_none());
    }
}
