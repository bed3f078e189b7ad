//! Batch embedding of stored articles.
//!
//! Articles without a vector for the configured model are embedded in
//! ascending id order, in fixed-size batches, starting above the floor
//! stored in `checkpoints` under `embed:<model>`. The floor advances after
//! each committed batch; a failing batch ends the run so that the next run
//! resumes exactly where this one stopped.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use tracing::{error, info};

use crate::config::Config;
use crate::db;
use crate::embedding::{self, Embedder};
use crate::normalize::clean_text;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct EmbedSummary {
    pub embedded: usize,
    pub failed: usize,
    pub floor: i64,
}

struct PendingArticle {
    id: i64,
    text: String,
}

fn checkpoint_key(model: &str) -> String {
    format!("embed:{}", model)
}

/// Text embedded for an article: `title - plain content`.
pub fn article_text(title: &str, content: &str) -> String {
    format!("{} - {}", title, clean_text(content))
}

async fn find_pending(
    pool: &SqlitePool,
    model: &str,
    canonical_language: &str,
    floor: i64,
    limit: usize,
) -> Result<Vec<PendingArticle>> {
    let rows = sqlx::query(
        r#"
        SELECT a.id,
               CASE WHEN a.language = ? THEN a.title ELSE a.title_original END AS title,
               CASE WHEN a.language = ? THEN a.content ELSE a.content_original END AS content
        FROM articles a
        LEFT JOIN article_embeddings e ON e.article_id = a.id AND e.model = ?
        WHERE a.id > ? AND e.article_id IS NULL
        ORDER BY a.id
        LIMIT ?
        "#,
    )
    .bind(canonical_language)
    .bind(canonical_language)
    .bind(model)
    .bind(floor)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let title: Option<String> = row.get("title");
            let content: Option<String> = row.get("content");
            PendingArticle {
                id: row.get("id"),
                text: article_text(
                    title.as_deref().unwrap_or(""),
                    content.as_deref().unwrap_or(""),
                ),
            }
        })
        .collect())
}

async fn store_batch(
    pool: &SqlitePool,
    model: &str,
    dims: usize,
    batch: &[PendingArticle],
    vectors: &[Vec<f32>],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    for (article, vector) in batch.iter().zip(vectors) {
        sqlx::query(
            r#"
            INSERT INTO article_embeddings (article_id, model, dims, embedding, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(article_id, model) DO UPDATE SET
                dims = excluded.dims,
                embedding = excluded.embedding,
                created_at = excluded.created_at
            "#,
        )
        .bind(article.id)
        .bind(model)
        .bind(dims as i64)
        .bind(embedding::vec_to_blob(vector))
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Embed up to `limit` pending articles.
pub async fn embed_pending(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    canonical_language: &str,
    batch_size: usize,
    limit: Option<usize>,
) -> Result<EmbedSummary> {
    let model = embedder.model_name().to_string();
    let key = checkpoint_key(&model);
    let mut summary = EmbedSummary {
        floor: db::get_checkpoint(pool, &key).await?.unwrap_or(0),
        ..Default::default()
    };
    let mut remaining = limit.unwrap_or(usize::MAX);
    let batch_size = batch_size.max(1);

    while remaining > 0 {
        let take = batch_size.min(remaining);
        let batch = find_pending(pool, &model, canonical_language, summary.floor, take).await?;
        if batch.is_empty() {
            break;
        }

        let texts: Vec<String> = batch.iter().map(|a| a.text.clone()).collect();
        let vectors = match embedder.embed(&texts).await {
            Ok(v) if v.len() == batch.len() => v,
            Ok(v) => {
                error!(expected = batch.len(), got = v.len(), "embedding batch size mismatch");
                summary.failed += batch.len();
                break;
            }
            Err(e) => {
                error!(floor = summary.floor, error = %e, "embedding batch failed");
                summary.failed += batch.len();
                break;
            }
        };

        store_batch(pool, &model, embedder.dims(), &batch, &vectors).await?;
        summary.embedded += batch.len();
        remaining -= batch.len();
        if let Some(last) = batch.last() {
            summary.floor = last.id;
            db::set_checkpoint(pool, &key, summary.floor).await?;
        }
        info!(embedded = summary.embedded, floor = summary.floor, "embedding batch stored");

        if batch.len() < take {
            break;
        }
    }

    Ok(summary)
}

/// `newsroom embed pending`.
pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let embedder = embedding::create_embedder(&config.embedding)?;
    let pool = db::connect(config).await?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);

    let summary = embed_pending(
        &pool,
        embedder.as_ref(),
        &config.poller.canonical_language,
        batch_size,
        limit,
    )
    .await?;

    println!("embed pending");
    println!("  model: {}", embedder.model_name());
    println!("  embedded: {}", summary.embedded);
    println!("  failed: {}", summary.failed);
    println!("  floor: {}", summary.floor);

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::FixedEmbedder;
    use crate::migrate::migrate_pool;
    use async_trait::async_trait;
    use std::collections::HashMap;

    async fn seeded(n: i64) -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        sqlx::query("INSERT INTO sources (id, url, language) VALUES (1, 'https://s', 'it')")
            .execute(&pool)
            .await
            .unwrap();
        for i in 1..=n {
            let (lang, title, title_original) = if i % 2 == 0 {
                ("it", Some(format!("Titolo {}", i)), None)
            } else {
                ("en", None, Some(format!("Title {}", i)))
            };
            sqlx::query(
                r#"INSERT INTO articles (url, stamp, title, content, title_original, content_original, language, source_id)
                   VALUES (?, 0, ?, '<p>corpo</p>', ?, '<p>body &amp; more</p>', ?, 1)"#,
            )
            .bind(format!("https://a/{}", i))
            .bind(title)
            .bind(title_original)
            .bind(lang)
            .execute(&pool)
            .await
            .unwrap();
        }
        pool
    }

    fn embedder() -> FixedEmbedder {
        FixedEmbedder {
            vectors: HashMap::new(),
            dims: 3,
        }
    }

    #[test]
    fn test_article_text_strips_markup() {
        assert_eq!(article_text("T", "<p>a &amp; <b>b</b></p>"), "T - a & b");
    }

    #[tokio::test]
    async fn test_embeds_in_batches_and_advances_floor() {
        let pool = seeded(5).await;
        let summary = embed_pending(&pool, &embedder(), "it", 2, None).await.unwrap();
        assert_eq!(summary.embedded, 5);
        assert_eq!(summary.floor, 5);

        let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM article_embeddings WHERE model = 'fixed'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(stored, 5);

        // Nothing left on a second run
        let again = embed_pending(&pool, &embedder(), "it", 2, None).await.unwrap();
        assert_eq!(again.embedded, 0);
        assert_eq!(again.floor, 5);
    }

    #[tokio::test]
    async fn test_limit_respected() {
        let pool = seeded(5).await;
        let summary = embed_pending(&pool, &embedder(), "it", 2, Some(3)).await.unwrap();
        assert_eq!(summary.embedded, 3);
        assert_eq!(summary.floor, 3);
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            bail!("service unavailable")
        }
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_floor() {
        let pool = seeded(3).await;
        embed_pending(&pool, &embedder(), "it", 2, Some(2)).await.unwrap();

        let summary = embed_pending(&pool, &FailingEmbedder, "it", 2, None).await.unwrap();
        assert_eq!(summary.embedded, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(db::get_checkpoint(&pool, "embed:fixed").await.unwrap(), Some(2));
    }
}
