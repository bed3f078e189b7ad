//! Personalized ranking.
//!
//! Two variants materialize a per-subscriber article list, fully replaced on
//! every run:
//!
//! - **pool** (`ranking.list_name`, default `newsfeed`): recent articles
//!   minus muted sources, restricted to the subscriber's languages, minus
//!   blacklist full-text matches; when a whitelist is set the pool is first
//!   ordered by embedding distance to the whitelist text and truncated to
//!   `whitelist_top_n`. The rest is sorted by recency and capped.
//! - **score** (`ranking.scored_list_name`, default `ranked`): unread
//!   articles matching the whitelist (either full-text configuration) and
//!   not the blacklist, ordered by [`composite_score`]. The candidate set
//!   is filtered in SQL; the score is computed and sorted in Rust, since
//!   SQLite has no portable `pow`.
//!
//! Both are deterministic for a fixed corpus, preferences and `now`.
//! Subscribers are processed in ascending id in chunks, with the last
//! completed id checkpointed as `rank:<variant>`.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{error, info, warn};

use crate::config::{Config, RankingConfig};
use crate::db;
use crate::embedding::{self, blob_to_vec, cosine_distance, Embedder};
use crate::models::Subscriber;

/// Lowest decay exponent; reached when both ratings are at their minimum.
const MIN_DECAY_EXPONENT: f64 = 0.5;
const BASE_DECAY_EXPONENT: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RankVariant {
    Pool,
    Score,
}

impl fmt::Display for RankVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RankVariant::Pool => write!(f, "pool"),
            RankVariant::Score => write!(f, "score"),
        }
    }
}

/// Signals feeding the composite score of one article.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: i64,
    pub stamp: i64,
    pub views: i64,
    pub crowd_rating: f64,
    pub premium: bool,
    /// The subscriber's rating of the article's source.
    pub subscriber_rating: i64,
    /// The source's own rating override.
    pub feed_rating: i64,
    /// Articles the source published within the lookback window.
    pub cadence_count: i64,
}

/// `(1 + 10·(views + crowd) + 10·max(0, sub + premium + feed))
///  / max(1, age / cadence_norm)^exp`
///
/// `cadence_norm` is the source's average spacing between articles over the
/// lookback window, so prolific sources decay faster. The exponent starts at
/// 1.5 and is lowered by negative ratings.
pub fn composite_score(c: &Candidate, now: i64, lookback_secs: f64, premium_bonus: f64) -> f64 {
    let bonus = if c.premium { premium_bonus } else { 0.0 };
    let preference = (c.subscriber_rating as f64 + bonus + c.feed_rating as f64).max(0.0);
    let numerator = 1.0 + 10.0 * (c.views as f64 + c.crowd_rating) + 10.0 * preference;

    let cadence_norm = lookback_secs / c.cadence_count.max(1) as f64;
    let age = (now - c.stamp).max(0) as f64;
    let penalty = 0.1 * ((c.subscriber_rating + c.feed_rating).min(0) as f64);
    let exponent = (BASE_DECAY_EXPONENT + penalty).max(MIN_DECAY_EXPONENT);

    numerator / (age / cadence_norm).max(1.0).powf(exponent)
}

/// Build an FTS5 query that matches any of the terms, each as a phrase.
pub fn fts_any(terms: &[String]) -> Option<String> {
    let quoted: Vec<String> = terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if quoted.is_empty() {
        None
    } else {
        Some(quoted.join(" OR "))
    }
}

fn parse_terms(subscriber_id: i64, field: &str, json: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(json) {
        Ok(terms) => terms,
        Err(e) => {
            warn!(subscriber_id, field, error = %e, "ignoring malformed preference list");
            Vec::new()
        }
    }
}

/// Subscribers with id greater than `after`, ascending.
pub async fn load_subscribers(pool: &SqlitePool, after: i64, limit: usize) -> Result<Vec<Subscriber>> {
    let rows = sqlx::query(
        "SELECT id, name, languages, whitelist, blacklist FROM subscribers WHERE id > ? ORDER BY id LIMIT ?",
    )
    .bind(after)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let id: i64 = row.get("id");
            Subscriber {
                id,
                name: row.get("name"),
                languages: parse_terms(id, "languages", row.get("languages")),
                whitelist: parse_terms(id, "whitelist", row.get("whitelist")),
                blacklist: parse_terms(id, "blacklist", row.get("blacklist")),
            }
        })
        .collect())
}

pub async fn load_subscriber(pool: &SqlitePool, id: i64) -> Result<Option<Subscriber>> {
    Ok(load_subscribers(pool, id - 1, 1)
        .await?
        .into_iter()
        .find(|s| s.id == id))
}

/// Replace the membership of the subscriber's list `name`, creating it if needed.
pub async fn replace_list(
    pool: &SqlitePool,
    subscriber_id: i64,
    name: &str,
    article_ids: &[i64],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO article_lists (subscriber_id, name, automatic) VALUES (?, ?, 1)
        ON CONFLICT(subscriber_id, name) DO NOTHING
        "#,
    )
    .bind(subscriber_id)
    .bind(name)
    .execute(&mut *tx)
    .await?;

    let list_id: i64 =
        sqlx::query_scalar("SELECT id FROM article_lists WHERE subscriber_id = ? AND name = ?")
            .bind(subscriber_id)
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;

    sqlx::query("DELETE FROM article_list_items WHERE list_id = ?")
        .bind(list_id)
        .execute(&mut *tx)
        .await?;

    for (position, article_id) in article_ids.iter().enumerate() {
        sqlx::query("INSERT INTO article_list_items (list_id, position, article_id) VALUES (?, ?, ?)")
            .bind(list_id)
            .bind(position as i64)
            .bind(article_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Ordered membership of a subscriber's list.
pub async fn list_articles(pool: &SqlitePool, subscriber_id: i64, name: &str) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(
        r#"
        SELECT i.article_id
        FROM article_list_items i
        JOIN article_lists l ON l.id = i.list_id
        WHERE l.subscriber_id = ? AND l.name = ?
        ORDER BY i.position
        "#,
    )
    .bind(subscriber_id)
    .bind(name)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

pub struct Ranker<'a> {
    pool: &'a SqlitePool,
    config: &'a RankingConfig,
    embedder: &'a dyn Embedder,
    now: DateTime<Utc>,
}

impl<'a> Ranker<'a> {
    pub fn new(
        pool: &'a SqlitePool,
        config: &'a RankingConfig,
        embedder: &'a dyn Embedder,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            pool,
            config,
            embedder,
            now,
        }
    }

    fn window_start(&self) -> i64 {
        (self.now - Duration::days(self.config.lookback_days)).timestamp()
    }

    fn lookback_secs(&self) -> f64 {
        (self.config.lookback_days * 86_400) as f64
    }

    pub async fn rank(&self, variant: RankVariant, subscriber: &Subscriber) -> Result<Vec<i64>> {
        let (ids, name) = match variant {
            RankVariant::Pool => (self.pool_ranking(subscriber).await?, &self.config.list_name),
            RankVariant::Score => (
                self.score_ranking(subscriber).await?,
                &self.config.scored_list_name,
            ),
        };
        replace_list(self.pool, subscriber.id, name, &ids).await?;
        Ok(ids)
    }

    /// Candidate pool ordered by recency, capped.
    pub async fn pool_ranking(&self, subscriber: &Subscriber) -> Result<Vec<i64>> {
        let blacklist = fts_any(&subscriber.blacklist);
        let mut sql = String::from(
            r#"
            SELECT a.id, a.stamp, a.language
            FROM articles a
            WHERE a.stamp >= ?
              AND a.source_id NOT IN (
                  SELECT source_id FROM subscriber_sources
                  WHERE subscriber_id = ? AND rating <= ?)
            "#,
        );
        if blacklist.is_some() {
            sql.push_str(
                " AND a.id NOT IN (SELECT rowid FROM articles_fts_simple WHERE articles_fts_simple MATCH ?)",
            );
        }

        let mut query = sqlx::query(&sql)
            .bind(self.window_start())
            .bind(subscriber.id)
            .bind(self.config.min_source_rating);
        if let Some(q) = &blacklist {
            query = query.bind(q);
        }
        let rows = query.fetch_all(self.pool).await?;

        let languages: HashSet<&str> = subscriber.languages.iter().map(String::as_str).collect();
        let mut candidates: Vec<(i64, i64)> = rows
            .iter()
            .filter(|row| {
                languages.is_empty() || languages.contains(row.get::<String, _>("language").as_str())
            })
            .map(|row| (row.get("id"), row.get("stamp")))
            .collect();

        let whitelist: Vec<&String> = subscriber
            .whitelist
            .iter()
            .filter(|t| !t.trim().is_empty())
            .collect();
        if !whitelist.is_empty() {
            if !self.embedder.is_enabled() {
                warn!(subscriber_id = subscriber.id, "embeddings disabled, whitelist ordering skipped");
            } else {
                let text = whitelist
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                let target = embedding::embed_one(self.embedder, &text).await?;
                candidates = self.closest(candidates, &target).await?;
            }
        }

        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
        candidates.truncate(self.config.cap);
        Ok(candidates.into_iter().map(|(id, _)| id).collect())
    }

    /// Order by cosine distance to `target` (articles without a vector last)
    /// and keep the top N.
    async fn closest(&self, candidates: Vec<(i64, i64)>, target: &[f32]) -> Result<Vec<(i64, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT e.article_id, e.embedding
            FROM article_embeddings e
            JOIN articles a ON a.id = e.article_id
            WHERE e.model = ? AND a.stamp >= ?
            "#,
        )
        .bind(self.embedder.model_name())
        .bind(self.window_start())
        .fetch_all(self.pool)
        .await?;

        let vectors: HashMap<i64, Vec<f32>> = rows
            .iter()
            .map(|row| (row.get("article_id"), blob_to_vec(&row.get::<Vec<u8>, _>("embedding"))))
            .collect();

        let mut scored: Vec<(f64, (i64, i64))> = candidates
            .into_iter()
            .map(|c| {
                let distance = vectors
                    .get(&c.0)
                    .map(|v| cosine_distance(v, target))
                    .unwrap_or(f64::INFINITY);
                (distance, c)
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(b.1 .0.cmp(&a.1 .0)));
        scored.truncate(self.config.whitelist_top_n);
        Ok(scored.into_iter().map(|(_, c)| c).collect())
    }

    /// Unread whitelist matches ordered by composite score.
    pub async fn score_ranking(&self, subscriber: &Subscriber) -> Result<Vec<i64>> {
        let whitelist = fts_any(&subscriber.whitelist);
        let blacklist = fts_any(&subscriber.blacklist);
        let window_start = self.window_start();

        let mut sql = String::from(
            r#"
            SELECT a.id, a.stamp, a.views, a.rating AS crowd_rating, s.premium,
                   COALESCE(ss.rating, 0) AS subscriber_rating, s.rating AS feed_rating,
                   (SELECT COUNT(*) FROM articles c
                    WHERE c.source_id = a.source_id AND c.stamp >= ?) AS cadence_count
            FROM articles a
            JOIN sources s ON s.id = a.source_id
            LEFT JOIN subscriber_sources ss
                   ON ss.source_id = a.source_id AND ss.subscriber_id = ?
            LEFT JOIN subscriber_articles sa
                   ON sa.article_id = a.id AND sa.subscriber_id = ?
            WHERE a.stamp >= ?
              AND COALESCE(sa.read, 0) = 0
            "#,
        );
        if whitelist.is_some() {
            sql.push_str(
                r#" AND (a.id IN (SELECT rowid FROM articles_fts WHERE articles_fts MATCH ?)
                     OR a.id IN (SELECT rowid FROM articles_fts_simple WHERE articles_fts_simple MATCH ?))"#,
            );
        }
        if blacklist.is_some() {
            sql.push_str(
                " AND a.id NOT IN (SELECT rowid FROM articles_fts_simple WHERE articles_fts_simple MATCH ?)",
            );
        }

        let mut query = sqlx::query(&sql)
            .bind(window_start)
            .bind(subscriber.id)
            .bind(subscriber.id)
            .bind(window_start);
        if let Some(q) = &whitelist {
            query = query.bind(q).bind(q);
        }
        if let Some(q) = &blacklist {
            query = query.bind(q);
        }
        let rows = query.fetch_all(self.pool).await?;

        let now = self.now.timestamp();
        let lookback = self.lookback_secs();
        let mut scored: Vec<(f64, i64, i64)> = rows
            .iter()
            .map(|row| {
                let c = Candidate {
                    id: row.get("id"),
                    stamp: row.get("stamp"),
                    views: row.get("views"),
                    crowd_rating: row.get("crowd_rating"),
                    premium: row.get("premium"),
                    subscriber_rating: row.get("subscriber_rating"),
                    feed_rating: row.get("feed_rating"),
                    cadence_count: row.get("cadence_count"),
                };
                (
                    composite_score(&c, now, lookback, self.config.premium_bonus),
                    c.stamp,
                    c.id,
                )
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(b.1.cmp(&a.1))
                .then(b.2.cmp(&a.2))
        });
        scored.truncate(self.config.score_limit);
        Ok(scored.into_iter().map(|(_, _, id)| id).collect())
    }
}

#[derive(Debug, Default)]
pub struct RankSummary {
    pub ranked: usize,
    pub failed: usize,
}

/// Rank every subscriber above the floor, checkpointing after each chunk.
pub async fn rank_all(
    ranker: &Ranker<'_>,
    variant: RankVariant,
    from: Option<i64>,
) -> Result<RankSummary> {
    let key = format!("rank:{}", variant);
    let mut floor = match from {
        Some(f) => f,
        None => db::get_checkpoint(ranker.pool, &key).await?.unwrap_or(0),
    };
    let mut summary = RankSummary::default();

    loop {
        let batch = load_subscribers(ranker.pool, floor, ranker.config.subscriber_batch).await?;
        if batch.is_empty() {
            // Completed pass: the next run starts over
            db::set_checkpoint(ranker.pool, &key, 0).await?;
            break;
        }

        for subscriber in &batch {
            match ranker.rank(variant, subscriber).await {
                Ok(ids) => {
                    info!(subscriber_id = subscriber.id, %variant, articles = ids.len(), "subscriber ranked");
                    summary.ranked += 1;
                }
                Err(e) => {
                    error!(subscriber_id = subscriber.id, %variant, error = %e, "ranking failed");
                    summary.failed += 1;
                }
            }
        }

        if let Some(last) = batch.last() {
            floor = last.id;
            db::set_checkpoint(ranker.pool, &key, floor).await?;
        }
    }

    Ok(summary)
}

/// `newsroom rank`.
pub async fn run_rank(
    config: &Config,
    variant: RankVariant,
    subscriber: Option<i64>,
    from: Option<i64>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let embedder = embedding::create_embedder(&config.embedding)?;
    let ranker = Ranker::new(&pool, &config.ranking, embedder.as_ref(), Utc::now());

    println!("rank {}", variant);
    match subscriber {
        Some(id) => match load_subscriber(&pool, id).await? {
            Some(s) => {
                let ids = ranker.rank(variant, &s).await?;
                println!("  subscriber: {}", id);
                println!("  articles: {}", ids.len());
            }
            None => anyhow::bail!("No subscriber with id {}", id),
        },
        None => {
            let summary = rank_all(&ranker, variant, from).await?;
            println!("  ranked: {}", summary.ranked);
            println!("  failed: {}", summary.failed);
        }
    }

    pool.close().await;
    Ok(())
}
