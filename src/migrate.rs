use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Source registry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY,
            url TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            language TEXT NOT NULL,
            exclude TEXT,
            cookies TEXT,
            script TEXT,
            frequency TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            incomplete INTEGER NOT NULL DEFAULT 0,
            salt_url INTEGER NOT NULL DEFAULT 0,
            premium INTEGER NOT NULL DEFAULT 0,
            rating INTEGER NOT NULL DEFAULT 0,
            last_polled INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Articles: the url constraint is the only storage-time dedup guard
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS articles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE,
            stamp INTEGER NOT NULL,
            author TEXT,
            title TEXT,
            content TEXT,
            title_original TEXT,
            content_original TEXT,
            language TEXT NOT NULL,
            source_id INTEGER NOT NULL,
            views INTEGER NOT NULL DEFAULT 0,
            rating REAL NOT NULL DEFAULT 0,
            FOREIGN KEY (source_id) REFERENCES sources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS article_embeddings (
            article_id INTEGER NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (article_id, model),
            FOREIGN KEY (article_id) REFERENCES articles(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS poll_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            status INTEGER NOT NULL,
            retrieved INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            stored INTEGER NOT NULL,
            FOREIGN KEY (source_id) REFERENCES sources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            job TEXT PRIMARY KEY,
            cursor INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Subscribers and their preferences (owned by the account collaborator;
    // read-only here except for the materialized lists)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscribers (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            languages TEXT NOT NULL DEFAULT '[]',
            whitelist TEXT NOT NULL DEFAULT '[]',
            blacklist TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscriber_sources (
            subscriber_id INTEGER NOT NULL,
            source_id INTEGER NOT NULL,
            rating INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (subscriber_id, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscriber_articles (
            subscriber_id INTEGER NOT NULL,
            article_id INTEGER NOT NULL,
            read INTEGER NOT NULL DEFAULT 0,
            rating INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (subscriber_id, article_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS article_lists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subscriber_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            automatic INTEGER NOT NULL DEFAULT 0,
            UNIQUE (subscriber_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS article_list_items (
            list_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            article_id INTEGER NOT NULL,
            PRIMARY KEY (list_id, position),
            FOREIGN KEY (list_id) REFERENCES article_lists(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Two full-text configurations over title + content: stemmed and simple.
    // FTS5 CREATE is not idempotent natively, so we check first
    for (name, tokenizer) in [
        ("articles_fts", "porter unicode61"),
        ("articles_fts_simple", "unicode61"),
    ] {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?",
        )
        .bind(name)
        .fetch_one(pool)
        .await?;

        if !exists {
            sqlx::query(&format!(
                "CREATE VIRTUAL TABLE {} USING fts5(title, content, tokenize = '{}')",
                name, tokenizer
            ))
            .execute(pool)
            .await?;
        }
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_stamp ON articles(stamp DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_source ON articles(source_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_poll_runs_source ON poll_runs(source_id, started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
