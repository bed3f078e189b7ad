//! End-to-end poll runs against an in-process HTTP server.

use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::net::SocketAddr;
use tempfile::TempDir;

use newsroom::audit::recent_runs;
use newsroom::config::{Config, SourceConfig};
use newsroom::db;
use newsroom::migrate::migrate_pool;
use newsroom::poll::Poller;
use newsroom::script::ProcessScriptRunner;
use newsroom::sources::sync_sources;
use newsroom::store::SqliteArticleStore;

const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/">
<channel>
  <title>Test</title>
  <link>http://example.org/</link>
  <description>Test feed</description>
  <item>
    <title>Primo titolo</title>
    <link>http://example.org/a/1</link>
    <description>&lt;p&gt;Uno&lt;/p&gt;</description>
    <pubDate>Mon, 30 Sep 2024 10:00:00 +0000</pubDate>
  </item>
  <item>
    <title>Secondo &lt;b&gt;titolo&lt;/b&gt;</title>
    <link>http://example.org/a/2</link>
    <content:encoded><![CDATA[<div>Due <script>track()</script><a href="/x">link</a></div>]]></content:encoded>
    <pubDate>Mon, 30 Sep 2024 09:00:00 +0000</pubDate>
  </item>
  <item>
    <title>Primo titolo (again)</title>
    <link>http://example.org/a/1</link>
    <description>repeat</description>
  </item>
  <item>
    <title>Vuoto</title>
    <link>http://example.org/a/3</link>
  </item>
</channel>
</rss>"#;

fn incomplete_feed(addr: SocketAddr) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
<channel>
  <title>Partial</title>
  <link>http://{addr}/</link>
  <description>Summaries only</description>
  <item>
    <title>Pagina</title>
    <link>http://{addr}/page/1</link>
    <description>teaser</description>
    <pubDate>Mon, 30 Sep 2024 08:00:00 +0000</pubDate>
  </item>
</channel>
</rss>"#
    )
}

async fn serve() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let partial = incomplete_feed(addr);

    let app = Router::new()
        .route("/rss", get(|| async { FEED }))
        .route("/partial", get(move || async move { partial }))
        .route(
            "/page/1",
            get(|| async { "<html><body><script>x()</script><article>Full story</article></body></html>" }),
        )
        .route(
            "/extract",
            post(|Query(q): Query<HashMap<String, String>>, body: String| async move {
                if !body.contains("Full story") || body.contains("x()") {
                    return (StatusCode::BAD_REQUEST, String::new());
                }
                let href = q.get("href").cloned().unwrap_or_default();
                (StatusCode::OK, format!("<div><p>Extracted from {}</p></div>", href))
            }),
        )
        .route("/broken", get(|| async { "this is not a feed" }))
        .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "gone") }));

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn source(id: i64, url: String) -> SourceConfig {
    SourceConfig {
        id,
        url,
        title: String::new(),
        language: "it".to_string(),
        exclude: None,
        cookies: None,
        script: None,
        frequency: None,
        active: true,
        incomplete: false,
        salt_url: false,
        premium: false,
        rating: 0,
    }
}

async fn setup(addr: SocketAddr, tmp: &TempDir) -> (Config, SqlitePool) {
    let mut config = Config::minimal(tmp.path().join("newsroom.sqlite"));
    config.poller.extraction_url = format!("http://{}/extract", addr);
    config.poller.feed_timeout_secs = 5;
    config.poller.entry_timeout_secs = 5;

    let pool = db::connect(&config).await.unwrap();
    migrate_pool(&pool).await.unwrap();
    (config, pool)
}

async fn article_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM articles")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_feed_poll_stores_and_is_idempotent() {
    let addr = serve().await;
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(addr, &tmp).await;
    sync_sources(&pool, &[source(1, format!("http://{}/rss", addr))])
        .await
        .unwrap();

    let store = SqliteArticleStore::new(pool.clone(), "it");
    let scripts = ProcessScriptRunner;
    let poller = Poller::new(&config.poller, pool.clone(), &store, &scripts);

    let first = poller.poll_all(None).await.unwrap();
    assert_eq!(first.polled, 1);
    assert_eq!(first.counts.stored, 2);
    assert_eq!(first.counts.failed, 1);
    assert_eq!(first.counts.retrieved, 2);
    assert_eq!(article_count(&pool).await, 2);

    let (title, content): (String, String) =
        sqlx::query_as("SELECT title, content FROM articles WHERE url = 'http://example.org/a/2'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(title, "Secondo titolo");
    assert!(!content.contains("script"));
    assert!(content.contains(r#"href="http://example.org/x""#), "{}", content);

    let stamp: i64 =
        sqlx::query_scalar("SELECT stamp FROM articles WHERE url = 'http://example.org/a/1'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(stamp, 1727690400);

    let second = poller.poll_all(None).await.unwrap();
    assert_eq!(second.counts.stored, 0);
    assert_eq!(article_count(&pool).await, 2);

    let runs = recent_runs(&pool, Some(1), 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == 200));
    assert_eq!(runs[1].stored, 2);
}

#[tokio::test]
async fn test_incomplete_source_goes_through_extraction() {
    let addr = serve().await;
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(addr, &tmp).await;
    let mut partial = source(2, format!("http://{}/partial", addr));
    partial.incomplete = true;
    sync_sources(&pool, &[partial]).await.unwrap();

    let store = SqliteArticleStore::new(pool.clone(), "it");
    let scripts = ProcessScriptRunner;
    let poller = Poller::new(&config.poller, pool.clone(), &store, &scripts);

    let summary = poller.poll_all(Some(2)).await.unwrap();
    assert_eq!(summary.counts.stored, 1, "{:?}", summary);

    let content: String = sqlx::query_scalar("SELECT content FROM articles WHERE source_id = 2")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(
        content,
        format!("<p>Extracted from http://{}/page/1</p>", addr)
    );
}

#[tokio::test]
async fn test_failures_are_recorded_with_status() {
    let addr = serve().await;
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(addr, &tmp).await;
    sync_sources(
        &pool,
        &[
            source(3, format!("http://{}/broken", addr)),
            source(4, format!("http://{}/missing", addr)),
        ],
    )
    .await
    .unwrap();

    let store = SqliteArticleStore::new(pool.clone(), "it");
    let scripts = ProcessScriptRunner;
    let poller = Poller::new(&config.poller, pool.clone(), &store, &scripts);

    let summary = poller.poll_all(None).await.unwrap();
    assert_eq!(summary.polled, 2);
    assert_eq!(summary.unsuccessful, 2);

    let broken = recent_runs(&pool, Some(3), 1).await.unwrap();
    assert_eq!(broken[0].status, -5);
    let missing = recent_runs(&pool, Some(4), 1).await.unwrap();
    assert_eq!(missing[0].status, 404);
    assert_eq!(article_count(&pool).await, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_script_source_reports_counts() {
    use std::os::unix::fs::PermissionsExt;

    let addr = serve().await;
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(addr, &tmp).await;

    let script = tmp.path().join("legacy.sh");
    std::fs::write(&script, "#!/bin/sh\necho 'working...'\necho '4 1 3'\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut legacy = source(5, "https://legacy.example.net/".to_string());
    legacy.script = Some(script.display().to_string());
    sync_sources(&pool, &[legacy]).await.unwrap();

    let store = SqliteArticleStore::new(pool.clone(), "it");
    let scripts = ProcessScriptRunner;
    let poller = Poller::new(&config.poller, pool.clone(), &store, &scripts);
    poller.poll_all(Some(5)).await.unwrap();

    let runs = recent_runs(&pool, Some(5), 1).await.unwrap();
    assert_eq!(runs[0].status, 200);
    assert_eq!((runs[0].retrieved, runs[0].failed, runs[0].stored), (4, 1, 3));
}
