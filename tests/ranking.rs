use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

use newsroom::config::{Config, RankingConfig};
use newsroom::db;
use newsroom::embedding::DisabledEmbedder;
use newsroom::migrate::migrate_pool;
use newsroom::models::NewArticle;
use newsroom::rank::{list_articles, rank_all, RankVariant, Ranker};
use newsroom::store::{ArticleStore, SqliteArticleStore};

#[tokio::test]
async fn test_ranking_is_deterministic_for_fixed_inputs() {
    let tmp = TempDir::new().unwrap();
    let config = Config::minimal(tmp.path().join("newsroom.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate_pool(&pool).await.unwrap();

    sqlx::query(
        "INSERT INTO sources (id, url, language, premium, rating) VALUES (1, 'https://a/rss', 'it', 1, 0), (2, 'https://b/rss', 'it', 0, -1)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        r#"INSERT INTO subscribers (id, name, languages, whitelist, blacklist) VALUES
           (1, 'anna', '["it"]', '["elezioni"]', '[]'),
           (2, 'bruno', '[]', '[]', '["meteo"]')"#,
    )
    .execute(&pool)
    .await
    .unwrap();

    let now = Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap();
    let store = SqliteArticleStore::new(pool.clone(), "it");
    let titles = [
        "Elezioni regionali",
        "Meteo del weekend",
        "Elezioni, i risultati",
        "Borsa in rialzo",
        "Nuove elezioni in vista",
        "Meteo: allerta",
    ];
    for (i, title) in titles.iter().enumerate() {
        store
            .store(&NewArticle {
                url: format!("https://a/{}", i),
                stamp: now - Duration::hours(6 * i as i64 + 1),
                author: None,
                title: title.to_string(),
                content: format!("<p>{}</p>", title),
                language: "it".to_string(),
                source_id: 1 + (i as i64 % 2),
            })
            .await
            .unwrap();
    }

    let ranking = RankingConfig::default();
    let mut runs = Vec::new();
    for _ in 0..2 {
        let ranker = Ranker::new(&pool, &ranking, &DisabledEmbedder, now);
        for variant in [RankVariant::Pool, RankVariant::Score] {
            let summary = rank_all(&ranker, variant, None).await.unwrap();
            assert_eq!(summary.ranked, 2);
        }
        let mut lists = Vec::new();
        for subscriber in [1, 2] {
            for name in ["newsfeed", "ranked"] {
                lists.push(list_articles(&pool, subscriber, name).await.unwrap());
            }
        }
        runs.push(lists);
    }
    assert_eq!(runs[0], runs[1]);

    // anna's scored list only holds the elections stories
    let anna_ranked = &runs[0][1];
    assert_eq!(anna_ranked.len(), 3);
    // bruno never sees the weather
    let bruno_pool = &runs[0][2];
    assert_eq!(bruno_pool.len(), 4);
}
