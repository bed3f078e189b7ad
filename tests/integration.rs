use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn newsroom_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_newsroom"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Port 1 refuses connections, so polling the feed source fails fast
    let config_content = format!(
        r#"[db]
path = "{}/data/newsroom.sqlite"

[poller]
feed_timeout_secs = 5

[cluster]
threshold = 0.05

[[sources]]
id = 1
url = "http://127.0.0.1:1/rss"
title = "Unreachable"
language = "it"

[[sources]]
id = 2
url = "https://example.org/feed"
language = "en"
active = false
"#,
        root.display()
    );

    let config_path = config_dir.join("newsroom.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_newsroom(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = newsroom_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run newsroom binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_newsroom(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/newsroom.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_newsroom(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_newsroom(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_sources_sync_and_list() {
    let (_tmp, config_path) = setup_test_env();

    run_newsroom(&config_path, &["init"]);
    let (stdout, stderr, success) = run_newsroom(&config_path, &["sources", "--sync"]);
    assert!(success, "sources failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("synced 2 sources"));
    assert!(stdout.contains("http://127.0.0.1:1/rss"));
    assert!(stdout.contains("https://example.org/feed"));

    // Syncing again updates in place
    run_newsroom(&config_path, &["sources", "--sync"]);
    let (stdout, _, _) = run_newsroom(&config_path, &["sources"]);
    assert_eq!(stdout.matches("https://example.org/feed").count(), 1);
}

#[test]
fn test_poll_records_failed_run() {
    let (_tmp, config_path) = setup_test_env();

    run_newsroom(&config_path, &["init"]);
    run_newsroom(&config_path, &["sources", "--sync"]);

    let (stdout, stderr, success) = run_newsroom(&config_path, &["poll"]);
    assert!(success, "poll failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("polled: 1"), "got: {}", stdout);
    assert!(stdout.contains("skipped: 1"), "got: {}", stdout);
    assert!(stdout.contains("unsuccessful: 1"), "got: {}", stdout);

    let (stdout, _, success) = run_newsroom(&config_path, &["runs", "--source", "1"]);
    assert!(success);
    assert!(stdout.contains("connection failed"), "got: {}", stdout);
}

#[test]
fn test_cluster_empty_database_prints_empty_array() {
    let (_tmp, config_path) = setup_test_env();

    run_newsroom(&config_path, &["init"]);
    let (stdout, stderr, success) = run_newsroom(&config_path, &["cluster"]);
    assert!(success, "cluster failed: stderr={}", stderr);
    assert_eq!(stdout.trim(), "[]");
}

#[test]
fn test_rank_without_subscribers() {
    let (_tmp, config_path) = setup_test_env();

    run_newsroom(&config_path, &["init"]);
    let (stdout, stderr, success) =
        run_newsroom(&config_path, &["rank", "--variant", "score"]);
    assert!(success, "rank failed: stderr={}", stderr);
    assert!(stdout.contains("ranked: 0"));
}

#[test]
fn test_embed_requires_provider() {
    let (_tmp, config_path) = setup_test_env();

    run_newsroom(&config_path, &["init"]);
    let (_, stderr, success) = run_newsroom(&config_path, &["embed", "pending"]);
    assert!(!success);
    assert!(stderr.contains("disabled"));
}

#[test]
fn test_invalid_config_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("bad.toml");
    fs::write(
        &config_path,
        format!(
            "[db]\npath = \"{}/x.sqlite\"\n\n[cluster]\nthreshold = 5.0\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, stderr, success) = run_newsroom(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("threshold"), "stderr={}", stderr);
}
