//! TOML configuration parsing and validation.
//!
//! Every command reads the same file (default `./config/newsroom.toml`).
//! Sections that are not present fall back to the defaults used in
//! production; only `[db]` is mandatory.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::frequency::FrequencySpec;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    /// Declarative source registry entries, synced with `newsroom sources --sync`.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollerConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_feed_timeout")]
    pub feed_timeout_secs: u64,
    #[serde(default = "default_entry_timeout")]
    pub entry_timeout_secs: u64,
    #[serde(default = "default_script_timeout")]
    pub script_timeout_secs: u64,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_extraction_url")]
    pub extraction_url: String,
    #[serde(default = "default_max_concurrent_entries")]
    pub max_concurrent_entries: usize,
    #[serde(default = "default_canonical_language")]
    pub canonical_language: String,
    /// Prefix rewrite applied to script and cookie-file paths stored in the
    /// registry, for deployments where the files were relocated.
    #[serde(default)]
    pub path_rewrite: Option<PathRewrite>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            feed_timeout_secs: default_feed_timeout(),
            entry_timeout_secs: default_entry_timeout(),
            script_timeout_secs: default_script_timeout(),
            job_timeout_secs: default_job_timeout(),
            extraction_url: default_extraction_url(),
            max_concurrent_entries: default_max_concurrent_entries(),
            canonical_language: default_canonical_language(),
            path_rewrite: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathRewrite {
    pub from: String,
    pub to: String,
}

impl PathRewrite {
    pub fn apply(&self, path: &str) -> String {
        match path.strip_prefix(&self.from) {
            Some(rest) => format!("{}{}", self.to, rest),
            None => path.to_string(),
        }
    }
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64; rv:52.0) Gecko/20100101 Firefox/52.0".to_string()
}
fn default_feed_timeout() -> u64 {
    60
}
fn default_entry_timeout() -> u64 {
    30
}
fn default_script_timeout() -> u64 {
    200
}
fn default_job_timeout() -> u64 {
    3500
}
fn default_extraction_url() -> String {
    "http://readability:8081".to_string()
}
fn default_max_concurrent_entries() -> usize {
    32
}
fn default_canonical_language() -> String {
    "it".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Model label used to key stored vectors.
    pub fn model_label(&self) -> String {
        self.model.clone().unwrap_or_else(|| "disabled".to_string())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub min_id: i64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            min_id: 0,
        }
    }
}

fn default_threshold() -> f64 {
    0.05
}

#[derive(Debug, Deserialize, Clone)]
pub struct RankingConfig {
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_list_name")]
    pub list_name: String,
    #[serde(default = "default_scored_list_name")]
    pub scored_list_name: String,
    #[serde(default = "default_cap")]
    pub cap: usize,
    #[serde(default = "default_whitelist_top_n")]
    pub whitelist_top_n: usize,
    #[serde(default = "default_min_source_rating")]
    pub min_source_rating: i64,
    #[serde(default = "default_score_limit")]
    pub score_limit: usize,
    #[serde(default = "default_premium_bonus")]
    pub premium_bonus: f64,
    #[serde(default = "default_subscriber_batch")]
    pub subscriber_batch: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            list_name: default_list_name(),
            scored_list_name: default_scored_list_name(),
            cap: default_cap(),
            whitelist_top_n: default_whitelist_top_n(),
            min_source_rating: default_min_source_rating(),
            score_limit: default_score_limit(),
            premium_bonus: default_premium_bonus(),
            subscriber_batch: default_subscriber_batch(),
        }
    }
}

fn default_lookback_days() -> i64 {
    30
}
fn default_list_name() -> String {
    "newsfeed".to_string()
}
fn default_scored_list_name() -> String {
    "ranked".to_string()
}
fn default_cap() -> usize {
    200
}
fn default_whitelist_top_n() -> usize {
    10_000
}
fn default_min_source_rating() -> i64 {
    -5
}
fn default_score_limit() -> usize {
    100
}
fn default_premium_bonus() -> f64 {
    1.0
}
fn default_subscriber_batch() -> usize {
    100
}

/// One `[[sources]]` entry of the declarative registry.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub id: i64,
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub language: String,
    #[serde(default)]
    pub exclude: Option<String>,
    #[serde(default)]
    pub cookies: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub frequency: Option<FrequencySpec>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub incomplete: bool,
    #[serde(default)]
    pub salt_url: bool,
    #[serde(default)]
    pub premium: bool,
    #[serde(default)]
    pub rating: i64,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// A configuration with every section at its default, pointing at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            poller: PollerConfig::default(),
            embedding: EmbeddingConfig::default(),
            cluster: ClusterConfig::default(),
            ranking: RankingConfig::default(),
            sources: Vec::new(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let poller = &config.poller;
    if poller.feed_timeout_secs == 0 || poller.entry_timeout_secs == 0 {
        bail!("poller timeouts must be > 0");
    }
    if poller.script_timeout_secs == 0 || poller.job_timeout_secs == 0 {
        bail!("poller.script_timeout_secs and poller.job_timeout_secs must be > 0");
    }
    if poller.max_concurrent_entries == 0 {
        bail!("poller.max_concurrent_entries must be >= 1");
    }
    if poller.canonical_language.trim().is_empty() {
        bail!("poller.canonical_language must not be empty");
    }

    if !(config.cluster.threshold > 0.0 && config.cluster.threshold <= 2.0) {
        bail!("cluster.threshold must be in (0.0, 2.0]");
    }

    let ranking = &config.ranking;
    if ranking.lookback_days < 1 {
        bail!("ranking.lookback_days must be >= 1");
    }
    if ranking.cap == 0 || ranking.score_limit == 0 || ranking.subscriber_batch == 0 {
        bail!("ranking.cap, ranking.score_limit and ranking.subscriber_batch must be >= 1");
    }

    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if embedding.is_enabled() {
        if embedding.dims.is_none() || embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                embedding.provider
            );
        }
        if embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                embedding.provider
            );
        }
        if embedding.batch_size == 0 {
            bail!("embedding.batch_size must be >= 1");
        }
    }

    let mut ids = std::collections::HashSet::new();
    for source in &config.sources {
        if !ids.insert(source.id) {
            bail!("duplicate source id {} in [[sources]]", source.id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str("[db]\npath = \"./data/news.sqlite\"\n").unwrap();
        assert_eq!(config.poller.script_timeout_secs, 200);
        assert_eq!(config.poller.canonical_language, "it");
        assert_eq!(config.cluster.threshold, 0.05);
        assert_eq!(config.ranking.cap, 200);
        assert!(!config.embedding.is_enabled());
        validate(&config).unwrap();
    }

    #[test]
    fn test_sources_with_frequency() {
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "x.sqlite"

            [[sources]]
            id = 7
            url = "https://example.com/rss"
            language = "en"
            incomplete = true
            frequency = { hour = [6, 18], weekday = [1, 2, 3, 4, 5] }
            "#,
        )
        .unwrap();
        let source = &config.sources[0];
        assert!(source.active);
        assert!(source.incomplete);
        let freq = source.frequency.as_ref().unwrap();
        assert_eq!(freq.hour, Some([6u32, 18].into_iter().collect()));
        assert!(freq.day.is_none());
    }

    #[test]
    fn test_rejects_enabled_embedding_without_dims() {
        let mut config = Config::minimal("x.sqlite");
        config.embedding.provider = "openai".to_string();
        config.embedding.model = Some("text-embedding-3-small".to_string());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_duplicate_source_ids() {
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "x.sqlite"
            [[sources]]
            id = 1
            url = "a"
            language = "it"
            [[sources]]
            id = 1
            url = "b"
            language = "it"
            "#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_path_rewrite() {
        let rewrite = PathRewrite {
            from: "/srv/news/py/".to_string(),
            to: "/app/news/".to_string(),
        };
        assert_eq!(rewrite.apply("/srv/news/py/poll_19.py"), "/app/news/poll_19.py");
        assert_eq!(rewrite.apply("/other/poll.py"), "/other/poll.py");
    }
}
