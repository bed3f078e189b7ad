//! Poll orchestration.
//!
//! ```text
//! frequency gate ──skip──▶ (log only)
//!       │
//!       ├── script source ──▶ ScriptRunner ────────────────────────┐
//!       │                                                          ▼
//!       └── feed source ──▶ fetch ─▶ parse ─▶ prune ─▶ retrieve ─▶ audit
//! ```
//!
//! Sources are polled one after another. The whole batch is bounded by
//! `poller.job_timeout_secs`; any single source's failure is recorded and
//! the batch moves on.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::audit;
use crate::config::{Config, PollerConfig};
use crate::cookies::load_source_cookies;
use crate::db;
use crate::feed;
use crate::frequency::skip_reason;
use crate::models::{PollCounts, PollOutcome, PollRun, Source};
use crate::retrieve::Retriever;
use crate::script::{ProcessScriptRunner, ScriptRunner};
use crate::sources::load_sources;
use crate::status::PollStatus;
use crate::store::{ArticleStore, SqliteArticleStore};

/// Totals for one batch run.
#[derive(Debug, Default)]
pub struct PollSummary {
    pub polled: usize,
    pub skipped: usize,
    pub unsuccessful: usize,
    pub counts: PollCounts,
    pub timed_out: bool,
}

pub struct Poller<'a> {
    config: &'a PollerConfig,
    pool: SqlitePool,
    store: &'a dyn ArticleStore,
    scripts: &'a dyn ScriptRunner,
}

impl<'a> Poller<'a> {
    pub fn new(
        config: &'a PollerConfig,
        pool: SqlitePool,
        store: &'a dyn ArticleStore,
        scripts: &'a dyn ScriptRunner,
    ) -> Self {
        Self {
            config,
            pool,
            store,
            scripts,
        }
    }

    fn rewrite_path(&self, path: &str) -> String {
        match &self.config.path_rewrite {
            Some(rewrite) => rewrite.apply(path),
            None => path.to_string(),
        }
    }

    /// Poll one source. Returns `None` when the frequency gate skipped it.
    pub async fn poll_source(&self, source: &Source, now: DateTime<Utc>) -> Option<PollRun> {
        if let Some(reason) = skip_reason(source, now) {
            info!(source_id = source.id, reason = %reason, "skipping source");
            return None;
        }

        let started_at = Utc::now();
        let outcome = match source.script.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(script) => {
                let path = PathBuf::from(self.rewrite_path(script));
                self.scripts
                    .invoke(&path, Duration::from_secs(self.config.script_timeout_secs))
                    .await
            }
            None => self.poll_feed(source, started_at).await,
        };
        let finished_at = Utc::now();

        let run = PollRun {
            source_id: source.id,
            started_at,
            finished_at,
            status: outcome.status.code(),
            retrieved: outcome.counts.retrieved,
            failed: outcome.counts.failed,
            stored: outcome.counts.stored,
        };

        if outcome.status.is_success() {
            info!(
                source_id = source.id,
                status = run.status,
                retrieved = run.retrieved,
                failed = run.failed,
                stored = run.stored,
                "source polled"
            );
        } else {
            warn!(source_id = source.id, status = %outcome.status, code = run.status, "source poll failed");
        }

        if let Err(e) = audit::record_poll_run(&self.pool, &run).await {
            error!(source_id = source.id, error = %e, "could not record poll run");
        }
        Some(run)
    }

    async fn poll_feed(&self, source: &Source, started_at: DateTime<Utc>) -> PollOutcome {
        let feed_client = match feed::build_client(
            &self.config.user_agent,
            Duration::from_secs(self.config.feed_timeout_secs),
            None,
        ) {
            Ok(c) => c,
            Err(e) => {
                error!(source_id = source.id, error = %e, "could not build feed client");
                return PollOutcome::failed(PollStatus::Unexpected);
            }
        };

        let document = match feed::fetch_document(&feed_client, &source.url).await {
            Ok(doc) => doc,
            Err(status) => return PollOutcome::failed(status),
        };

        let entries = match feed::parse_entries(&source.url, &document.body) {
            Ok(entries) => entries,
            Err(e) => {
                error!(source_id = source.id, url = %source.url, error = %e, "invalid source document");
                return PollOutcome::failed(PollStatus::InvalidDocument);
            }
        };

        let entries = feed::prune_duplicates(entries);
        let entries = match feed::prune_already_stored(entries, self.store).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(source_id = source.id, error = %e, "existence check failed");
                return PollOutcome::failed(PollStatus::Unexpected);
            }
        };
        let entries = feed::stamp_and_sort(entries, Utc::now());

        let jar = load_source_cookies(source.cookies.as_deref().map(|c| self.rewrite_path(c)).as_deref());
        let entry_client = match feed::build_client(
            &self.config.user_agent,
            Duration::from_secs(self.config.entry_timeout_secs),
            jar,
        ) {
            Ok(c) => c,
            Err(e) => {
                error!(source_id = source.id, error = %e, "could not build entry client");
                return PollOutcome::failed(PollStatus::Unexpected);
            }
        };

        let retriever = Retriever::new(
            entry_client,
            self.store,
            self.config.extraction_url.clone(),
            self.config.max_concurrent_entries,
        );
        let counts = retriever
            .retrieve_all(source, entries, started_at.timestamp())
            .await;

        PollOutcome {
            status: PollStatus::Http(document.status),
            counts,
        }
    }

    /// Poll every source (or just `only`) sequentially within the job timeout.
    pub async fn poll_all(&self, only: Option<i64>) -> Result<PollSummary> {
        let sources = load_sources(&self.pool, only).await?;
        let mut summary = PollSummary::default();
        let job_timeout = Duration::from_secs(self.config.job_timeout_secs);

        let job = async {
            for source in &sources {
                match self.poll_source(source, Utc::now()).await {
                    Some(run) => {
                        summary.polled += 1;
                        if !(200..300).contains(&run.status) {
                            summary.unsuccessful += 1;
                        }
                        summary.counts.add(PollCounts {
                            retrieved: run.retrieved,
                            failed: run.failed,
                            stored: run.stored,
                        });
                    }
                    None => summary.skipped += 1,
                }
            }
        };

        if tokio::time::timeout(job_timeout, job).await.is_err() {
            error!(
                timeout_secs = job_timeout.as_secs(),
                "poll job timed out, remaining sources not polled"
            );
            summary.timed_out = true;
        }
        Ok(summary)
    }
}

/// `newsroom poll`.
pub async fn run_poll(config: &Config, only: Option<i64>) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteArticleStore::new(pool.clone(), config.poller.canonical_language.clone());
    let scripts = ProcessScriptRunner;
    let poller = Poller::new(&config.poller, pool.clone(), &store, &scripts);

    let summary = poller.poll_all(only).await?;

    println!("poll");
    println!("  polled: {}", summary.polled);
    println!("  skipped: {}", summary.skipped);
    println!("  unsuccessful: {}", summary.unsuccessful);
    println!("  retrieved: {}", summary.counts.retrieved);
    println!("  failed: {}", summary.counts.failed);
    println!("  stored: {}", summary.counts.stored);
    if summary.timed_out {
        println!("  timed out: true");
    }

    pool.close().await;
    Ok(())
}
