//! Concurrent entry retriever.
//!
//! All entries of one poll run are retrieved concurrently over a single
//! HTTP client (one cookie jar, one User-Agent). Each entry's content comes
//! either straight from the feed or, for `incomplete` sources, from the
//! entry's own page run through the extraction service. Retrieved content is
//! normalized and handed to the storage gateway. A failing entry never
//! affects its siblings.

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use tracing::{error, info, warn};
use url::Url;

use crate::models::{Entry, NewArticle, PollCounts, Source};
use crate::normalize::{clean_text, normalize_content, sanitize_html};
use crate::store::ArticleStore;

pub struct Retriever<'a> {
    client: reqwest::Client,
    store: &'a dyn ArticleStore,
    extraction_url: String,
    max_concurrent: usize,
}

impl<'a> Retriever<'a> {
    pub fn new(
        client: reqwest::Client,
        store: &'a dyn ArticleStore,
        extraction_url: impl Into<String>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            client,
            store,
            extraction_url: extraction_url.into(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Retrieve, normalize and store every entry; returns the summed counts.
    ///
    /// `salt` is appended to stored URLs of `salt_url` sources.
    pub async fn retrieve_all(&self, source: &Source, entries: Vec<Entry>, salt: i64) -> PollCounts {
        let total = entries.len();
        let results: Vec<PollCounts> = stream::iter(entries)
            .map(|entry| self.retrieve_entry(source, entry, salt))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut counts = PollCounts::default();
        for r in results {
            counts.add(r);
        }
        info!(
            source_id = source.id,
            entries = total,
            retrieved = counts.retrieved,
            failed = counts.failed,
            stored = counts.stored,
            "entries processed"
        );
        counts
    }

    async fn retrieve_entry(&self, source: &Source, entry: Entry, salt: i64) -> PollCounts {
        let mut counts = PollCounts::default();

        let raw = if source.incomplete {
            match self.download_content(&entry.link, source.exclude.as_deref()).await {
                Ok(content) => content,
                Err(e) => {
                    error!(url = %entry.link, error = %e, "could not retrieve full content");
                    counts.failed = 1;
                    return counts;
                }
            }
        } else {
            match entry.content.clone().or_else(|| entry.summary.clone()) {
                Some(content) => content,
                None => {
                    error!(url = %entry.link, "entry has no content and no summary");
                    counts.failed = 1;
                    return counts;
                }
            }
        };
        counts.retrieved = 1;

        let url = if source.salt_url {
            salted_url(&entry.link, salt)
        } else {
            entry.link.clone()
        };

        let content = normalize_content(&raw, base_url(&url).as_deref(), source.exclude.as_deref());
        if content.is_empty() {
            warn!(url = %url, "entry has no content left after normalization");
            counts.failed = 1;
            return counts;
        }

        let article = NewArticle {
            url,
            stamp: entry.stamp,
            author: entry
                .author
                .as_deref()
                .map(clean_text)
                .filter(|a| !a.is_empty()),
            title: entry.title.as_deref().map(clean_text).unwrap_or_default(),
            content,
            language: source.language.clone(),
            source_id: source.id,
        };

        match self.store.store(&article).await {
            Ok(id) => {
                info!(url = %article.url, id, "new article stored");
                counts.stored = 1;
            }
            Err(e) => {
                warn!(url = %article.url, error = %e, "article not stored");
                counts.failed = 1;
            }
        }
        counts
    }

    /// Fetch the entry's page, sanitize it and run it through the
    /// extraction service.
    async fn download_content(&self, link: &str, exclude: Option<&str>) -> Result<String> {
        let response = self.client.get(link).send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("page returned error status {}", status);
        }
        let html = response.text().await?;
        let sanitized = sanitize_html(&html, exclude);

        let endpoint = Url::parse_with_params(&self.extraction_url, &[("href", link)])
            .with_context(|| format!("invalid extraction url {}", self.extraction_url))?;
        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/html; charset=UTF-8")
            .body(sanitized)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            bail!("extraction service returned error status {}", status);
        }
        Ok(response.text().await?)
    }
}

/// Suffix the URL with the run token so repeated syndication of the same
/// link is stored as a distinct story.
pub fn salted_url(link: &str, salt: i64) -> String {
    format!("{}#{}", link, salt)
}

/// `scheme://host[:port]` of the article URL, used to absolutize links.
pub fn base_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}
