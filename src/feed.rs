//! Native fetch & parse engine.
//!
//! Retrieves a source's syndication document, converts the one known JSON
//! shape (link trends API) into RSS, and parses everything with `feed-rs`
//! into [`Entry`] values. Entries are then deduplicated by link, filtered
//! against storage and stamped/sorted chronologically before retrieval.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use reqwest::cookie::Jar;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::models::Entry;
use crate::status::PollStatus;
use crate::store::ArticleStore;

/// URL suffix identifying the JSON link-trends endpoint.
const TRENDS_SUFFIX: &str = "/api/v1/trends/links?limit=20";

/// Build an HTTP client with the poller's fixed User-Agent.
pub fn build_client(
    user_agent: &str,
    timeout: Duration,
    jar: Option<Arc<Jar>>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout);
    if let Some(jar) = jar {
        builder = builder.cookie_provider(jar);
    }
    builder.build().context("failed to build HTTP client")
}

/// A successfully fetched source document.
#[derive(Debug)]
pub struct FetchedDocument {
    pub status: u16,
    pub body: String,
}

/// Fetch the source document. Every failure maps to a [`PollStatus`]; a
/// non-2xx response aborts with that HTTP status.
pub async fn fetch_document(
    client: &reqwest::Client,
    url: &str,
) -> std::result::Result<FetchedDocument, PollStatus> {
    let response = match client.get(url).send().await {
        Ok(r) => r,
        Err(e) => {
            let status = PollStatus::from_reqwest(&e);
            error!(url, error = %e, code = status.code(), "error when reading source document");
            return Err(status);
        }
    };

    let status = response.status();
    if !status.is_success() {
        error!(url, status = status.as_u16(), "source returned error status");
        return Err(PollStatus::Http(status.as_u16()));
    }

    match response.text().await {
        Ok(body) => Ok(FetchedDocument {
            status: status.as_u16(),
            body,
        }),
        Err(e) => {
            error!(url, error = %e, "error when reading source body");
            Err(PollStatus::from_reqwest(&e))
        }
    }
}

pub fn is_trends_source(url: &str) -> bool {
    url.ends_with(TRENDS_SUFFIX)
}

#[derive(Debug, Deserialize)]
struct TrendLink {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    author_name: Option<String>,
    #[serde(default)]
    provider_name: Option<String>,
    #[serde(default)]
    image: Option<String>,
}

fn trend_pub_date(published_at: Option<&str>) -> String {
    published_at
        .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.fZ").ok())
        .map(|naive| naive.and_utc())
        .unwrap_or_else(Utc::now)
        .to_rfc2822()
}

fn text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Synthesize a minimal RSS 2.0 document from the link-trends JSON payload.
pub fn trends_to_rss(json: &str) -> Result<String> {
    let links: Vec<TrendLink> =
        serde_json::from_str(json).context("invalid link trends payload")?;

    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(
        BytesStart::new("rss").with_attributes([("version", "2.0")]),
    ))?;
    writer.write_event(Event::Start(BytesStart::new("channel")))?;
    text_element(&mut writer, "title", "News Feed")?;
    text_element(&mut writer, "link", "https://example.com")?;
    text_element(&mut writer, "description", "A collection of news articles")?;

    for link in &links {
        let author = link
            .author_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(link.provider_name.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or("Unknown Author");

        writer.write_event(Event::Start(BytesStart::new("item")))?;
        text_element(&mut writer, "title", &link.title)?;
        text_element(&mut writer, "link", &link.url)?;
        text_element(&mut writer, "description", &link.description)?;
        text_element(
            &mut writer,
            "pubDate",
            &trend_pub_date(link.published_at.as_deref()),
        )?;
        text_element(&mut writer, "author", author)?;
        if let Some(image) = link.image.as_deref().filter(|s| !s.is_empty()) {
            writer.write_event(Event::Empty(
                BytesStart::new("enclosure")
                    .with_attributes([("url", image), ("type", "image/jpeg")]),
            ))?;
        }
        writer.write_event(Event::End(BytesEnd::new("item")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("channel")))?;
    writer.write_event(Event::End(BytesEnd::new("rss")))?;

    String::from_utf8(writer.into_inner().into_inner()).context("synthesized RSS is not UTF-8")
}

/// Parse a fetched document into entries. Entries without a link are dropped.
pub fn parse_entries(source_url: &str, body: &str) -> Result<Vec<Entry>> {
    let document = if is_trends_source(source_url) {
        trends_to_rss(body)?
    } else {
        body.to_string()
    };

    let feed = feed_rs::parser::parse(document.as_bytes()).context("failed to parse feed")?;

    let entries = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let link = entry
                .links
                .iter()
                .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
                .or_else(|| entry.links.first())
                .map(|l| l.href.trim().to_string())
                .filter(|href| !href.is_empty())?;

            Some(Entry {
                link,
                title: entry.title.map(|t| t.content),
                author: entry.authors.first().map(|p| p.name.clone()),
                content: entry.content.and_then(|c| c.body),
                summary: entry.summary.map(|s| s.content),
                published: entry.published.or(entry.updated),
                stamp: DateTime::<Utc>::default(),
            })
        })
        .collect();

    Ok(entries)
}

/// Drop entries whose link was already seen, keeping the first occurrence.
pub fn prune_duplicates(entries: Vec<Entry>) -> Vec<Entry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert(e.link.clone()))
        .collect()
}

/// Drop entries whose URL is already stored.
pub async fn prune_already_stored(
    entries: Vec<Entry>,
    store: &dyn ArticleStore,
) -> Result<Vec<Entry>> {
    let mut kept = Vec::with_capacity(entries.len());
    for entry in entries {
        if store.url_exists(&entry.link).await? {
            debug!(url = %entry.link, "article already retrieved");
        } else {
            kept.push(entry);
        }
    }
    Ok(kept)
}

/// Assign each entry its storage timestamp and sort ascending.
///
/// The parsed publish time is used unless it is missing or in the future,
/// in which case `now` is used.
pub fn stamp_and_sort(mut entries: Vec<Entry>, now: DateTime<Utc>) -> Vec<Entry> {
    for entry in entries.iter_mut() {
        entry.stamp = match entry.published {
            Some(published) if published <= now => published,
            _ => now,
        };
    }
    entries.sort_by_key(|e| e.stamp);
    for entry in &entries {
        info!(url = %entry.link, "to retrieve");
    }
    entries
}
