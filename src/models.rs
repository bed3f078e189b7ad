//! Core data models used throughout the pipeline.
//!
//! These types represent the sources, feed entries, articles, poll runs and
//! subscribers that flow between the poller, the storage gateway and the
//! offline jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::frequency::FrequencySpec;
use crate::status::PollStatus;

/// A configured upstream content feed, as read from the registry.
#[derive(Debug, Clone)]
pub struct Source {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub language: String,
    /// CSS selector for content to strip before storage.
    pub exclude: Option<String>,
    /// Path to a Netscape-format cookie file.
    pub cookies: Option<String>,
    /// Path to a legacy extraction program; when set, the native path is bypassed.
    pub script: Option<String>,
    pub frequency: Option<FrequencySpec>,
    pub active: bool,
    /// Entries only carry a teaser; the full page must be fetched and extracted.
    pub incomplete: bool,
    pub salt_url: bool,
    pub premium: bool,
    pub rating: i64,
    pub last_polled: Option<DateTime<Utc>>,
}

/// One candidate article parsed from a source document, before storage.
#[derive(Debug, Clone)]
pub struct Entry {
    pub link: String,
    pub title: Option<String>,
    pub author: Option<String>,
    /// Full content blocks as provided by the feed (`content:encoded`, Atom content).
    pub content: Option<String>,
    pub summary: Option<String>,
    pub published: Option<DateTime<Utc>>,
    /// Assigned by [`crate::feed::stamp_and_sort`].
    pub stamp: DateTime<Utc>,
}

/// A normalized article ready for the storage gateway.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub url: String,
    pub stamp: DateTime<Utc>,
    pub author: Option<String>,
    pub title: String,
    pub content: String,
    pub language: String,
    pub source_id: i64,
}

/// Per-run article counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollCounts {
    pub retrieved: i64,
    pub failed: i64,
    pub stored: i64,
}

impl PollCounts {
    pub fn add(&mut self, other: PollCounts) {
        self.retrieved += other.retrieved;
        self.failed += other.failed;
        self.stored += other.stored;
    }
}

/// Result of one poll attempt, before it is written to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub status: PollStatus,
    pub counts: PollCounts,
}

impl PollOutcome {
    pub fn failed(status: PollStatus) -> Self {
        Self {
            status,
            counts: PollCounts::default(),
        }
    }
}

/// Audit record for one poll attempt.
#[derive(Debug, Clone, Serialize)]
pub struct PollRun {
    pub source_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: i64,
    pub retrieved: i64,
    pub failed: i64,
    pub stored: i64,
}

/// Subscriber preferences consumed by the ranking job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    pub name: String,
    pub languages: Vec<String>,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}
