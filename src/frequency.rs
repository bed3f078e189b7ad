//! Polling schedule gate.
//!
//! A source may carry a declarative schedule such as
//! `{"hour": [6, 18], "day": [1, -1], "weekday": [1, 2, 3, 4, 5]}`.
//! Every present constraint must match the current UTC instant for the
//! source to be polled:
//!
//! - `hour`: hours of day, 0–23.
//! - `day`: days of month; negative values count back from the last day of
//!   the current month (`-1` is the last day).
//! - `weekday`: 1 = Monday … 7 = Sunday.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::Source;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<BTreeSet<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<BTreeSet<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekday: Option<BTreeSet<u32>>,
}

/// Why a source will not be polled in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Inactive,
    Hour(u32),
    Day(u32),
    Weekday(u32),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Inactive => write!(f, "source is not active"),
            SkipReason::Hour(h) => write!(f, "hour {} not scheduled", h),
            SkipReason::Day(d) => write!(f, "day {} not scheduled", d),
            SkipReason::Weekday(w) => write!(f, "weekday {} not scheduled", w),
        }
    }
}

impl FrequencySpec {
    /// Parse the JSON form stored in the source registry.
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).with_context(|| format!("invalid frequency spec: {}", json))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Returns the first constraint that `now` violates, if any.
    pub fn check(&self, now: DateTime<Utc>) -> Option<SkipReason> {
        if let Some(hours) = &self.hour {
            if !hours.contains(&now.hour()) {
                return Some(SkipReason::Hour(now.hour()));
            }
        }

        if let Some(weekdays) = &self.weekday {
            let weekday = now.weekday().number_from_monday();
            if !weekdays.contains(&weekday) {
                return Some(SkipReason::Weekday(weekday));
            }
        }

        if let Some(days) = &self.day {
            let last = last_day_of_month(now.date_naive()) as i32;
            let today = now.day() as i32;
            let hit = days
                .iter()
                .map(|&d| if d < 0 { d + last + 1 } else { d })
                .any(|d| d == today);
            if !hit {
                return Some(SkipReason::Day(now.day()));
            }
        }

        None
    }

    pub fn matches(&self, now: DateTime<Utc>) -> bool {
        self.check(now).is_none()
    }
}

/// Decide whether `source` should be polled at `now`.
pub fn skip_reason(source: &Source, now: DateTime<Utc>) -> Option<SkipReason> {
    if !source.active {
        return Some(SkipReason::Inactive);
    }
    source.frequency.as_ref().and_then(|f| f.check(now))
}

fn last_day_of_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}
