//! Defines the core data structures used by the collector.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

/// Fallback author name when the byline cannot be read.
pub(crate) const UNKNOWN_AUTHOR: &str = "Unknown Author";
/// Fallback post text when the text block cannot be read.
pub(crate) const UNKNOWN_POST_CONTENT: &str = "Unknown Post Content";

/// One collected post, as written to a batch file.
///
/// Equality and hashing look only at [`Record::unique_key`], so two records
/// for the same post with different engagement counts are the same record.
/// The first one offered to a buffer wins.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct Record {
    #[serde(rename = "Author Name")]
    pub author_name: String,
    #[serde(rename = "Author ID")]
    pub author_id: Option<String>,
    /// ISO-8601 timestamp as published by the feed, e.g. `2024-03-10T14:22:01.000Z`.
    #[serde(rename = "Date")]
    pub posted_at: String,
    #[serde(rename = "Post Text")]
    pub text: String,
    #[serde(rename = "Replies")]
    pub replies: u64,
    #[serde(rename = "Likes")]
    pub likes: u64,
    #[serde(rename = "Reshares")]
    pub reshares: u64,
    #[serde(rename = "Views")]
    pub views: u64,
}

impl Record {
    /// `posted_at + "_" + author_id`. A missing id renders as `None`, which
    /// matches ledgers written by earlier deployments. Two id-less authors
    /// posting in the same second collide; that is a known limitation.
    pub(crate) fn unique_key(&self) -> String {
        format!(
            "{}_{}",
            self.posted_at,
            self.author_id.as_deref().unwrap_or("None")
        )
    }

    /// Parses `posted_at` as a UTC timestamp without offset.
    pub(crate) fn posted_at_naive(&self) -> Option<NaiveDateTime> {
        parse_timestamp(&self.posted_at)
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.unique_key() == other.unique_key()
    }
}

impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique_key().hash(state);
    }
}

/// Parses the timestamp shapes found in feeds and prior batch files:
/// RFC 3339 (`2024-03-10T14:22:01.000Z`), `YYYY-MM-DD HH:MM:SS`, and bare dates.
pub(crate) fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Why a batch is being written. Non-batch reasons replace the month/year
/// tag in the output filename with a fixed keyword.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum FlushReason {
    Batch,
    ElapsedTime,
    Exception,
    DeliberateCancellation,
}

impl FlushReason {
    /// Filename keyword for termination flushes; `None` for normal batches.
    pub(crate) fn file_tag(&self) -> Option<&'static str> {
        match self {
            FlushReason::Batch => None,
            FlushReason::ElapsedTime => Some("elapsedtime"),
            FlushReason::Exception => Some("exception"),
            FlushReason::DeliberateCancellation => Some("delibratecancellation"),
        }
    }
}

/// Run Controller states.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum RunState {
    Running,
    Flushing,
    TerminatedTime,
    TerminatedError,
    TerminatedThreshold,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Running => "RUNNING",
            RunState::Flushing => "FLUSHING",
            RunState::TerminatedTime => "TERMINATED_TIME",
            RunState::TerminatedError => "TERMINATED_ERROR",
            RunState::TerminatedThreshold => "TERMINATED_THRESHOLD",
        };
        f.write_str(name)
    }
}

/// Outcome of a finished collection run.
#[derive(Serialize, Debug, Clone)]
pub(crate) struct RunSummary {
    pub node_id: String,
    pub final_state: RunState,
    /// Records that were novel against the ledger and this run's buffer.
    pub novel_records: u64,
    pub batches_written: u64,
    pub files: Vec<PathBuf>,
    pub ledger_keys_appended: u64,
    pub scroll_passes: u64,
    pub query_shifts: u64,
}

/// Payloads handed to the notification sink.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Notification {
    FlowStarted {
        node_id: String,
        query: String,
    },
    FlowEnded {
        node_id: String,
        query: String,
        final_state: String,
        novel_records: u64,
        batches_written: u64,
    },
    SearchWindowSummary {
        node_id: String,
        since: String,
        until: String,
        query: String,
    },
    SearchQueryUpdate {
        node_id: String,
        stalled_key: String,
        query: String,
    },
    RetrySucceeded {
        node_id: String,
        stalled_key: Option<String>,
    },
}
