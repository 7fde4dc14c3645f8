//! Builds the rolling `since:`/`until:` search window for a run.
//!
//! Collection walks backward in time, so the earliest date already collected
//! is where the next run resumes.

use crate::error::{AppError, Result};
use crate::models::{Notification, parse_timestamp};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// The keyword clause every query starts with.
const SEARCH_TERMS: &str =
    r#""additive manufacturing" or "3d printer" or "3d printed" or "3d printing" or "3d print""#;

/// An anchor at or after this time of day is not affected by intra-day lag.
const LAG_CUTOFF: (u32, u32, u32) = (18, 0, 0);

/// A computed search window.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueryWindow {
    pub anchor: NaiveDateTime,
    pub since: NaiveDate,
    pub until: NaiveDate,
    pub query: String,
    /// Set when `until` was left on the anchor day, which risks re-scraping
    /// that boundary day; the caller sends a summary notification.
    pub needs_summary: bool,
}

impl QueryWindow {
    /// The notification sent when `until` stays on the anchor day.
    pub(crate) fn summary_notification(&self, node_id: &str) -> Notification {
        Notification::SearchWindowSummary {
            node_id: node_id.to_string(),
            since: self.since.to_string(),
            until: self.until.to_string(),
            query: self.query.clone(),
        }
    }
}

/// Formats the full search query for a date range.
pub(crate) fn build_query(since: NaiveDate, until: NaiveDate) -> String {
    format!(
        "{} until:{} since:{} -filter:replies",
        SEARCH_TERMS,
        until.format("%Y-%m-%d"),
        since.format("%Y-%m-%d")
    )
}

/// Applies the lag rule to an anchor timestamp.
pub(crate) fn window_from_anchor(anchor: NaiveDateTime, lag_days: i64) -> QueryWindow {
    let since = (anchor - Duration::days(lag_days)).date();
    let (h, m, s) = LAG_CUTOFF;
    let cutoff = NaiveTime::from_hms_opt(h, m, s).unwrap_or(NaiveTime::MIN);

    let (until, needs_summary) = if anchor.time() >= cutoff {
        tracing::info!(target: "query_task",
            "Anchor {} is NOT within the lag-sensitive part of the day; lags won't be considered.", anchor);
        ((anchor + Duration::days(1)).date(), false)
    } else {
        tracing::info!(target: "query_task",
            "Anchor {} IS within the lag-sensitive part of the day; lags will be considered.", anchor);
        (anchor.date(), true)
    };

    let query = build_query(since, until);
    tracing::info!(target: "query_task",
        "Window since:{} until:{} (anchor day {})", since, until, anchor.date());
    tracing::info!(target: "query_task", "Generated search query: {}", query);

    QueryWindow {
        anchor,
        since,
        until,
        query,
        needs_summary,
    }
}

/// All `.csv` files below `dir`, sorted for stable logging.
fn batch_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        tracing::warn!(target: "query_task", "History folder {} does not exist yet.", dir.display());
        return Ok(files);
    }
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| AppError::Io(e.into()))?;
        if entry.file_type().is_file()
            && entry
                .path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
        {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Reads the `Date` column of one batch file. Returns `None` when the file
/// has no such column; unparseable values are skipped.
fn dates_in_file(path: &Path) -> Result<Option<Vec<NaiveDateTime>>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let Some(date_idx) = headers.iter().position(|h| h.trim() == "Date") else {
        tracing::debug!(target: "query_task", "No Date column in {}", path.display());
        return Ok(None);
    };

    let mut dates = Vec::new();
    for row in reader.records() {
        let row = row?;
        if let Some(parsed) = row.get(date_idx).and_then(parse_timestamp) {
            dates.push(parsed);
        }
    }
    Ok(Some(dates))
}

/// Earliest date across every prior batch under `dir`.
///
/// Fails with a configuration error when there are no batch files at all
/// (the caller must supply a seed date instead), and with a data integrity
/// error when no file carries a usable `Date` column.
pub(crate) fn earliest_collected(dir: &Path) -> Result<NaiveDateTime> {
    let files = batch_files(dir)?;
    tracing::info!(target: "query_task", "Found {} CSV files in folder: {}", files.len(), dir.display());

    if files.is_empty() {
        return Err(AppError::Config(format!(
            "No prior batch files under '{}'; provide an explicit seed date",
            dir.display()
        )));
    }

    let mut saw_date_column = false;
    let mut earliest: Option<NaiveDateTime> = None;
    for file in &files {
        let Some(dates) = dates_in_file(file)? else {
            continue;
        };
        saw_date_column = true;
        if let Some(min) = dates.into_iter().min() {
            earliest = Some(earliest.map_or(min, |e| e.min(min)));
        }
    }

    if !saw_date_column {
        tracing::error!(target: "query_task",
            "No 'Date' column found in the CSV files under {}", dir.display());
        return Err(AppError::DataIntegrity(format!(
            "'Date' column missing in every CSV file under '{}'",
            dir.display()
        )));
    }

    let earliest = earliest.ok_or_else(|| {
        AppError::DataIntegrity(format!(
            "No parseable values in the 'Date' columns under '{}'",
            dir.display()
        ))
    })?;
    tracing::info!(target: "query_task", "Earliest date found: {}", earliest.format("%Y-%m-%d"));
    Ok(earliest)
}

/// Computes the window for the next run from prior batches, or from `seed`
/// when the history folder holds no batch files yet.
pub(crate) fn build_window(
    history_dir: &Path,
    lag_days: i64,
    seed: Option<NaiveDateTime>,
) -> Result<QueryWindow> {
    let anchor = match earliest_collected(history_dir) {
        Ok(anchor) => anchor,
        Err(AppError::Config(reason)) => match seed {
            Some(seed) => {
                tracing::warn!(target: "query_task", "{}. Using seed date {}.", reason, seed);
                seed
            }
            None => return Err(AppError::Config(reason)),
        },
        Err(e) => return Err(e),
    };
    Ok(window_from_anchor(anchor, lag_days))
}

/// Builds the query used after a stall at `stalled_key`: the window ends
/// `until_days` before the stalled post's date and spans back to
/// `since_days` before it.
pub(crate) fn shifted_query(stalled_key: &str, until_days: i64, since_days: i64) -> Result<String> {
    let date_part = stalled_key.split('_').next().unwrap_or_default();
    let stalled_at = parse_timestamp(date_part).ok_or_else(|| {
        AppError::DataIntegrity(format!(
            "Cannot read a timestamp from stalled key '{}'",
            stalled_key
        ))
    })?;
    let until = (stalled_at - Duration::days(until_days)).date();
    let since = (stalled_at - Duration::days(since_days)).date();
    Ok(build_query(since, until))
}
