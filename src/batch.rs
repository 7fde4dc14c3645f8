//! Accumulates novel records and writes them out as dated CSV batches.

use crate::error::Result;
use crate::ledger::UniqueKeyLedger;
use crate::models::{FlushReason, Record};
use chrono::NaiveDateTime;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Header row of every batch file.
pub(crate) const CSV_HEADER: [&str; 8] = [
    "Author Name",
    "Author ID",
    "Date",
    "Post Text",
    "Replies",
    "Likes",
    "Reshares",
    "Views",
];

/// Result of a flush that wrote a file.
#[derive(Debug, Clone)]
pub(crate) struct FlushOutcome {
    pub path: PathBuf,
    pub records: usize,
    pub keys_appended: usize,
}

/// `dir/name`, or `dir/<stem>_<n>.csv` when two flushes land in the same second.
fn free_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = name.trim_end_matches(".csv");
    (2..)
        .map(|n| dir.join(format!("{}_{}.csv", stem, n)))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

/// Records collected since the last flush, in arrival order.
#[derive(Debug)]
pub(crate) struct BatchBuffer {
    records: Vec<Record>,
    threshold: usize,
}

impl BatchBuffer {
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            records: Vec::new(),
            threshold: threshold.max(1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Buffers `record` if its key is unknown to the ledger, which also holds
    /// every key buffered so far this run. Returns whether it was novel.
    pub(crate) fn offer(&mut self, ledger: &mut UniqueKeyLedger, record: Record) -> bool {
        if !ledger.insert(record.unique_key()) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub(crate) fn should_flush(&self) -> bool {
        self.records.len() >= self.threshold
    }

    /// Most recent buffered record by timestamp, with its key.
    pub(crate) fn latest(&self) -> Option<(String, &Record)> {
        self.records
            .iter()
            .filter_map(|r| r.posted_at_naive().map(|at| (at, r)))
            .max_by_key(|(at, _)| *at)
            .map(|(_, r)| (r.unique_key(), r))
    }

    /// Sorted distinct `MM_YYYY` tags spanned by the buffered records.
    pub(crate) fn month_year_tags(&self) -> Vec<String> {
        let tags: BTreeSet<String> = self
            .records
            .iter()
            .filter_map(Record::posted_at_naive)
            .map(|at| at.format("%m_%Y").to_string())
            .collect();
        tags.into_iter().collect()
    }

    /// `tweets_<YYYYMMDD_HHMMSS>_<tag>.csv`
    pub(crate) fn file_name(&self, reason: FlushReason, now: NaiveDateTime) -> String {
        let tag = match reason.file_tag() {
            Some(keyword) => keyword.to_string(),
            None => {
                let tags = self.month_year_tags();
                if tags.is_empty() {
                    "undated".to_string()
                } else {
                    tags.join("_")
                }
            }
        };
        format!("tweets_{}_{}.csv", now.format("%Y%m%d_%H%M%S"), tag)
    }

    fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;
        writer.write_record(CSV_HEADER)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Writes every buffered record to one file under `output_dir`, then
    /// commits the ledger's pending keys. Buffer and pending keys are cleared
    /// only when both steps succeed; on error nothing in memory is lost.
    /// An empty buffer writes no file.
    pub(crate) fn flush(
        &mut self,
        ledger: &mut UniqueKeyLedger,
        reason: FlushReason,
        output_dir: &Path,
        now: NaiveDateTime,
    ) -> Result<Option<FlushOutcome>> {
        if self.is_empty() {
            let keys_appended = ledger.commit_pending()?;
            if keys_appended > 0 {
                tracing::warn!(target: "batch_task",
                    "Committed {} ledger keys without buffered records.", keys_appended);
            }
            tracing::info!(target: "batch_task", "Nothing buffered; no file written for {:?} flush.", reason);
            return Ok(None);
        }

        fs::create_dir_all(output_dir)?;
        let path = free_path(output_dir, &self.file_name(reason, now));
        self.write_csv(&path)?;
        tracing::info!(target: "batch_task",
            "Batch of {} records written to {}", self.records.len(), path.display());

        tracing::debug!(target: "batch_task",
            "Committing {} new keys to {}", ledger.pending_len(), ledger.path().display());
        let keys_appended = ledger.commit_pending()?;
        let records = self.records.len();
        self.records.clear();

        Ok(Some(FlushOutcome {
            path,
            records,
            keys_appended,
        }))
    }
}
