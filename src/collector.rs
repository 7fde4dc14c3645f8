//! The run controller: scroll, extract, dedup, flush, repeat.
//!
//! One pass at a time, strictly sequential. The only suspension points are
//! the timed waits between browser actions. Every way out of the loop other
//! than a configuration failure goes through a final flush first, so a run
//! can fail but never silently drop a novel record.

use crate::batch::BatchBuffer;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::extractor::{self, FeedItem};
use crate::ledger::UniqueKeyLedger;
use crate::models::{FlushReason, Notification, RunState, RunSummary};
use crate::notify::{Notifier, notify_best_effort};
use crate::query::{self, QueryWindow};
use crate::stall::{Recovery, StallDetector};
use crate::surface::FeedSurface;
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

/// Wall-clock end of a run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    end: Instant,
    budget: Duration,
}

impl Deadline {
    /// Whole hours plus whole minutes of `hours` from now; the leftover
    /// fraction of a minute is dropped.
    pub(crate) fn from_hours(hours: f64) -> Result<Self> {
        if !(hours > 0.0) || !hours.is_finite() {
            return Err(AppError::Config(format!(
                "Maximum run time must be a positive number of hours, got {}",
                hours
            )));
        }
        let whole_hours = hours.trunc() as u64;
        let minutes = ((hours - hours.trunc()) * 60.0).trunc() as u64;
        let deadline = whole_hours
            .checked_mul(3600)
            .and_then(|secs| secs.checked_add(minutes * 60))
            .and_then(|secs| Self::checked_after(Duration::from_secs(secs)))
            .ok_or_else(|| {
                AppError::Config(format!("Maximum run time of {} hours is out of range", hours))
            })?;
        tracing::info!(target: "collector_task",
            "Run time budget: {} hours and {} minutes.", whole_hours, minutes);
        Ok(deadline)
    }

    fn checked_after(budget: Duration) -> Option<Self> {
        Instant::now()
            .checked_add(budget)
            .map(|end| Self { end, budget })
    }

    #[cfg(test)]
    pub(crate) fn after(budget: Duration) -> Self {
        Self::checked_after(budget).unwrap()
    }

    pub(crate) fn budget(&self) -> Duration {
        self.budget
    }

    pub(crate) fn is_elapsed(&self) -> bool {
        Instant::now() >= self.end
    }

    pub(crate) fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }
}

fn format_remaining(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Drives one collection run for one node.
pub(crate) struct Collector<'a> {
    config: &'a Config,
    surface: &'a dyn FeedSurface,
    notifier: &'a dyn Notifier,
    node_id: String,
    query: String,
    ledger: UniqueKeyLedger,
    buffer: BatchBuffer,
    detector: StallDetector,
    deadline: Deadline,
    state: RunState,
    novel_records: u64,
    batches_written: u64,
    files: Vec<PathBuf>,
    ledger_keys_appended: u64,
    scroll_passes: u64,
    query_shifts: u64,
    progress: ProgressBar,
}

impl<'a> Collector<'a> {
    pub(crate) fn new(
        config: &'a Config,
        surface: &'a dyn FeedSurface,
        notifier: &'a dyn Notifier,
        node_id: String,
        ledger: UniqueKeyLedger,
        query: String,
        deadline: Deadline,
    ) -> Self {
        let progress = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} [{elapsed_precise}] {msg}") {
            progress.set_style(style);
        }
        progress.enable_steady_tick(Duration::from_millis(120));

        Self {
            config,
            surface,
            notifier,
            node_id,
            query,
            ledger,
            buffer: BatchBuffer::new(config.batch_size),
            detector: StallDetector::new(config.repeat_threshold),
            deadline,
            state: RunState::Running,
            novel_records: 0,
            batches_written: 0,
            files: Vec::new(),
            ledger_keys_appended: 0,
            scroll_passes: 0,
            query_shifts: 0,
            progress,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> RunState {
        self.state
    }

    #[cfg(test)]
    /// The query currently driving the feed; changes after a query shift.
    pub(crate) fn query(&self) -> &str {
        &self.query
    }

    pub(crate) fn summary(&self) -> RunSummary {
        RunSummary {
            node_id: self.node_id.clone(),
            final_state: self.state,
            novel_records: self.novel_records,
            batches_written: self.batches_written,
            files: self.files.clone(),
            ledger_keys_appended: self.ledger_keys_appended,
            scroll_passes: self.scroll_passes,
            query_shifts: self.query_shifts,
        }
    }

    /// The whole flow for one run: the window summary when the lag rule asks
    /// for it, search setup on the surface, then the loop bracketed by the
    /// flow-started and flow-ended notifications. Flow-ended is sent however
    /// the loop ends; a setup failure returns before flow-started.
    pub(crate) async fn sweep<F>(&mut self, window: &QueryWindow, shutdown: F) -> Result<RunState>
    where
        F: Future<Output = ()>,
    {
        if window.needs_summary {
            notify_best_effort(self.notifier, window.summary_notification(&self.node_id)).await;
        }

        if let Err(e) = self.prepare_search().await {
            self.state = RunState::TerminatedError;
            return Err(e);
        }

        tracing::info!(target: "collector_task",
            "Node {} collecting into {} for up to {} minutes.",
            self.node_id, self.config.output_dir.display(), self.deadline.budget().as_secs() / 60);
        notify_best_effort(
            self.notifier,
            Notification::FlowStarted {
                node_id: self.node_id.clone(),
                query: self.query.clone(),
            },
        )
        .await;

        let outcome = self.run(shutdown).await;

        notify_best_effort(
            self.notifier,
            Notification::FlowEnded {
                node_id: self.node_id.clone(),
                query: self.query.clone(),
                final_state: self.state.to_string(),
                novel_records: self.novel_records,
                batches_written: self.batches_written,
            },
        )
        .await;
        outcome
    }

    async fn prepare_search(&self) -> Result<()> {
        self.surface.open(&self.config.feed_url).await?;
        self.surface.submit_search(&self.query).await?;
        self.surface.select_latest().await
    }

    /// Runs until the time budget or the stop threshold ends the run, the
    /// loop fails, or `shutdown` resolves. Failures and interrupts flush
    /// whatever is buffered before the error is returned.
    pub(crate) async fn run<F>(&mut self, shutdown: F) -> Result<RunState>
    where
        F: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            result = self.collect() => Some(result),
            _ = shutdown => None,
        };

        let result = match outcome {
            Some(Ok(state)) => {
                self.state = state;
                Ok(state)
            }
            Some(Err(e)) => {
                tracing::error!(target: "collector_task", "Collection loop failed: {}", e);
                self.state = RunState::TerminatedError;
                self.final_flush(FlushReason::Exception);
                Err(e)
            }
            None => {
                tracing::warn!(target: "collector_task", "Interrupt received. Flushing buffered records.");
                self.state = RunState::TerminatedError;
                self.final_flush(FlushReason::DeliberateCancellation);
                Err(AppError::Interrupted)
            }
        };

        tracing::info!(target: "collector_task",
            "Ledger now holds {} unique keys.", self.ledger.len());
        self.progress.finish_with_message(format!(
            "{}: {} new records in {} batches",
            self.state, self.novel_records, self.batches_written
        ));
        result
    }

    /// Flush on the way out of a failed run. Its own failure is logged; the
    /// error that ended the run is the one reported.
    fn final_flush(&mut self, reason: FlushReason) {
        let state = self.state;
        if let Err(e) = self.flush(reason) {
            tracing::error!(target: "collector_task",
                "Final flush ({:?}) failed, {} records remain unwritten: {}", reason, self.buffer.len(), e);
        }
        self.state = state;
    }

    fn flush(&mut self, reason: FlushReason) -> Result<()> {
        let resume = self.state;
        self.state = RunState::Flushing;
        let now = Local::now().naive_local();
        let outcome = self
            .buffer
            .flush(&mut self.ledger, reason, &self.config.output_dir, now);
        self.state = resume;

        if let Some(outcome) = outcome? {
            self.batches_written += 1;
            self.ledger_keys_appended += outcome.keys_appended as u64;
            tracing::info!(target: "collector_task",
                "Flushed {} records ({:?}); {} batches written this run.", outcome.records, reason, self.batches_written);
            self.files.push(outcome.path);
        }
        Ok(())
    }

    async fn collect(&mut self) -> Result<RunState> {
        loop {
            if self.deadline.is_elapsed() {
                tracing::info!(target: "collector_task", "Maximum run time reached. Flushing and stopping.");
                self.flush(FlushReason::ElapsedTime)?;
                return Ok(RunState::TerminatedTime);
            }
            tracing::info!(target: "collector_task",
                "Time remaining: {}", format_remaining(self.deadline.remaining()));

            if self.novel_records >= self.config.stop_threshold {
                tracing::info!(target: "collector_task",
                    "Stop threshold of {} records reached. Flushing and stopping.", self.config.stop_threshold);
                self.flush(FlushReason::Batch)?;
                return Ok(RunState::TerminatedThreshold);
            }

            self.scroll_passes += 1;
            let mut items = self.surface.feed_items().await?;
            if items.is_empty() {
                items = self.recover_empty_feed().await?;
            }

            let recovered = self.process_items(&items).await;

            if !recovered {
                if let Some(stalled_key) = self.detector.take_problematic() {
                    self.shift_query(&stalled_key).await;
                }
            }

            if self.buffer.should_flush() {
                self.flush(FlushReason::Batch)?;
                tracing::info!(target: "collector_task",
                    "Sleeping for {} seconds after writing.", self.config.timing.flush_pause.as_secs());
                tokio::time::sleep(self.config.timing.flush_pause).await;
            }

            let pause = self.config.timing.random_pause();
            tracing::info!(target: "collector_task", "Sleeping for {:.2} seconds before scrolling.", pause.as_secs_f32());
            tokio::time::sleep(pause).await;
            self.surface.scroll_to_bottom().await?;
            tokio::time::sleep(self.config.timing.settle).await;
        }
    }

    /// Offers every item to the buffer and feeds repeats to the stall
    /// detector. Returns `true` when a retry recovered the feed, which ends
    /// the pass early.
    async fn process_items(&mut self, items: &[FeedItem]) -> bool {
        for item in items {
            let record = match extractor::extract(item) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(target: "collector_task", "Failed to extract data from a feed item: {}", e);
                    continue;
                }
            };
            let key = record.unique_key();
            tracing::debug!(target: "collector_task",
                "Engagements for {}: replies {}, reshares {}, likes {}, views {}",
                key, record.replies, record.reshares, record.likes, record.views);

            if self.buffer.offer(&mut self.ledger, record) {
                self.novel_records += 1;
                tracing::info!(target: "collector_task", "Record with unique key {} added to buffer.", key);
                self.progress.set_message(format!(
                    "{} new records, {} buffered",
                    self.novel_records,
                    self.buffer.len()
                ));
                continue;
            }

            let count = self.detector.observe_repeat(&key);
            if !self.detector.is_stalled(count) {
                continue;
            }
            tracing::warn!(target: "collector_task",
                "Detected a breaking point: {} has been repeated {} times.", key, count);

            if !self.retry_available().await {
                self.detector.mark_problematic(key);
                continue;
            }

            if self.retry_until_unseen().await {
                self.detector.reset();
                notify_best_effort(
                    self.notifier,
                    Notification::RetrySucceeded {
                        node_id: self.node_id.clone(),
                        stalled_key: Some(key),
                    },
                )
                .await;
                return true;
            }
            self.detector.mark_problematic(key);
        }
        false
    }

    async fn retry_available(&self) -> bool {
        match self.surface.has_retry_affordance().await {
            Ok(visible) => {
                if !visible {
                    tracing::info!(target: "collector_task", "'Retry' button not present on the page.");
                }
                visible
            }
            Err(e) => {
                tracing::warn!(target: "collector_task", "Failed to look for the 'Retry' button: {}", e);
                false
            }
        }
    }

    /// Clicks retry until the feed shows a key the ledger has never seen.
    async fn retry_until_unseen(&self) -> bool {
        let timing = &self.config.timing;
        let surface = self.surface;
        let ledger = &self.ledger;
        Recovery::new(timing.retry_click_attempts, timing.retry_click_wait)
            .attempt(
                |attempt| async move {
                    match surface.click_retry().await {
                        Ok(true) => tracing::info!(target: "collector_task", "Clicked Retry button, attempt {}.", attempt),
                        Ok(false) => tracing::info!(target: "collector_task", "'Retry' button vanished on attempt {}.", attempt),
                        Err(e) => tracing::warn!(target: "collector_task", "Failed to click the 'Retry' button: {}", e),
                    }
                },
                || async move {
                    match surface.feed_items().await {
                        Ok(items) => items
                            .iter()
                            .filter_map(|item| extractor::extract(item).ok())
                            .any(|record| !ledger.contains(&record.unique_key())),
                        Err(e) => {
                            tracing::warn!(target: "collector_task", "Failed to read the feed after retry: {}", e);
                            false
                        }
                    }
                },
            )
            .await
    }

    /// Scroll-and-wait rounds for an empty feed, clicking retry when it is
    /// offered. When the feed stays empty the query is shifted back from the
    /// latest buffered record.
    async fn recover_empty_feed(&mut self) -> Result<Vec<FeedItem>> {
        let timing = &self.config.timing;
        let retries = timing.empty_feed_retries;
        let surface = self.surface;

        let recovered = Recovery::new(retries, timing.empty_feed_wait)
            .attempt(
                |attempt| async move {
                    tracing::warn!(target: "collector_task", "No feed items found. Retrying {}/{}...", attempt, retries);
                    if let Err(e) = surface.scroll_to_bottom().await {
                        tracing::warn!(target: "collector_task", "Scroll failed: {}", e);
                    }
                    match surface.has_retry_affordance().await {
                        Ok(true) => {
                            tracing::info!(target: "collector_task", "'Retry' button found. Clicking it to reload content...");
                            if let Err(e) = surface.click_retry().await {
                                tracing::warn!(target: "collector_task", "Failed to click the 'Retry' button: {}", e);
                            }
                        }
                        Ok(false) => tracing::info!(target: "collector_task", "'Retry' button not found."),
                        Err(e) => tracing::warn!(target: "collector_task", "Failed to look for the 'Retry' button: {}", e),
                    }
                },
                || async move {
                    surface
                        .feed_items()
                        .await
                        .map(|items| !items.is_empty())
                        .unwrap_or(false)
                },
            )
            .await;

        if recovered {
            notify_best_effort(
                self.notifier,
                Notification::RetrySucceeded {
                    node_id: self.node_id.clone(),
                    stalled_key: None,
                },
            )
            .await;
            return self.surface.feed_items().await;
        }

        tracing::error!(target: "collector_task", "No feed items found after maximum retries.");
        let anchor = self.buffer.latest().map(|(key, _)| key);
        match anchor {
            Some(key) => {
                tracing::info!(target: "collector_task", "Latest buffered record {} anchors the query shift.", key);
                self.shift_query(&key).await;
            }
            None => tracing::warn!(target: "collector_task",
                "No buffered record available to anchor a query shift."),
        }
        Ok(Vec::new())
    }

    /// Moves the search window back from `stalled_key` and resubmits it.
    /// Never fails the run: a stall is a heuristic condition.
    async fn shift_query(&mut self, stalled_key: &str) {
        tracing::warn!(target: "collector_task",
            "A situation that warrants an update to the search query was found at {}.", stalled_key);
        let shifted = match query::shifted_query(
            stalled_key,
            self.config.shift_until_days,
            self.config.shift_since_days,
        ) {
            Ok(q) => q,
            Err(e) => {
                tracing::error!(target: "collector_task", "Cannot shift the search query: {}", e);
                return;
            }
        };
        tracing::info!(target: "collector_task", "Reconstructed search query: {}", shifted);

        if let Err(e) = self.surface.submit_search(&shifted).await {
            tracing::error!(target: "collector_task", "Error submitting the updated search query: {}", e);
            return;
        }

        self.query = shifted.clone();
        self.query_shifts += 1;
        notify_best_effort(
            self.notifier,
            Notification::SearchQueryUpdate {
                node_id: self.node_id.clone(),
                stalled_key: stalled_key.to_string(),
                query: shifted,
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timing;
    use crate::extractor::fixtures::article;
    use crate::notify::testing::RecordingNotifier;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::Notify;
    use url::Url;

    /// Feed pages served in order; scrolling advances one page.
    #[derive(Default)]
    struct ScriptedSurface {
        pages: Mutex<Vec<Vec<FeedItem>>>,
        cursor: Mutex<usize>,
        /// Past the last page, keep serving it instead of an empty feed.
        sticky: bool,
        retry_visible: bool,
        /// Page shown after the first retry click.
        on_retry: Mutex<Option<Vec<FeedItem>>>,
        searches: Mutex<Vec<String>>,
        /// Setup calls in order: `open`, `search`, `latest`.
        steps: Mutex<Vec<&'static str>>,
        clicks: Mutex<usize>,
        scrolls: Mutex<usize>,
        fail_on_scroll: Option<usize>,
        interrupt_on_scroll: Option<(usize, std::sync::Arc<Notify>)>,
    }

    impl ScriptedSurface {
        fn new(pages: Vec<Vec<FeedItem>>) -> Self {
            Self {
                pages: Mutex::new(pages),
                ..Self::default()
            }
        }

        fn searches(&self) -> Vec<String> {
            self.searches.lock().unwrap().clone()
        }

        fn clicks(&self) -> usize {
            *self.clicks.lock().unwrap()
        }
    }

    #[async_trait]
    impl FeedSurface for ScriptedSurface {
        async fn open(&self, _url: &Url) -> Result<()> {
            self.steps.lock().unwrap().push("open");
            Ok(())
        }

        async fn feed_items(&self) -> Result<Vec<FeedItem>> {
            let pages = self.pages.lock().unwrap();
            let cursor = *self.cursor.lock().unwrap();
            let page = match pages.get(cursor) {
                Some(page) => page.clone(),
                None if self.sticky => pages.last().cloned().unwrap_or_default(),
                None => Vec::new(),
            };
            Ok(page)
        }

        async fn scroll_to_bottom(&self) -> Result<()> {
            let scrolls = {
                let mut scrolls = self.scrolls.lock().unwrap();
                *scrolls += 1;
                *scrolls
            };
            if self.fail_on_scroll == Some(scrolls) {
                return Err(AppError::Browser("tab crashed".into()));
            }
            if let Some((at, notify)) = &self.interrupt_on_scroll {
                if *at == scrolls {
                    notify.notify_one();
                    std::future::pending::<()>().await;
                }
            }
            *self.cursor.lock().unwrap() += 1;
            Ok(())
        }

        async fn has_retry_affordance(&self) -> Result<bool> {
            Ok(self.retry_visible)
        }

        async fn click_retry(&self) -> Result<bool> {
            *self.clicks.lock().unwrap() += 1;
            if let Some(page) = self.on_retry.lock().unwrap().take() {
                let mut pages = self.pages.lock().unwrap();
                pages.push(page);
                *self.cursor.lock().unwrap() = pages.len() - 1;
            }
            Ok(self.retry_visible)
        }

        async fn submit_search(&self, query: &str) -> Result<()> {
            self.steps.lock().unwrap().push("search");
            self.searches.lock().unwrap().push(query.to_string());
            Ok(())
        }

        async fn select_latest(&self) -> Result<()> {
            self.steps.lock().unwrap().push("latest");
            Ok(())
        }
    }

    fn item(handle: &str, posted_at: &str) -> FeedItem {
        FeedItem::new(article("Maker", handle, posted_at, "print farm update"))
    }

    struct Fixture {
        _root: TempDir,
        config: Config,
    }

    impl Fixture {
        fn new(batch_size: usize) -> Self {
            let root = TempDir::new().unwrap();
            fs::write(root.path().join("node1_unique_keys.csv"), "").unwrap();
            let config = Config {
                output_dir: root.path().join("node1"),
                batch_size,
                timing: Timing::immediate(),
                ..Config::default()
            };
            Self {
                _root: root,
                config,
            }
        }

        fn ledger(&self) -> UniqueKeyLedger {
            UniqueKeyLedger::load_for_output(&self.config.output_dir).unwrap().1
        }

        fn written_files(&self) -> Vec<PathBuf> {
            let mut files: Vec<PathBuf> = fs::read_dir(&self.config.output_dir)
                .map(|dir| dir.map(|e| e.unwrap().path()).collect())
                .unwrap_or_default();
            files.sort();
            files
        }

        fn rows(path: &PathBuf) -> usize {
            csv::Reader::from_path(path).unwrap().records().count()
        }
    }

    fn collector<'a>(
        fx: &'a Fixture,
        surface: &'a ScriptedSurface,
        notifier: &'a RecordingNotifier,
        deadline: Deadline,
    ) -> Collector<'a> {
        Collector::new(
            &fx.config,
            surface,
            notifier,
            "node1".into(),
            fx.ledger(),
            "initial query".into(),
            deadline,
        )
    }

    #[test]
    fn test_deadline_truncates_to_whole_minutes() {
        let deadline = Deadline::from_hours(1.5).unwrap();
        assert_eq!(deadline.budget(), Duration::from_secs(90 * 60));
        let deadline = Deadline::from_hours(0.2575).unwrap();
        assert_eq!(deadline.budget(), Duration::from_secs(15 * 60));
        assert!(matches!(Deadline::from_hours(0.0), Err(AppError::Config(_))));
        assert!(matches!(Deadline::from_hours(-2.0), Err(AppError::Config(_))));
    }

    #[test]
    fn test_deadline_out_of_range_is_config_error() {
        // Fits the seconds counter but not the clock.
        assert!(matches!(Deadline::from_hours(3.0e15), Err(AppError::Config(_))));
        // Overflows the seconds counter.
        assert!(matches!(Deadline::from_hours(1.0e16), Err(AppError::Config(_))));
        assert!(matches!(Deadline::from_hours(f64::MAX), Err(AppError::Config(_))));
    }

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(Duration::from_secs(3 * 3600 + 65)), "3h 01m 05s");
    }

    #[tokio::test]
    async fn test_repeated_key_triggers_recovery_after_threshold() {
        let mut fx = Fixture::new(2);
        fx.config.stop_threshold = 4;
        let a = item("@a", "2024-03-10T10:00:00.000Z");
        let b = item("@b", "2024-03-10T11:00:00.000Z");
        let c = item("@c", "2024-03-10T12:00:00.000Z");
        let d = item("@d", "2024-03-09T08:00:00.000Z");
        let mut page = vec![a.clone(), b, a.clone(), c];
        page.extend(std::iter::repeat(a).take(8));

        let surface = ScriptedSurface {
            sticky: true,
            retry_visible: true,
            on_retry: Mutex::new(Some(vec![d])),
            ..ScriptedSurface::new(vec![page])
        };
        let notifier = RecordingNotifier::default();
        let mut collector = collector(&fx, &surface, &notifier, Deadline::after(Duration::from_secs(3600)));

        let state = collector.run(std::future::pending()).await.unwrap();
        assert_eq!(state, RunState::TerminatedThreshold);

        // Pass one: {A, B, C} buffered and flushed together; nine repeats of A.
        // Pass two: the eleventh sighting triggers the retry, which reveals D.
        let sent = notifier.sent();
        assert_eq!(
            sent,
            vec![Notification::RetrySucceeded {
                node_id: "node1".into(),
                stalled_key: Some("2024-03-10T10:00:00.000Z_@a".into()),
            }]
        );

        let summary = collector.summary();
        assert_eq!(summary.novel_records, 4);
        assert_eq!(summary.batches_written, 2);
        assert_eq!(summary.query_shifts, 0);
        let files = fx.written_files();
        assert_eq!(files.len(), 2);
        let mut rows: Vec<usize> = files.iter().map(Fixture::rows).collect();
        rows.sort();
        assert_eq!(rows, vec![1, 3]);
        assert!(surface.searches().is_empty());
    }

    #[tokio::test]
    async fn test_stall_without_retry_shifts_query_and_interrupt_flushes() {
        let mut fx = Fixture::new(10);
        fx.config.repeat_threshold = 2;
        let trigger = std::sync::Arc::new(Notify::new());
        let surface = ScriptedSurface {
            sticky: true,
            interrupt_on_scroll: Some((4, trigger.clone())),
            ..ScriptedSurface::new(vec![vec![
                item("@a", "2023-12-11T23:19:17.000Z"),
                item("@b", "2023-12-11T20:00:00.000Z"),
            ]])
        };
        // Delivery failures must not stop the run.
        let notifier = RecordingNotifier::failing();
        let mut collector = collector(&fx, &surface, &notifier, Deadline::after(Duration::from_secs(3600)));

        let shutdown = async move { trigger.notified().await };
        let err = collector.run(shutdown).await.unwrap_err();
        assert!(matches!(err, AppError::Interrupted));
        assert_eq!(collector.state(), RunState::TerminatedError);

        let expected = query::shifted_query("2023-12-11T23:19:17.000Z_@a", 1, 6).unwrap();
        assert_eq!(surface.searches(), vec![expected.clone()]);
        assert_eq!(collector.query(), expected);
        assert!(notifier.sent().iter().any(|n| matches!(
            n,
            Notification::SearchQueryUpdate { stalled_key, .. } if stalled_key == "2023-12-11T23:19:17.000Z_@a"
        )));

        let files = fx.written_files();
        assert_eq!(files.len(), 1);
        assert!(files[0].to_string_lossy().ends_with("_delibratecancellation.csv"));
        assert_eq!(Fixture::rows(&files[0]), 2);
        assert_eq!(fx.ledger().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_budget_flushes_and_stops() {
        let mut fx = Fixture::new(500);
        fx.config.timing.settle = Duration::from_secs(60);
        let surface = ScriptedSurface::new(vec![
            vec![item("@a", "2024-03-10T10:00:00.000Z")],
            vec![item("@b", "2024-03-10T09:00:00.000Z")],
            vec![item("@c", "2024-03-10T08:00:00.000Z")],
        ]);
        let notifier = RecordingNotifier::default();
        let mut collector = collector(&fx, &surface, &notifier, Deadline::after(Duration::from_secs(90)));

        let state = collector.run(std::future::pending()).await.unwrap();
        assert_eq!(state, RunState::TerminatedTime);

        let files = fx.written_files();
        assert_eq!(files.len(), 1);
        assert!(files[0].to_string_lossy().ends_with("_elapsedtime.csv"));
        assert_eq!(Fixture::rows(&files[0]), 2);
        assert_eq!(collector.summary().scroll_passes, 2);
    }

    #[tokio::test]
    async fn test_loop_failure_flushes_then_propagates() {
        let fx = Fixture::new(10);
        let surface = ScriptedSurface {
            fail_on_scroll: Some(1),
            ..ScriptedSurface::new(vec![vec![
                item("@a", "2024-03-10T10:00:00.000Z"),
                item("@b", "2024-03-10T09:00:00.000Z"),
            ]])
        };
        let notifier = RecordingNotifier::default();
        let mut collector = collector(&fx, &surface, &notifier, Deadline::after(Duration::from_secs(3600)));

        let err = collector.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, AppError::Browser(_)));
        assert_eq!(collector.state(), RunState::TerminatedError);

        let files = fx.written_files();
        assert_eq!(files.len(), 1);
        assert!(files[0].to_string_lossy().ends_with("_exception.csv"));
        let ledger = fx.ledger();
        assert!(ledger.contains("2024-03-10T10:00:00.000Z_@a"));
        assert!(ledger.contains("2024-03-10T09:00:00.000Z_@b"));
    }

    #[tokio::test]
    async fn test_empty_feed_shifts_from_latest_buffered_record() {
        let fx = Fixture::new(10);
        let trigger = std::sync::Arc::new(Notify::new());
        let surface = ScriptedSurface {
            interrupt_on_scroll: Some((1 + fx.config.timing.empty_feed_retries as usize + 1, trigger.clone())),
            ..ScriptedSurface::new(vec![vec![
                item("@a", "2024-03-10T10:00:00.000Z"),
                item("@b", "2024-03-12T10:00:00.000Z"),
            ]])
        };
        let notifier = RecordingNotifier::default();
        let mut collector = collector(&fx, &surface, &notifier, Deadline::after(Duration::from_secs(3600)));

        let shutdown = async move { trigger.notified().await };
        assert!(collector.run(shutdown).await.is_err());

        let expected = query::shifted_query("2024-03-12T10:00:00.000Z_@b", 1, 6).unwrap();
        assert_eq!(surface.searches(), vec![expected]);
        assert_eq!(collector.summary().query_shifts, 1);
    }

    #[tokio::test]
    async fn test_empty_feed_recovers_through_retry() {
        let mut fx = Fixture::new(10);
        fx.config.stop_threshold = 2;
        let surface = ScriptedSurface {
            retry_visible: true,
            on_retry: Mutex::new(Some(vec![item("@b", "2024-03-09T10:00:00.000Z")])),
            ..ScriptedSurface::new(vec![vec![item("@a", "2024-03-10T10:00:00.000Z")]])
        };
        let notifier = RecordingNotifier::default();
        let mut collector = collector(&fx, &surface, &notifier, Deadline::after(Duration::from_secs(3600)));

        let state = collector.run(std::future::pending()).await.unwrap();
        assert_eq!(state, RunState::TerminatedThreshold);
        assert_eq!(
            notifier.sent(),
            vec![Notification::RetrySucceeded {
                node_id: "node1".into(),
                stalled_key: None,
            }]
        );
        assert!(surface.searches().is_empty());

        let files = fx.written_files();
        assert_eq!(files.len(), 1);
        assert!(files[0].to_string_lossy().ends_with("_03_2024.csv"));
        assert_eq!(Fixture::rows(&files[0]), 2);
    }

    #[tokio::test]
    async fn test_every_stalled_key_gets_its_own_retry() {
        let mut fx = Fixture::new(10);
        fx.config.repeat_threshold = 2;
        let a = item("@a", "2023-12-11T23:19:17.000Z");
        let b = item("@b", "2023-12-11T20:00:00.000Z");
        let trigger = std::sync::Arc::new(Notify::new());
        // Both keys go over the threshold in the first pass and the retry
        // control never brings anything new.
        let surface = ScriptedSurface {
            retry_visible: true,
            interrupt_on_scroll: Some((1, trigger.clone())),
            ..ScriptedSurface::new(vec![vec![
                a.clone(),
                b.clone(),
                a.clone(),
                a.clone(),
                a,
                b.clone(),
                b.clone(),
                b,
            ]])
        };
        let notifier = RecordingNotifier::default();
        let mut collector = collector(&fx, &surface, &notifier, Deadline::after(Duration::from_secs(3600)));

        let shutdown = async move { trigger.notified().await };
        assert!(matches!(collector.run(shutdown).await, Err(AppError::Interrupted)));

        assert_eq!(surface.clicks(), 2 * fx.config.timing.retry_click_attempts as usize);
        let expected = query::shifted_query("2023-12-11T23:19:17.000Z_@a", 1, 6).unwrap();
        assert_eq!(surface.searches(), vec![expected]);
        assert_eq!(collector.summary().query_shifts, 1);
        assert!(
            !notifier
                .sent()
                .iter()
                .any(|n| matches!(n, Notification::RetrySucceeded { .. }))
        );
    }

    fn anchored_window(anchor: &str) -> QueryWindow {
        let anchor = chrono::NaiveDateTime::parse_from_str(anchor, "%Y-%m-%d %H:%M:%S").unwrap();
        query::window_from_anchor(anchor, 10)
    }

    fn sweeping<'a>(
        fx: &'a Fixture,
        surface: &'a ScriptedSurface,
        notifier: &'a RecordingNotifier,
        window: &QueryWindow,
    ) -> Collector<'a> {
        Collector::new(
            &fx.config,
            surface,
            notifier,
            "node1".into(),
            fx.ledger(),
            window.query.clone(),
            Deadline::after(Duration::from_secs(3600)),
        )
    }

    #[tokio::test]
    async fn test_sweep_brackets_the_run_with_flow_notifications() {
        let mut fx = Fixture::new(10);
        fx.config.stop_threshold = 1;
        let window = anchored_window("2024-03-10 12:00:00");
        assert!(window.needs_summary);
        let surface = ScriptedSurface::new(vec![vec![item("@a", "2024-03-10T10:00:00.000Z")]]);
        let notifier = RecordingNotifier::default();
        let mut collector = sweeping(&fx, &surface, &notifier, &window);

        let state = collector.sweep(&window, std::future::pending()).await.unwrap();
        assert_eq!(state, RunState::TerminatedThreshold);
        assert_eq!(*surface.steps.lock().unwrap(), vec!["open", "search", "latest"]);
        assert_eq!(surface.searches(), vec![window.query.clone()]);

        assert_eq!(
            notifier.sent(),
            vec![
                window.summary_notification("node1"),
                Notification::FlowStarted {
                    node_id: "node1".into(),
                    query: window.query.clone(),
                },
                Notification::FlowEnded {
                    node_id: "node1".into(),
                    query: window.query.clone(),
                    final_state: "TERMINATED_THRESHOLD".into(),
                    novel_records: 1,
                    batches_written: 1,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_sweep_reports_flow_end_after_a_failed_run() {
        let fx = Fixture::new(10);
        let window = anchored_window("2024-03-10 19:30:00");
        assert!(!window.needs_summary);
        let surface = ScriptedSurface {
            fail_on_scroll: Some(1),
            ..ScriptedSurface::new(vec![vec![item("@a", "2024-03-10T10:00:00.000Z")]])
        };
        let notifier = RecordingNotifier::default();
        let mut collector = sweeping(&fx, &surface, &notifier, &window);

        let err = collector.sweep(&window, std::future::pending()).await.unwrap_err();
        assert!(matches!(err, AppError::Browser(_)));

        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], Notification::FlowStarted { .. }));
        assert_eq!(
            sent[1],
            Notification::FlowEnded {
                node_id: "node1".into(),
                query: window.query.clone(),
                final_state: "TERMINATED_ERROR".into(),
                novel_records: 1,
                batches_written: 1,
            }
        );
    }
}
