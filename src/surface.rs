//! The capability the collector needs from a browser.

use crate::error::{AppError, Result};
use crate::extractor::{FeedItem, split_feed};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use url::Url;

/// An already-authenticated view of the search feed.
///
/// Implementations talk to a real browser or replay saved pages; the
/// collector only ever sees this trait.
#[async_trait]
pub(crate) trait FeedSurface: Send + Sync {
    /// Navigates to the landing page before the first search.
    async fn open(&self, _url: &Url) -> Result<()> {
        Ok(())
    }

    /// Feed items currently rendered, in page order.
    async fn feed_items(&self) -> Result<Vec<FeedItem>>;

    /// Scrolls to the end of the page so the feed loads more items.
    async fn scroll_to_bottom(&self) -> Result<()>;

    /// Whether the feed shows its "Retry" control.
    async fn has_retry_affordance(&self) -> Result<bool>;

    /// Clicks the "Retry" control. Returns `false` when there was none.
    async fn click_retry(&self) -> Result<bool>;

    /// Replaces the current search with `query` and submits it.
    async fn submit_search(&self, query: &str) -> Result<()>;

    /// Switches the results to the most-recent ordering.
    async fn select_latest(&self) -> Result<()>;
}

/// Replays saved feed pages from a folder, one page per scroll.
///
/// Pages are the `.html` files of the folder in name order. Scrolling past
/// the last page yields an empty feed. There is never a retry control.
#[derive(Debug)]
pub(crate) struct SnapshotSurface {
    pages: Vec<PathBuf>,
    cursor: Mutex<usize>,
}

impl SnapshotSurface {
    pub(crate) fn from_dir(dir: &Path) -> Result<Self> {
        let mut pages = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"))
            {
                pages.push(path);
            }
        }
        if pages.is_empty() {
            return Err(AppError::Config(format!(
                "Snapshot folder '{}' holds no .html pages",
                dir.display()
            )));
        }
        pages.sort();
        tracing::info!(target: "browser_task",
            "Replaying {} saved pages from {}", pages.len(), dir.display());
        Ok(Self {
            pages,
            cursor: Mutex::new(0),
        })
    }

    fn position(&self) -> Result<usize> {
        self.cursor
            .lock()
            .map(|cursor| *cursor)
            .map_err(|_| AppError::Browser("snapshot cursor lock poisoned".to_string()))
    }
}

#[async_trait]
impl FeedSurface for SnapshotSurface {
    async fn feed_items(&self) -> Result<Vec<FeedItem>> {
        let Some(page) = self.pages.get(self.position()?) else {
            return Ok(Vec::new());
        };
        let html = tokio::fs::read_to_string(page).await?;
        Ok(split_feed(&html))
    }

    async fn scroll_to_bottom(&self) -> Result<()> {
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|_| AppError::Browser("snapshot cursor lock poisoned".to_string()))?;
        if *cursor < self.pages.len() {
            *cursor += 1;
        }
        tracing::debug!(target: "browser_task", "Snapshot advanced to page {}", *cursor);
        Ok(())
    }

    async fn has_retry_affordance(&self) -> Result<bool> {
        Ok(false)
    }

    async fn click_retry(&self) -> Result<bool> {
        Ok(false)
    }

    async fn submit_search(&self, query: &str) -> Result<()> {
        tracing::info!(target: "browser_task", "Snapshot replay ignores search: {}", query);
        Ok(())
    }

    async fn select_latest(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::fixtures::{article, page};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_replays_pages_in_order() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("02.html"),
            page(&[article("B", "@b", "2024-03-10T11:00:00.000Z", "second")]),
        )
        .unwrap();
        fs::write(
            dir.path().join("01.html"),
            page(&[
                article("A", "@a", "2024-03-10T10:00:00.000Z", "first"),
                article("C", "@c", "2024-03-10T09:00:00.000Z", "third"),
            ]),
        )
        .unwrap();
        fs::write(dir.path().join("readme.txt"), "ignored").unwrap();

        let surface = SnapshotSurface::from_dir(dir.path()).unwrap();
        assert_eq!(surface.feed_items().await.unwrap().len(), 2);
        surface.scroll_to_bottom().await.unwrap();
        assert_eq!(surface.feed_items().await.unwrap().len(), 1);
        surface.scroll_to_bottom().await.unwrap();
        assert!(surface.feed_items().await.unwrap().is_empty());
        surface.scroll_to_bottom().await.unwrap();
        assert!(surface.feed_items().await.unwrap().is_empty());
        assert!(!surface.has_retry_affordance().await.unwrap());
    }

    #[test]
    fn test_empty_snapshot_folder_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SnapshotSurface::from_dir(dir.path()),
            Err(AppError::Config(_))
        ));
    }
}
