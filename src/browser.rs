//! Chrome DevTools implementation of [`FeedSurface`].
//!
//! Attaches to a browser the operator already started and logged in; this
//! module never launches Chrome or handles credentials.

use crate::error::{AppError, Result};
use crate::extractor::{FeedItem, split_feed};
use crate::surface::FeedSurface;
use async_trait::async_trait;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use std::time::Duration;
use url::Url;

const SCROLL_SCRIPT: &str = "window.scrollBy(0, document.body.scrollHeight); true";

const HAS_RETRY_SCRIPT: &str = r#"
    Array.from(document.querySelectorAll('button'))
        .some(b => Array.from(b.querySelectorAll('span')).some(s => s.textContent.trim() === 'Retry'))
"#;

const CLICK_RETRY_SCRIPT: &str = r#"
    (() => {
        const button = Array.from(document.querySelectorAll('button'))
            .find(b => Array.from(b.querySelectorAll('span')).some(s => s.textContent.trim() === 'Retry'));
        if (!button) { return false; }
        button.click();
        return true;
    })()
"#;

const CLICK_LATEST_SCRIPT: &str = r#"
    (() => {
        const tab = Array.from(document.querySelectorAll('span'))
            .find(s => s.textContent.trim() === 'Latest');
        if (!tab) { return false; }
        tab.click();
        return true;
    })()
"#;

const CLEAR_SEARCH_SCRIPT: &str = r#"
    (() => {
        const input = document.querySelector('[placeholder="Search"]');
        if (!input) { return false; }
        input.focus();
        input.select();
        document.execCommand('delete');
        return true;
    })()
"#;

const SEARCH_INPUT: &str = r#"[placeholder="Search"]"#;

fn cdp_err(context: &str, err: impl std::fmt::Display) -> AppError {
    AppError::Browser(format!("{}: {}", context, err))
}

/// A single tab of a remote Chrome reached over DevTools.
pub(crate) struct ChromeSurface {
    // Dropping the browser closes the connection, so it is kept alongside the page.
    _browser: Browser,
    page: Page,
    step_wait: Duration,
}

impl ChromeSurface {
    /// Connects to the DevTools HTTP endpoint (e.g. `http://127.0.0.1:9222`)
    /// and opens a fresh tab.
    pub(crate) async fn connect(devtools: &Url, step_wait: Duration) -> Result<Self> {
        let version_url = devtools.join("json/version")?;
        tracing::info!(target: "browser_task", "Connecting to remote browser at {}", devtools);

        let info: serde_json::Value = reqwest::Client::new()
            .get(version_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let ws_url = info
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Browser("No webSocketDebuggerUrl in response".to_string()))?;
        tracing::info!(target: "browser_task", "Connecting to WebSocket: {}", ws_url);

        let (browser, mut handler) = Browser::connect(ws_url)
            .await
            .map_err(|e| cdp_err("Failed to connect to remote browser", e))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| cdp_err("Failed to open a tab", e))?;

        Ok(Self {
            _browser: browser,
            page,
            step_wait,
        })
    }

    async fn eval_bool(&self, script: &str) -> Result<bool> {
        let result = self
            .page
            .evaluate(script.to_string())
            .await
            .map_err(|e| cdp_err("Script evaluation failed", e))?;
        Ok(result.into_value::<bool>().unwrap_or(false))
    }
}

#[async_trait]
impl FeedSurface for ChromeSurface {
    async fn open(&self, url: &Url) -> Result<()> {
        self.page
            .goto(url.as_str())
            .await
            .map_err(|e| cdp_err("Navigation failed", e))?;
        tokio::time::sleep(self.step_wait).await;
        tracing::info!(target: "browser_task", "Opened {}", url);
        Ok(())
    }

    async fn feed_items(&self) -> Result<Vec<FeedItem>> {
        let html = self
            .page
            .content()
            .await
            .map_err(|e| cdp_err("Failed to read page content", e))?;
        Ok(split_feed(&html))
    }

    async fn scroll_to_bottom(&self) -> Result<()> {
        self.eval_bool(SCROLL_SCRIPT).await?;
        Ok(())
    }

    async fn has_retry_affordance(&self) -> Result<bool> {
        self.eval_bool(HAS_RETRY_SCRIPT).await
    }

    async fn click_retry(&self) -> Result<bool> {
        let clicked = self.eval_bool(CLICK_RETRY_SCRIPT).await?;
        if clicked {
            tracing::info!(target: "browser_task", "Clicked 'Retry' button.");
        }
        Ok(clicked)
    }

    async fn submit_search(&self, query: &str) -> Result<()> {
        let input = self
            .page
            .find_element(SEARCH_INPUT)
            .await
            .map_err(|e| cdp_err("Search box not found", e))?;
        input
            .click()
            .await
            .map_err(|e| cdp_err("Could not focus the search box", e))?;
        tokio::time::sleep(self.step_wait).await;

        if !self.eval_bool(CLEAR_SEARCH_SCRIPT).await? {
            tracing::warn!(target: "browser_task", "Search box could not be cleared.");
        }
        input
            .type_str(query)
            .await
            .map_err(|e| cdp_err("Typing the query failed", e))?;
        tokio::time::sleep(self.step_wait).await;

        input
            .press_key("Enter")
            .await
            .map_err(|e| cdp_err("Submitting the query failed", e))?;
        tokio::time::sleep(self.step_wait).await;
        tracing::info!(target: "browser_task", "Entered search query: {}", query);
        Ok(())
    }

    async fn select_latest(&self) -> Result<()> {
        if self.eval_bool(CLICK_LATEST_SCRIPT).await? {
            tracing::info!(target: "browser_task", "Clicked on the 'Latest' option.");
            tokio::time::sleep(self.step_wait).await;
        } else {
            tracing::error!(target: "browser_task", "Could not find the 'Latest' option.");
        }
        Ok(())
    }
}
