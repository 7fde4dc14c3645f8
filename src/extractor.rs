//! Turns feed markup into records.
//!
//! Extraction never fails the batch: missing bylines and text fall back to
//! sentinel strings and missing engagement counts to zero. Only an item
//! without a timestamp is rejected, since it cannot be keyed.

use crate::error::AppError;
use crate::models::{Record, UNKNOWN_AUTHOR, UNKNOWN_POST_CONTENT};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

/// Opaque handle for one feed item: the outer HTML of its `<article>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FeedItem {
    html: String,
}

impl FeedItem {
    pub(crate) fn new(html: impl Into<String>) -> Self {
        Self { html: html.into() }
    }

    pub(crate) fn html(&self) -> &str {
        &self.html
    }
}

static FEED_ARTICLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.css-175oi2r > article").expect("static selector"));
static ANY_ARTICLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("article").expect("static selector"));
static AUTHOR_NAME: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("span.css-1jxf684.r-bcqeeo.r-qvutc0").expect("static selector")
});
static AUTHOR_ID: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("div.css-175oi2r > div > div.css-175oi2r > a > div > span")
        .expect("static selector")
});
static TIME: Lazy<Selector> = Lazy::new(|| Selector::parse("time").expect("static selector"));
static POST_TEXT: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"div[data-testid="tweetText"]"#).expect("static selector"));
static SPAN: Lazy<Selector> = Lazy::new(|| Selector::parse("span").expect("static selector"));
static ARIA_LABELLED_DIV: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div[aria-label]").expect("static selector"));

static REPLIES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*(reply|replies)").expect("static regex"));
static RESHARES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*(reposts?|shares?)").expect("static regex"));
static LIKES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d+)\s*likes?").expect("static regex"));
static VIEWS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d+)\s*views?").expect("static regex"));

const ENGAGEMENT_KEYWORDS: [&str; 5] = ["reply", "reposts", "likes", "bookmarks", "views"];

/// Splits a page into feed items. Articles inside the feed container are
/// preferred; a page without that container falls back to every `<article>`.
pub(crate) fn split_feed(page_html: &str) -> Vec<FeedItem> {
    let document = Html::parse_document(page_html);
    let mut items: Vec<FeedItem> = document
        .select(&FEED_ARTICLE)
        .map(|article| FeedItem::new(article.html()))
        .collect();
    if items.is_empty() {
        items = document
            .select(&ANY_ARTICLE)
            .map(|article| FeedItem::new(article.html()))
            .collect();
    }
    tracing::debug!(target: "extract_task", "Split page into {} feed items.", items.len());
    items
}

fn first_text(root: ElementRef<'_>, selector: &Selector) -> Option<String> {
    root.select(selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty())
}

fn capture_count(regex: &Regex, label: &str) -> u64 {
    regex
        .captures(label)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Replies, likes, reshares, views from the first engagement `aria-label`.
fn engagement(root: ElementRef<'_>) -> (u64, u64, u64, u64) {
    let label = root
        .select(&ARIA_LABELLED_DIV)
        .filter_map(|el| el.value().attr("aria-label"))
        .find(|label| {
            let lower = label.to_lowercase();
            ENGAGEMENT_KEYWORDS.iter().any(|k| lower.contains(k))
        });

    match label {
        Some(label) => (
            capture_count(&REPLIES, label),
            capture_count(&LIKES, label),
            capture_count(&RESHARES, label),
            capture_count(&VIEWS, label),
        ),
        None => {
            tracing::debug!(target: "extract_task", "No engagement elements found.");
            (0, 0, 0, 0)
        }
    }
}

/// Extracts one record from a feed item.
pub(crate) fn extract(item: &FeedItem) -> Result<Record, AppError> {
    let fragment = Html::parse_fragment(item.html());
    let root = fragment
        .select(&ANY_ARTICLE)
        .next()
        .unwrap_or_else(|| fragment.root_element());

    let posted_at = root
        .select(&TIME)
        .next()
        .and_then(|t| t.value().attr("datetime"))
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| AppError::Extraction("feed item has no <time datetime>".to_string()))?
        .to_string();

    let author_name = first_text(root, &AUTHOR_NAME).unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());
    let author_id = first_text(root, &AUTHOR_ID);

    let text = match root.select(&POST_TEXT).next() {
        Some(block) => block
            .select(&SPAN)
            .map(|span| span.text().collect::<String>())
            .filter(|t| !t.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        None => UNKNOWN_POST_CONTENT.to_string(),
    };

    let (replies, likes, reshares, views) = engagement(root);

    Ok(Record {
        author_name,
        author_id,
        posted_at,
        text,
        replies,
        likes,
        reshares,
        views,
    })
}
