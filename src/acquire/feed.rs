// src/acquire/feed.rs
use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use super::html::html_to_text;
use super::{ContentAcquisitionStrategy, FetchedContent};
use crate::error::FetchError;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    title: Option<String>,
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

/// One usable feed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    /// Unix seconds, 0 when absent or unparseable.
    pub published_at: i64,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFeed {
    pub title: String,
    pub entries: Vec<FeedEntry>,
}

fn parse_rfc2822_to_unix(ts: &str) -> i64 {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
        .unwrap_or(0)
}

/// Parse an RSS 2.0 document. Entries without a link are dropped.
pub fn parse_feed(xml: &str) -> Result<ParsedFeed, quick_xml::DeError> {
    let rss: Rss = from_str(xml)?;
    let entries = rss
        .channel
        .item
        .into_iter()
        .filter_map(|it| {
            let link = it.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty())?;
            Some(FeedEntry {
                title: it.title.as_deref().map(html_to_text).unwrap_or_default(),
                link,
                published_at: it.pub_date.as_deref().map(parse_rfc2822_to_unix).unwrap_or(0),
                summary: it.description.as_deref().map(html_to_text).unwrap_or_default(),
            })
        })
        .collect();
    Ok(ParsedFeed {
        title: rss.channel.title.unwrap_or_default().trim().to_string(),
        entries,
    })
}

/// Syndication feed strategy: the feed itself is the listing, its entry links are the
/// articles.
pub struct FeedStrategy {
    client: reqwest::Client,
    max_entries: usize,
}

impl FeedStrategy {
    pub fn new(timeout: Duration, max_entries: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stock-news-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            max_entries,
        })
    }

    /// Turn an already downloaded feed body into fetched content.
    pub fn from_body(&self, url: &str, xml: &str) -> Result<FetchedContent, FetchError> {
        let t0 = std::time::Instant::now();
        let feed = parse_feed(xml).map_err(|e| FetchError::network(url, format!("invalid feed: {e}")))?;

        let mut seen = std::collections::HashSet::new();
        let links: Vec<String> = feed
            .entries
            .iter()
            .filter(|e| seen.insert(e.link.clone()))
            .take(self.max_entries)
            .map(|e| e.link.clone())
            .collect();

        let content = feed
            .entries
            .iter()
            .map(|e| format!("{}. {}", e.title, e.summary))
            .collect::<Vec<_>>()
            .join("\n");

        let mut metadata = BTreeMap::new();
        if !feed.title.is_empty() {
            metadata.insert("feed_title".to_string(), feed.title.clone());
        }
        metadata.insert("feed_entries".to_string(), feed.entries.len().to_string());

        histogram!("feed_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("feed_entries_total").increment(links.len() as u64);

        Ok(FetchedContent::new(url, content)
            .with_html(xml.to_string())
            .with_metadata(metadata)
            .with_article_links(links))
    }
}

#[async_trait]
impl ContentAcquisitionStrategy for FeedStrategy {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;
        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(FetchError::blocked(url, format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(FetchError::network(url, format!("HTTP {}", status.as_u16())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;
        self.from_body(url, &body)
    }

    fn name(&self) -> &'static str {
        "feed"
    }
}
