// src/acquire/mod.rs
//! Content acquisition: one strategy per source type behind a common trait.

pub mod feed;
pub mod html;
pub mod web;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::dedup::content_hash;
use crate::error::FetchError;
use crate::state::SourceType;

pub use feed::FeedStrategy;
pub use web::WebStrategy;

/// Result of one successful acquisition.
#[derive(Debug, Clone, Serialize)]
pub struct FetchedContent {
    pub url: String,
    /// Extracted plain text.
    pub content: String,
    /// Raw markup when the strategy had one (used for link extraction).
    pub html: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub content_hash: String,
    /// Set when the strategy already knows the page is a listing (feeds).
    pub article_links: Option<Vec<String>>,
}

impl FetchedContent {
    pub fn new(url: impl Into<String>, content: String) -> Self {
        let content_hash = content_hash(&content);
        Self {
            url: url.into(),
            content,
            html: None,
            metadata: BTreeMap::new(),
            content_hash,
            article_links: None,
        }
    }

    pub fn with_html(mut self, html: String) -> Self {
        self.html = Some(html);
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_article_links(mut self, links: Vec<String>) -> Self {
        self.article_links = Some(links);
        self
    }
}

#[async_trait]
pub trait ContentAcquisitionStrategy: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError>;
    fn name(&self) -> &'static str;
}

/// Strategy registry keyed by source type.
#[derive(Clone, Default)]
pub struct StrategySet {
    by_type: HashMap<SourceType, Arc<dyn ContentAcquisitionStrategy>>,
}

impl StrategySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        source_type: SourceType,
        strategy: Arc<dyn ContentAcquisitionStrategy>,
    ) -> Self {
        self.by_type.insert(source_type, strategy);
        self
    }

    pub fn register(
        &mut self,
        source_type: SourceType,
        strategy: Arc<dyn ContentAcquisitionStrategy>,
    ) {
        self.by_type.insert(source_type, strategy);
    }

    pub fn get(&self, source_type: SourceType) -> Option<Arc<dyn ContentAcquisitionStrategy>> {
        self.by_type.get(&source_type).cloned()
    }
}

impl std::fmt::Debug for StrategySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self
            .by_type
            .iter()
            .map(|(t, s)| format!("{t}={}", s.name()))
            .collect();
        names.sort();
        f.debug_struct("StrategySet").field("strategies", &names).finish()
    }
}
