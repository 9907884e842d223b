// src/storage.rs
//! Persistence collaborator. The pipeline only talks to storage through [`Storage`];
//! the relational schema and engine are owned elsewhere. [`MemoryStorage`] backs tests
//! and the standalone binary.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::state::{ArticleAnalysis, StockMention};

pub type ArticleId = i64;
pub type SourceId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Pending,
    Error,
}

/// Article ready to be persisted together with its stock mentions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewArticle {
    pub source_id: SourceId,
    pub url: String,
    pub content: String,
    pub content_hash: String,
    pub analysis: ArticleAnalysis,
    pub stock_mentions: Vec<StockMention>,
    pub metadata: std::collections::BTreeMap<String, String>,
    /// Stage timings in milliseconds, stored as processing log rows by real backends.
    pub timings: std::collections::BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredArticle {
    pub id: ArticleId,
    pub fetched_at: DateTime<Utc>,
    #[serde(flatten)]
    pub article: NewArticle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceHealthUpdate {
    pub source_id: SourceId,
    pub status: HealthStatus,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist an article. Content hashes are unique: a second article with the same
    /// hash fails with [`PersistenceError::Conflict`].
    async fn create_article(&self, article: NewArticle) -> Result<ArticleId, PersistenceError>;

    async fn update_source_health(
        &self,
        source_id: SourceId,
        status: HealthStatus,
        error: Option<String>,
    ) -> Result<(), PersistenceError>;

    async fn find_by_content_hash(&self, hash: &str)
        -> Result<Option<ArticleId>, PersistenceError>;

    /// Retention sweep. Backends without retention keep everything.
    async fn purge_older_than(&self, _cutoff: DateTime<Utc>) -> Result<usize, PersistenceError> {
        Ok(0)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: ArticleId,
    articles: Vec<StoredArticle>,
    by_hash: HashMap<String, ArticleId>,
    health: Vec<SourceHealthUpdate>,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn articles(&self) -> Vec<StoredArticle> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).articles.clone()
    }

    pub fn article_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).articles.len()
    }

    pub fn health_updates(&self) -> Vec<SourceHealthUpdate> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).health.clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_article(&self, article: NewArticle) -> Result<ArticleId, PersistenceError> {
        let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(&existing) = g.by_hash.get(&article.content_hash) {
            return Err(PersistenceError::Conflict(existing));
        }
        g.next_id += 1;
        let id = g.next_id;
        g.by_hash.insert(article.content_hash.clone(), id);
        g.articles.push(StoredArticle {
            id,
            fetched_at: Utc::now(),
            article,
        });
        Ok(id)
    }

    async fn update_source_health(
        &self,
        source_id: SourceId,
        status: HealthStatus,
        error: Option<String>,
    ) -> Result<(), PersistenceError> {
        let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        g.health.push(SourceHealthUpdate {
            source_id,
            status,
            error,
            at: Utc::now(),
        });
        Ok(())
    }

    async fn find_by_content_hash(
        &self,
        hash: &str,
    ) -> Result<Option<ArticleId>, PersistenceError> {
        let g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(g.by_hash.get(hash).copied())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, PersistenceError> {
        let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let before = g.articles.len();
        g.articles.retain(|a| a.fetched_at >= cutoff);
        let kept: HashMap<String, ArticleId> = g
            .articles
            .iter()
            .map(|a| (a.article.content_hash.clone(), a.id))
            .collect();
        g.by_hash = kept;
        Ok(before - g.articles.len())
    }
}
