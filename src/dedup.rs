// src/dedup.rs
//! Content-hash deduplication gate.
//!
//! Hashes are computed over *normalized text* (whitespace collapsed, case preserved),
//! never over the URL: the same article is routinely reachable from several URLs.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{DedupOutcome, PersistenceError};
use crate::storage::{ArticleId, Storage};

/// Collapse every whitespace run to one space and trim. Case is preserved.
pub fn normalize_content(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase hex SHA-256 of the normalized text.
pub fn content_hash(raw: &str) -> String {
    let normalized = normalize_content(raw);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[async_trait]
pub trait DeduplicationIndex: Send + Sync {
    async fn lookup(&self, hash: &str) -> Result<Option<ArticleId>, PersistenceError>;
    async fn record(&self, hash: &str, article_id: ArticleId) -> Result<(), PersistenceError>;

    async fn check(&self, hash: &str) -> Result<DedupOutcome, PersistenceError> {
        Ok(match self.lookup(hash).await? {
            Some(id) => DedupOutcome::Duplicate(id),
            None => DedupOutcome::Fresh,
        })
    }
}

/// Index answered by storage itself, so a retention purge is reflected immediately and
/// purged content can be stored again.
pub struct StorageBackedIndex {
    storage: Arc<dyn Storage>,
}

impl StorageBackedIndex {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DeduplicationIndex for StorageBackedIndex {
    async fn lookup(&self, hash: &str) -> Result<Option<ArticleId>, PersistenceError> {
        self.storage.find_by_content_hash(hash).await
    }

    /// The stored row carries the hash. Only checks that storage agrees.
    async fn record(&self, hash: &str, article_id: ArticleId) -> Result<(), PersistenceError> {
        match self.storage.find_by_content_hash(hash).await? {
            Some(id) if id == article_id => Ok(()),
            Some(id) => Err(PersistenceError::Conflict(id)),
            None => Err(PersistenceError::Backend(format!(
                "article {article_id} not found by content hash"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::state::ArticleAnalysis;
    use crate::storage::{MemoryStorage, NewArticle};

    fn article(hash: &str) -> NewArticle {
        NewArticle {
            source_id: 1,
            url: "https://example.com/a".into(),
            content: "body".into(),
            content_hash: hash.into(),
            analysis: ArticleAnalysis::default(),
            stock_mentions: vec![],
            metadata: Default::default(),
            timings: Default::default(),
        }
    }

    #[test]
    fn normalize_collapses_whitespace_and_keeps_case() {
        assert_eq!(normalize_content("  Apple\t beats\n\nEstimates  "), "Apple beats Estimates");
    }

    #[test]
    fn hash_ignores_whitespace_layout_but_not_case() {
        let a = content_hash("Fed holds  rates\nsteady");
        let b = content_hash(" Fed holds rates steady ");
        let c = content_hash("fed holds rates steady");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn lookup_follows_storage_through_a_purge() {
        let storage = Arc::new(MemoryStorage::new());
        let index = StorageBackedIndex::new(storage.clone());
        assert_eq!(index.lookup("abc").await.unwrap(), None);

        let id = storage.create_article(article("abc")).await.unwrap();
        index.record("abc", id).await.unwrap();
        assert_eq!(index.check("abc").await.unwrap(), DedupOutcome::Duplicate(id));

        storage.purge_older_than(Utc::now() + Duration::minutes(1)).await.unwrap();
        assert_eq!(index.check("abc").await.unwrap(), DedupOutcome::Fresh);
    }

    #[tokio::test]
    async fn record_rejects_a_hash_storage_does_not_know() {
        let index = StorageBackedIndex::new(Arc::new(MemoryStorage::new()));
        assert!(index.record("missing", 3).await.is_err());
    }
}
