// src/error.rs
//! Error taxonomy shared by acquisition, extraction and persistence.
//!
//! Every error here is *recoverable at some boundary*: the orchestrator catches them and
//! turns them into run results, so none of them escape as unhandled faults.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::ArticleId;

/// Why a fetch failed. Mirrors the `last_fetch_status` values a source can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchErrorKind {
    Network,
    Blocked,
    Timeout,
    Captcha,
}

impl FetchErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchErrorKind::Network => "network",
            FetchErrorKind::Blocked => "blocked",
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Captcha => "captcha",
        }
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} error fetching {url}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Network, url, message)
    }

    pub fn blocked(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Blocked, url, message)
    }

    pub fn timeout(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Timeout, url, message)
    }

    /// Classify a `reqwest` transport error for `url`.
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(url, err.to_string())
        } else {
            Self::network(url, err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionErrorKind {
    /// The capability could not be reached or refused to answer.
    Unavailable,
    /// The capability answered, but not in the expected shape.
    Malformed,
}

impl fmt::Display for ExtractionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionErrorKind::Unavailable => f.write_str("unavailable"),
            ExtractionErrorKind::Malformed => f.write_str("malformed"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("extraction {kind}: {message}")]
pub struct ExtractionError {
    pub kind: ExtractionErrorKind,
    pub message: String,
}

impl ExtractionError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: ExtractionErrorKind::Unavailable,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: ExtractionErrorKind::Malformed,
            message: message.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind == ExtractionErrorKind::Unavailable
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    /// Unique content-hash constraint hit: the article already exists.
    #[error("article with content hash already stored as {0}")]
    Conflict(ArticleId),
    #[error("unknown source {0}")]
    UnknownSource(i64),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Routing signal from the dedup gate. Not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    Fresh,
    Duplicate(ArticleId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_display_names_kind_and_url() {
        let e = FetchError::blocked("https://example.com/a", "HTTP 403");
        assert_eq!(
            e.to_string(),
            "blocked error fetching https://example.com/a: HTTP 403"
        );
    }

    #[test]
    fn kinds_serialize_lowercase() {
        let s = serde_json::to_string(&FetchErrorKind::Captcha).unwrap();
        assert_eq!(s, "\"captcha\"");
        let s = serde_json::to_string(&ExtractionErrorKind::Malformed).unwrap();
        assert_eq!(s, "\"malformed\"");
    }
}
