// src/workflow/progress.rs
//! Progress stream for external observers (UI progress bar / stage checklist).
//!
//! Stage names and the camelCase field names are a wire contract. A stream is one `init`,
//! one `progress` per transition and exactly one terminal `complete` or `error`; the sink
//! enforces the "exactly one" part no matter how often callers try to finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::state::{RunResult, RunStatus, Stage};
use crate::storage::SourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressEventType {
    Init,
    Progress,
    Complete,
    Error,
}

impl ProgressEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressEventType::Init => "init",
            ProgressEventType::Progress => "progress",
            ProgressEventType::Complete => "complete",
            ProgressEventType::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_articles: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_article: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock_count: Option<usize>,
}

impl ProgressEvent {
    fn bare(event_type: ProgressEventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            message: message.into(),
            stage: None,
            total_articles: None,
            current_article: None,
            progress_percent: None,
            status: None,
            source_id: None,
            url: None,
            errors: None,
            stock_count: None,
        }
    }

    pub fn init(source_id: SourceId, url: &str) -> Self {
        let mut ev = Self::bare(ProgressEventType::Init, "Initializing workflow...");
        ev.stage = Some(Stage::Init);
        ev.source_id = Some(source_id);
        ev.url = Some(url.to_string());
        ev
    }

    /// `current` is the zero-based article index; `total` is 0 until links are known.
    pub fn progress(stage: Stage, current: usize, total: usize) -> Self {
        let mut ev = Self::bare(ProgressEventType::Progress, stage_message(stage, current, total));
        ev.stage = Some(stage);
        ev.total_articles = Some(total);
        ev.current_article = Some(current);
        ev.progress_percent = Some(percent(stage, current, total));
        ev
    }

    /// Terminal event for a finished run: `error` when the run ended in the error stage,
    /// `complete` otherwise.
    pub fn finished(result: &RunResult, url: &str) -> Self {
        let (event_type, message) = if result.stage == Stage::Error {
            (
                ProgressEventType::Error,
                format!("Processing failed: {}", result.errors.join("; ")),
            )
        } else {
            (ProgressEventType::Complete, "Processing completed".to_string())
        };
        let mut ev = Self::bare(event_type, message);
        ev.stage = Some(result.stage);
        ev.status = Some(result.status);
        ev.source_id = Some(result.source_id);
        ev.url = Some(url.to_string());
        ev.total_articles = Some(result.total_articles);
        ev.errors = Some(result.errors.clone());
        ev.stock_count = result.stock_count;
        if result.stage != Stage::Error {
            ev.progress_percent = Some(100.0);
        }
        ev
    }

    /// Terminal error outside a run (dispatch refused, unknown source).
    pub fn error(message: impl Into<String>) -> Self {
        Self::bare(ProgressEventType::Error, message)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type,
            ProgressEventType::Complete | ProgressEventType::Error
        )
    }
}

fn stage_message(stage: Stage, current: usize, total: usize) -> String {
    match stage {
        Stage::Init => "Initializing workflow...".to_string(),
        Stage::Scraped => "Loading page...".to_string(),
        Stage::LinkExtractionComplete => "Extracting article links...".to_string(),
        Stage::ArticleFetched if total > 0 => {
            format!("Fetching article {} of {}...", current + 1, total)
        }
        Stage::ArticleFetched => "Scraping content...".to_string(),
        Stage::Analyzed => "Analyzing content with AI...".to_string(),
        Stage::NerComplete => "Extracting stock mentions...".to_string(),
        Stage::ArticleSavedContinue => {
            format!("Processing article {} of {}...", current + 1, total)
        }
        Stage::Finalized => "Saving to database...".to_string(),
        Stage::AllArticlesFinalized => "All articles processed!".to_string(),
        Stage::Error => "Processing failed".to_string(),
    }
}

fn percent(stage: Stage, current: usize, total: usize) -> f32 {
    if stage.is_terminal() {
        return 100.0;
    }
    if total == 0 {
        return 0.0;
    }
    let done = if stage == Stage::ArticleSavedContinue {
        current + 1
    } else {
        current
    };
    ((done.min(total) as f32 / total as f32) * 1000.0).round() / 10.0
}

/// Non-blocking event sink. Cloning shares the terminal flag.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    terminated: Arc<AtomicBool>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                terminated: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Sink that drops everything (scheduled runs nobody watches).
    pub fn noop() -> Self {
        Self::default()
    }

    /// Returns false when the event was suppressed: after the terminal event, or a second
    /// terminal event. A vanished receiver is not an error.
    pub fn emit(&self, event: ProgressEvent) -> bool {
        if event.is_terminal() {
            if self.terminated.swap(true, Ordering::SeqCst) {
                return false;
            }
        } else if self.terminated.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case_with_type_tag() {
        let ev = ProgressEvent::progress(Stage::ArticleFetched, 1, 3);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "progress");
        assert_eq!(v["stage"], "article_fetched");
        assert_eq!(v["totalArticles"], 3);
        assert_eq!(v["currentArticle"], 1);
        assert_eq!(v["message"], "Fetching article 2 of 3...");
        assert!(v.get("status").is_none());
    }

    #[test]
    fn percent_tracks_saved_articles() {
        assert_eq!(percent(Stage::ArticleSavedContinue, 0, 4), 25.0);
        assert_eq!(percent(Stage::ArticleFetched, 0, 4), 0.0);
        assert_eq!(percent(Stage::AllArticlesFinalized, 3, 4), 100.0);
        assert_eq!(percent(Stage::Analyzed, 1, 3), 33.3);
    }

    #[tokio::test]
    async fn sink_allows_exactly_one_terminal_event() {
        let (sink, mut rx) = ProgressSink::channel();
        let other = sink.clone();
        assert!(sink.emit(ProgressEvent::init(1, "u")));
        assert!(sink.emit(ProgressEvent::error("boom")));
        assert!(!other.emit(ProgressEvent::error("again")));
        assert!(!sink.emit(ProgressEvent::progress(Stage::Scraped, 0, 0)));
        drop(sink);
        drop(other);

        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            seen.push(ev.event_type);
        }
        assert_eq!(seen, vec![ProgressEventType::Init, ProgressEventType::Error]);
    }
}
