// src/extract/parse.rs
//! Tolerant decoding of capability responses into typed outputs.
//!
//! Language models answer "roughly JSON": fenced in markdown, wrapped in an object, keys
//! under slightly different names, numbers as strings. Everything that can be salvaged is;
//! everything else is `ExtractionError::Malformed`.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use url::Url;

use super::PageClassification;
use crate::error::ExtractionError;
use crate::state::{ArticleAnalysis, SentimentLabel, StockMention};

/// Best-effort JSON recovery from free text.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    let unfenced = trimmed
        .trim_start_matches("```json")
        .trim_start_matches("```JSON")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    if let Ok(v) = serde_json::from_str(unfenced) {
        return Some(v);
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (unfenced.find(open), unfenced.rfind(close)) {
            if end > start {
                if let Ok(v) = serde_json::from_str(&unfenced[start..=end]) {
                    return Some(v);
                }
            }
        }
    }
    None
}

fn first_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
}

fn first_f32(obj: &Map<String, Value>, keys: &[&str]) -> Option<f32> {
    keys.iter().filter_map(|k| obj.get(*k)).find_map(|v| match v {
        Value::Number(n) => n.as_f64().map(|f| f as f32),
        Value::String(s) => s.trim().parse::<f32>().ok(),
        _ => None,
    })
}

fn as_bool(v: Option<&Value>) -> Option<bool> {
    match v? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

/// The list inside a response: the value itself, a known wrapper key, or the first array
/// value of an object.
fn list_of<'a>(v: &'a Value, wrappers: &[&str]) -> Option<&'a Vec<Value>> {
    match v {
        Value::Array(a) => Some(a),
        Value::Object(obj) => wrappers
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_array))
            .or_else(|| obj.values().find_map(Value::as_array)),
        _ => None,
    }
}

fn object<'a>(v: &'a Value, what: &str) -> Result<&'a Map<String, Value>, ExtractionError> {
    v.as_object()
        .ok_or_else(|| ExtractionError::malformed(format!("{what}: expected a JSON object")))
}

pub fn parse_classification(v: &Value) -> Result<PageClassification, ExtractionError> {
    let obj = object(v, "classification")?;
    let is_listing = as_bool(obj.get("is_listing_page"))
        .or_else(|| as_bool(obj.get("is_listing")))
        .or_else(|| {
            first_str(obj, &["page_type", "type"]).map(|t| {
                let t = t.to_ascii_lowercase();
                t.contains("listing") || t.contains("index") || t.contains("list")
            })
        })
        .ok_or_else(|| ExtractionError::malformed("classification: missing listing flag"))?;
    Ok(PageClassification {
        is_listing,
        confidence: first_f32(obj, &["confidence", "confidence_score"])
            .unwrap_or(0.5)
            .clamp(0.0, 1.0),
        reason: first_str(obj, &["reason", "reasoning"]).map(str::to_string),
    })
}

/// Raw link strings from a response (plain strings or `{url|link|href}` objects).
pub fn parse_links(v: &Value) -> Result<Vec<String>, ExtractionError> {
    let items = list_of(v, &["links", "article_links", "articles", "urls"])
        .ok_or_else(|| ExtractionError::malformed("links: expected a list"))?;
    Ok(items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(o) => first_str(o, &["url", "link", "href"]).map(str::to_string),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect())
}

/// Resolve against `base`, keep http(s) only, drop fragments and repeats, cap at `max`.
pub fn resolve_links(raw: &[String], base: &str, max: usize) -> Vec<String> {
    let base = Url::parse(base).ok();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for r in raw {
        let parsed = match &base {
            Some(b) => b.join(r),
            None => Url::parse(r),
        };
        let Ok(mut u) = parsed else {
            continue;
        };
        if !matches!(u.scheme(), "http" | "https") {
            continue;
        }
        u.set_fragment(None);
        let s = u.to_string();
        if seen.insert(s.clone()) {
            out.push(s);
            if out.len() >= max {
                break;
            }
        }
    }
    out
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(n) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(n.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

/// Analysis output. `fallback_date` is used when the model's date is missing or unparseable
/// (typically the page's `article:published_time`).
pub fn parse_analysis(
    v: &Value,
    fallback_date: Option<&str>,
) -> Result<ArticleAnalysis, ExtractionError> {
    let obj = object(v, "analysis")?;
    let published_date = first_str(obj, &["published_date", "date"])
        .and_then(parse_date)
        .or_else(|| fallback_date.and_then(parse_date));
    Ok(ArticleAnalysis {
        title: first_str(obj, &["title", "headline"])
            .unwrap_or("Untitled")
            .to_string(),
        summary: first_str(obj, &["summary"]).map(str::to_string),
        topic: first_str(obj, &["main_topic", "topic"]).map(str::to_string),
        author: first_str(obj, &["author"]).map(str::to_string),
        published_date,
        high_impact: as_bool(obj.get("is_high_impact"))
            .or_else(|| as_bool(obj.get("high_impact")))
            .unwrap_or(false),
    })
}

/// Stock mentions. Items without a ticker are skipped; repeated tickers keep the first.
pub fn parse_entities(v: &Value) -> Result<Vec<StockMention>, ExtractionError> {
    let items = list_of(v, &["stocks", "entities", "mentions"])
        .ok_or_else(|| ExtractionError::malformed("entities: expected a list"))?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let Some(ticker) = first_str(obj, &["ticker_symbol", "ticker", "symbol"]) else {
            continue;
        };
        let ticker = ticker.trim_start_matches('$').to_ascii_uppercase();
        if !seen.insert(ticker.clone()) {
            continue;
        }
        let score = first_f32(obj, &["sentiment_score", "sentiment"])
            .filter(|f| f.is_finite())
            .unwrap_or(0.0)
            .clamp(-1.0, 1.0);
        let label = first_str(obj, &["sentiment_label", "label"])
            .and_then(SentimentLabel::parse)
            .unwrap_or_else(|| SentimentLabel::from_score(score));
        out.push(StockMention {
            company: first_str(obj, &["company_name", "company", "name"])
                .unwrap_or(&ticker)
                .to_string(),
            exchange: first_str(obj, &["stock_exchange", "exchange"]).map(str::to_string),
            segment: first_str(obj, &["market_segment", "segment", "sector"]).map(str::to_string),
            sentiment_score: score,
            sentiment_label: label,
            confidence: first_f32(obj, &["confidence_score", "confidence"])
                .filter(|f| f.is_finite())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0),
            context_snippet: first_str(obj, &["context_snippet", "context"])
                .unwrap_or_default()
                .to_string(),
            ticker,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_json_salvages_fenced_and_chatty_output() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), Some(json!({"a": 1})));
        assert_eq!(
            extract_json("Sure! Here you go: {\"a\": [1,2]} hope it helps"),
            Some(json!({"a": [1, 2]}))
        );
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn classification_accepts_several_shapes() {
        assert!(parse_classification(&json!({"is_listing_page": true})).unwrap().is_listing);
        assert!(parse_classification(&json!({"page_type": "Listing"})).unwrap().is_listing);
        assert!(!parse_classification(&json!({"is_listing": "no"})).unwrap().is_listing);
        assert!(parse_classification(&json!({"foo": 1})).is_err());
        assert!(parse_classification(&json!([1])).is_err());
    }

    #[test]
    fn links_resolve_dedupe_and_cap() {
        let raw = parse_links(&json!({"links": [
            "/a", {"url": "https://x.test/b"}, "/a#top", "mailto:x@y.z", {"href": "c"}
        ]}))
        .unwrap();
        let resolved = resolve_links(&raw, "https://x.test/news/", 20);
        assert_eq!(
            resolved,
            vec!["https://x.test/a", "https://x.test/b", "https://x.test/news/c"]
        );
        assert_eq!(resolve_links(&raw, "https://x.test/news/", 2).len(), 2);
    }

    #[test]
    fn analysis_defaults_and_date_fallback() {
        let a = parse_analysis(
            &json!({"summary": "s", "published_date": "garbage", "is_high_impact": "yes"}),
            Some("2025-06-10T14:00:00Z"),
        )
        .unwrap();
        assert_eq!(a.title, "Untitled");
        assert!(a.high_impact);
        assert_eq!(a.published_date.unwrap().to_rfc3339(), "2025-06-10T14:00:00+00:00");

        let b = parse_analysis(&json!({"title": "T", "published_date": "2025-01-02 03:04:05"}), None)
            .unwrap();
        assert_eq!(b.published_date.unwrap().to_rfc3339(), "2025-01-02T03:04:05+00:00");
    }

    #[test]
    fn entities_are_clamped_labeled_and_deduped() {
        let v = json!({"stocks": [
            {"ticker_symbol": "aapl", "company_name": "Apple Inc.", "sentiment_score": 1.7,
             "confidence_score": "0.9", "context_snippet": "beat"},
            {"ticker": "AAPL", "sentiment_score": -1},
            {"company_name": "No Ticker Corp"},
            {"ticker": "$msft", "sentiment_score": -0.3, "sentiment_label": "bogus", "confidence": 4}
        ]});
        let m = parse_entities(&v).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].ticker, "AAPL");
        assert_eq!(m[0].sentiment_score, 1.0);
        assert_eq!(m[0].sentiment_label, SentimentLabel::VeryPositive);
        assert_eq!(m[0].confidence, 0.9);
        assert_eq!(m[1].ticker, "MSFT");
        assert_eq!(m[1].company, "MSFT");
        assert_eq!(m[1].sentiment_label, SentimentLabel::Negative);
        assert_eq!(m[1].confidence, 1.0);
    }

    #[test]
    fn entities_require_a_list() {
        assert!(parse_entities(&json!("nope")).is_err());
        assert!(parse_entities(&json!({"stocks": []})).unwrap().is_empty());
    }
}
