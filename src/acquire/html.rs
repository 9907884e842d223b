// src/acquire/html.rs
//! HTML helpers over a parsed DOM: main-text extraction, page metadata, anchor candidates
//! for link extraction and anti-bot interstitial detection.
//!
//! Main-text selection is approximate. Pages that defeat it fall back to the rendered
//! `innerText` returned by the browser driver.

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

static RE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment regex"));
static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

static SEL_ARTICLE: Lazy<Selector> = Lazy::new(|| selector("article"));
static SEL_MAIN: Lazy<Selector> = Lazy::new(|| selector("main"));
static SEL_BODY: Lazy<Selector> = Lazy::new(|| selector("body"));
static SEL_TITLE: Lazy<Selector> = Lazy::new(|| selector("title"));
static SEL_META: Lazy<Selector> = Lazy::new(|| selector("meta[content]"));
static SEL_ANCHOR: Lazy<Selector> = Lazy::new(|| selector("a[href]"));

/// Elements whose text never belongs to the article body.
const NOISE_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "nav", "footer", "header", "aside", "form",
];

/// Elements that end a run of text.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "section",
    "article", "main", "blockquote", "tr", "td", "th", "figcaption", "pre", "dd", "dt",
];

/// Minimum text length for an `<article>`/`<main>` block to be trusted.
const MIN_BLOCK_CHARS: usize = 100;

/// Shortest anchor text considered a headline.
const MIN_LINK_TEXT_CHARS: usize = 15;

/// Pages with less main text than this can be interstitials.
const THIN_PAGE_CHARS: usize = 300;

const SKIP_LINK_PATTERNS: &[&str] = &[
    "/tag/", "/category/", "/author/", "/search", "/login", "/signup", "/contact", "/about",
    "/privacy", "/terms", "javascript:", "mailto:", ".pdf", ".jpg", ".png", ".gif", ".css",
    ".js",
];

/// Lowercase `<title>` fragments used by block and challenge pages.
const TITLE_MARKERS: &[&str] = &[
    "attention required! | cloudflare",
    "just a moment...",
    "are you a robot",
    "access denied",
    "request unsuccessful",
    "pardon our interruption",
];

/// Challenge widgets and interstitial containers, with the marker reported for each.
static INTERSTITIALS: Lazy<Vec<(Selector, &'static str)>> = Lazy::new(|| {
    [
        ("#cf-challenge-running, #challenge-form, .cf-browser-verification", "cf-challenge"),
        ("script[src*='challenge-platform']", "challenge-platform"),
        ("#px-captcha", "px-captcha"),
        (".g-recaptcha, iframe[src*='recaptcha']", "g-recaptcha"),
        (".h-captcha, iframe[src*='hcaptcha']", "h-captcha"),
    ]
    .into_iter()
    .map(|(css, marker)| (selector(css), marker))
    .collect()
});

fn collapse_ws(s: &str) -> String {
    RE_WS.replace_all(s, " ").trim().to_string()
}

/// Strip tags, decode entities, collapse whitespace. For markup fragments such as feed
/// titles and descriptions.
pub fn html_to_text(fragment: &str) -> String {
    let out = RE_COMMENT.replace_all(fragment, " ");
    let out = RE_TAGS.replace_all(&out, " ");
    let out = html_escape::decode_html_entities(&out);
    collapse_ws(&out)
}

fn push_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child_el) = ElementRef::wrap(child) {
            let name = child_el.value().name();
            if NOISE_TAGS.contains(&name) {
                continue;
            }
            push_text(child_el, out);
            if BLOCK_TAGS.contains(&name) {
                out.push(' ');
            }
        }
    }
}

/// Visible text of an element without noise subtrees, whitespace collapsed.
fn element_text(el: ElementRef<'_>) -> String {
    let mut raw = String::new();
    push_text(el, &mut raw);
    collapse_ws(&raw)
}

fn main_text(doc: &Html) -> String {
    for sel in [&*SEL_ARTICLE, &*SEL_MAIN] {
        for el in doc.select(sel) {
            let text = element_text(el);
            if text.chars().count() > MIN_BLOCK_CHARS {
                return text;
            }
        }
    }
    doc.select(&SEL_BODY)
        .next()
        .map(element_text)
        .unwrap_or_else(|| element_text(doc.root_element()))
}

/// Main article text: first substantial `<article>`, then `<main>`, then `<body>`.
pub fn extract_article_text(html: &str) -> Option<String> {
    let text = main_text(&Html::parse_document(html));
    (!text.is_empty()).then_some(text)
}

fn page_title(doc: &Html) -> Option<String> {
    doc.select(&SEL_TITLE)
        .next()
        .map(|t| collapse_ws(&t.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

/// OpenGraph and common article meta tags plus the page title.
pub fn extract_metadata(html: &str) -> BTreeMap<String, String> {
    let doc = Html::parse_document(html);
    let mut out = BTreeMap::new();

    for m in doc.select(&SEL_META) {
        let attrs = m.value();
        let Some(key) = attrs.attr("property").or_else(|| attrs.attr("name")) else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = attrs.attr("content").map(str::trim).unwrap_or_default();
        if value.is_empty() {
            continue;
        }
        let mapped = if let Some(og) = key.strip_prefix("og:") {
            format!("og_{og}")
        } else if matches!(
            key.as_str(),
            "description" | "keywords" | "author" | "publish_date" | "article:published_time"
                | "article:author"
        ) {
            key
        } else {
            continue;
        };
        out.entry(mapped).or_insert_with(|| value.to_string());
    }

    if let Some(title) = page_title(&doc) {
        out.insert("page_title".to_string(), title);
    }
    out
}

/// An anchor that may point at an article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCandidate {
    pub url: String,
    pub text: String,
}

/// Same-host anchors with headline-like text, resolved to absolute URLs, de-duplicated in
/// document order.
pub fn extract_link_candidates(html: &str, base_url: &str) -> Vec<LinkCandidate> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for a in doc.select(&SEL_ANCHOR) {
        let href = a.value().attr("href").map(str::trim).unwrap_or_default();
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let Ok(mut abs) = base.join(href) else {
            continue;
        };
        abs.set_fragment(None);
        if abs.host_str() != base.host_str() {
            continue;
        }
        let lower = abs.as_str().to_ascii_lowercase();
        if SKIP_LINK_PATTERNS.iter().any(|p| lower.contains(p)) {
            continue;
        }
        let text = element_text(a);
        if text.chars().count() < MIN_LINK_TEXT_CHARS {
            continue;
        }
        if seen.insert(abs.to_string()) {
            out.push(LinkCandidate {
                url: abs.to_string(),
                text,
            });
        }
    }
    out
}

/// Marker of an anti-bot interstitial, if the page is one.
///
/// Only the `<title>` and known challenge elements are inspected, never article prose. On
/// a 429/503 response any marker counts; otherwise the page must also be thin, so an
/// article that merely embeds a captcha form is left alone.
pub fn challenge_marker(status: u16, html: &str) -> Option<&'static str> {
    let doc = Html::parse_document(html);
    let title = page_title(&doc).unwrap_or_default().to_lowercase();
    let marker = TITLE_MARKERS
        .iter()
        .copied()
        .find(|m| title.contains(m))
        .or_else(|| {
            INTERSTITIALS
                .iter()
                .find(|(sel, _)| doc.select(sel).next().is_some())
                .map(|(_, m)| *m)
        })?;
    if matches!(status, 429 | 503) || main_text(&doc).chars().count() < THIN_PAGE_CHARS {
        Some(marker)
    } else {
        None
    }
}

/// True when the marker indicates an interactive captcha (as opposed to a plain block).
pub fn is_captcha_marker(marker: &str) -> bool {
    marker.contains("captcha") || marker.contains("robot")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>Markets &amp; More</title>
        <meta property="og:title" content="Apple rallies">
        <meta name="author" content="Jane Doe">
        <script>var x = "<article>fake</article>";</script></head>
        <body><nav>Home | Markets</nav>
        <article><h1>Apple rallies</h1><p>Apple shares rose <b>5%</b> after earnings beat expectations,
        with services revenue hitting a record and guidance raised for the holiday quarter.</p></article>
        <footer>(c) 2025</footer></body></html>"#;

    #[test]
    fn article_text_prefers_article_block() {
        let text = extract_article_text(PAGE).unwrap();
        assert!(text.starts_with("Apple rallies Apple shares rose 5% after"));
        assert!(!text.contains("Home | Markets"));
        assert!(!text.contains("fake"));
    }

    #[test]
    fn metadata_collects_og_author_and_title() {
        let meta = extract_metadata(PAGE);
        assert_eq!(meta.get("og_title").map(String::as_str), Some("Apple rallies"));
        assert_eq!(meta.get("author").map(String::as_str), Some("Jane Doe"));
        assert_eq!(meta.get("page_title").map(String::as_str), Some("Markets & More"));
    }

    #[test]
    fn link_candidates_are_same_host_absolute_and_unique() {
        let html = r#"
            <a href="/news/apple-beats-estimates">Apple beats estimates in Q4 report</a>
            <a href="/news/apple-beats-estimates#comments">Apple beats estimates in Q4 report</a>
            <a href="https://other.com/story">A story on another domain entirely</a>
            <a href="/tag/markets">Markets tag page with long text</a>
            <a href="/short">Short</a>
            <a href='/news/fed-holds'><span>Fed holds rates</span> steady as inflation cools</a>"#;
        let links = extract_link_candidates(html, "https://news.example.com/markets");
        let urls: Vec<&str> = links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://news.example.com/news/apple-beats-estimates",
                "https://news.example.com/news/fed-holds",
            ]
        );
        assert_eq!(links[1].text, "Fed holds rates steady as inflation cools");
    }

    #[test]
    fn fragments_lose_tags_and_entities() {
        assert_eq!(html_to_text("<p>Fed &amp; <b>markets</b></p>\n<!-- x -->"), "Fed & markets");
    }

    #[test]
    fn detects_challenge_pages() {
        assert_eq!(
            challenge_marker(200, "<title>Attention Required! | Cloudflare</title>"),
            Some("attention required! | cloudflare")
        );
        let m = challenge_marker(200, r#"<div id="px-captcha"></div>"#).unwrap();
        assert!(is_captcha_marker(m));
        assert_eq!(challenge_marker(200, "<p>regular article</p>"), None);
    }

    #[test]
    fn article_prose_and_embedded_widgets_are_not_challenges() {
        assert_eq!(
            challenge_marker(200, "<p>The court said access denied to records was unlawful.</p>"),
            None
        );
        let body = "Stocks rallied on Tuesday as investors weighed fresh earnings. ".repeat(8);
        let page = format!(
            r#"<html><body><article><p>{body}</p></article>
            <footer><form><div class="g-recaptcha" data-sitekey="x"></div></form></footer></body></html>"#
        );
        assert_eq!(challenge_marker(200, &page), None);
        assert_eq!(challenge_marker(503, &page), Some("g-recaptcha"));
    }
}
