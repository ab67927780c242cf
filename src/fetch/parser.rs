//! Response parsers attached to fetch tasks
//!
//! A parser turns the body of a successful response into a [`ParsedBody`].
//! Parse failures are terminal protocol errors.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Node, Selector};

use crate::error::{FetchError, Result};
use crate::models::{ParsedBody, SearchHit};

static ONION_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://[^/\s]*\.onion[^\s<>"{}|\\^`\[\]]*"#).expect("invalid onion link regex")
});

static ANCHOR_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("invalid anchor selector"));

/// Elements whose text never reaches the extracted page text
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript"];

pub trait ResponseParser: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Whether a response with this `Content-Type` can be parsed
    fn accepts(&self, content_type: Option<&str>) -> bool {
        match content_type {
            None => true,
            Some(ct) => {
                let mime = ct.split(';').next().unwrap_or("").trim().to_lowercase();
                mime.is_empty()
                    || mime.starts_with("text/")
                    || mime == "application/xhtml+xml"
                    || mime == "application/xml"
                    || mime == "application/json"
            }
        }
    }

    fn parse(&self, body: &str) -> Result<ParsedBody>;

    /// Check the content type, then parse
    fn parse_response(&self, content_type: Option<&str>, body: &str) -> Result<ParsedBody> {
        if !self.accepts(content_type) {
            return Err(FetchError::UnexpectedContentType(
                content_type.unwrap_or_default().to_string(),
            ));
        }
        self.parse(body)
    }
}

/// Returns the body unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBodyParser;

impl ResponseParser for RawBodyParser {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn accepts(&self, _content_type: Option<&str>) -> bool {
        true
    }

    fn parse(&self, body: &str) -> Result<ParsedBody> {
        Ok(ParsedBody::Raw(body.to_string()))
    }
}

/// Extracts onion links from a search results page
///
/// Every anchor whose `href` contains an onion URL becomes a [`SearchHit`]
/// titled with the anchor text. Anchors without text are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnionLinkParser;

impl ResponseParser for OnionLinkParser {
    fn name(&self) -> &'static str {
        "onion_links"
    }

    fn parse(&self, body: &str) -> Result<ParsedBody> {
        let document = Html::parse_document(body);
        let mut hits = Vec::new();

        for anchor in document.select(&ANCHOR_SELECTOR) {
            let href = anchor.value().attr("href").unwrap_or_default();
            let title = collapse_whitespace(&anchor.text().collect::<Vec<_>>().join(" "));
            if href.is_empty() || title.is_empty() {
                continue;
            }

            if let Some(found) = ONION_LINK_RE.find(href) {
                hits.push(SearchHit {
                    title,
                    link: found.as_str().to_string(),
                });
            }
        }

        Ok(ParsedBody::Links(hits))
    }
}

/// Extracts readable text from a page
#[derive(Debug, Clone, Default)]
pub struct PageTextParser {
    /// Prefixed to the extracted text, usually the search hit title
    pub title: Option<String>,
    /// Truncate longer texts and append `...`; zero keeps everything
    pub max_chars: usize,
}

impl PageTextParser {
    pub fn new(max_chars: usize) -> Self {
        Self {
            title: None,
            max_chars,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

impl ResponseParser for PageTextParser {
    fn name(&self) -> &'static str {
        "page_text"
    }

    fn parse(&self, body: &str) -> Result<ParsedBody> {
        let document = Html::parse_document(body);
        let mut parts: Vec<&str> = Vec::new();

        if let Some(title) = &self.title {
            parts.push(title);
        }

        for node in document.tree.nodes() {
            let Node::Text(text) = node.value() else {
                continue;
            };

            let skipped = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .map(|el| SKIPPED_ELEMENTS.contains(&el.name()))
                    .unwrap_or(false)
            });
            if !skipped {
                parts.push(text);
            }
        }

        let text = collapse_whitespace(&parts.join(" "));
        Ok(ParsedBody::Text(truncate_chars(&text, self.max_chars)))
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if max_chars == 0 || s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
