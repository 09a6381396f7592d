//! Data model shared across the engine, the pipeline, and the extraction
//! engine: requests, policies, extraction rules, and results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Monotonic counter used, together with a timestamp, to mint request ids
/// without pulling in a UUID dependency the rest of the stack doesn't need.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_id(prefix: &str) -> String {
    let n = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{:x}-{n:x}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

/// Submission priority. Carried on [`Request`] for callers that want to
/// weight their own scheduling; the engine itself treats the request queue
/// as FIFO (see [`crate::engine`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Per-request crawl policy: politeness, limits, and HTTP shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPolicy {
    pub respect_robots_txt: bool,
    pub delay_ms: u64,
    pub max_retries: u32,
    pub request_timeout_ms: u64,
    pub user_agent: String,
    pub max_content_length: usize,
    pub allowed_content_types: Vec<String>,
    pub additional_headers: HashMap<String, String>,
    pub follow_redirects: bool,
    pub max_redirects: usize,
}

impl Default for CrawlPolicy {
    fn default() -> Self {
        Self {
            respect_robots_txt: true,
            delay_ms: 1_000,
            max_retries: 3,
            request_timeout_ms: 30_000,
            user_agent: "WebcrawlRustCrawler".to_string(),
            max_content_length: 10 * 1024 * 1024,
            allowed_content_types: vec![
                "text/html".to_string(),
                "application/xhtml+xml".to_string(),
            ],
            additional_headers: HashMap::new(),
            follow_redirects: true,
            max_redirects: 10,
        }
    }
}

/// How a rule locates its value in the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Selector {
    CssSelector { query: String },
    XPathSelector { query: String },
    RegexSelector { pattern: String, group: usize },
    JsonPathSelector { path: String },
}

/// What kind of string a matched element/value should yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionType {
    Text,
    Html,
    Attribute,
    Link,
    ImageSrc,
    Json,
}

/// A single text transform in a post-processor chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PostProcessor {
    Trim,
    UpperCase,
    LowerCase,
    Replace { pattern: String, replacement: String },
    Extract { pattern: String, group: usize },
    Substring { start: usize, end: Option<usize> },
    Custom { id: String, config: HashMap<String, String> },
}

/// A named field to extract from a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub name: String,
    pub selector: Selector,
    pub extraction_type: ExtractionType,
    pub post_processors: Vec<PostProcessor>,
    pub required: bool,
    pub multiple: bool,
}

impl ExtractionRule {
    pub fn new(name: impl Into<String>, selector: Selector, extraction_type: ExtractionType) -> Self {
        Self {
            name: name.into(),
            selector,
            extraction_type,
            post_processors: Vec::new(),
            required: false,
            multiple: false,
        }
    }
}

/// The closed set of value shapes an extraction rule can produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ExtractedValue {
    Text(String),
    Number(f64),
    Bool(bool),
    List(Vec<ExtractedValue>),
    Map(IndexMap<String, ExtractedValue>),
    Null,
}

impl ExtractedValue {
    /// The empty value a `required` rule yields when nothing matched:
    /// `List([])` for `multiple` rules, `Text("")` otherwise.
    pub fn empty_for(multiple: bool) -> Self {
        if multiple {
            ExtractedValue::List(Vec::new())
        } else {
            ExtractedValue::Text(String::new())
        }
    }
}

/// One discovered `<img>` on a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub url: String,
    pub alt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Response-derived metadata about a fetched page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageMetadata {
    pub status_code: u16,
    pub content_type: String,
    pub content_length: usize,
    pub headers: IndexMap<String, Vec<String>>,
    pub charset: Option<String>,
    pub language: Option<String>,
}

/// A successfully fetched and extracted page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebPage {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    pub fields: IndexMap<String, ExtractedValue>,
    pub links: Vec<String>,
    pub images: Vec<ImageRecord>,
    pub metadata: PageMetadata,
    pub completed_at: DateTime<Utc>,
    /// Id of the [`Request`] that produced this page.
    pub request_id: String,
    /// Crawl depth of the request that produced this page.
    pub depth: usize,
    /// `metadata["source"]` of the triggering request, if any.
    pub source: Option<String>,
    /// Wall-clock time the fetch took, in milliseconds.
    pub response_time_ms: u64,
}

/// A unit of crawl work: a URL plus everything needed to process it.
///
/// Requests are immutable once submitted; child requests are always
/// produced by [`Request::child`], never by mutating a submitted request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub url: String,
    pub depth: usize,
    pub max_depth: usize,
    pub rules: Vec<ExtractionRule>,
    pub policy: CrawlPolicy,
    pub priority: Priority,
    pub metadata: HashMap<String, String>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn new(url: impl Into<String>, max_depth: usize, rules: Vec<ExtractionRule>, policy: CrawlPolicy) -> Self {
        Self {
            id: next_id("req"),
            url: url.into(),
            depth: 0,
            max_depth,
            rules,
            policy,
            priority: Priority::default(),
            metadata: HashMap::new(),
            parent_id: None,
            created_at: Utc::now(),
        }
    }

    /// Retry count this request carries, per `metadata["retry_count"]`.
    pub fn retry_count(&self) -> u32 {
        self.metadata
            .get("retry_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").map(String::as_str)
    }

    /// Derive a child request: same rules/policy/priority/metadata, with
    /// `url`/`depth`/`parent_id`/`id`/`created_at` overridden.
    ///
    /// Panics in debug builds if `depth` would exceed `max_depth`; callers
    /// (the pipeline) are expected to have already checked this.
    pub fn child(&self, url: impl Into<String>) -> Self {
        debug_assert!(self.depth + 1 <= self.max_depth);
        Self {
            id: next_id("req"),
            url: url.into(),
            depth: self.depth + 1,
            max_depth: self.max_depth,
            rules: self.rules.clone(),
            policy: self.policy.clone(),
            priority: self.priority,
            metadata: self.metadata.clone(),
            parent_id: Some(self.id.clone()),
            created_at: Utc::now(),
        }
    }

    /// Derive a retry of this request: same identity-relevant fields, with
    /// `retry_count` incremented in `metadata`.
    pub fn retried(&self) -> Self {
        let mut metadata = self.metadata.clone();
        let next = self.retry_count() + 1;
        metadata.insert("retry_count".to_string(), next.to_string());
        Self {
            id: next_id("req"),
            metadata,
            created_at: Utc::now(),
            ..self.clone_without_metadata_and_id()
        }
    }

    fn clone_without_metadata_and_id(&self) -> Self {
        self.clone()
    }
}

/// The terminal outcome of running the pipeline on a [`Request`].
///
/// Wire values round-trip through serialisation unchanged
/// (`SUCCESS`, `FAILED`, `SKIPPED`, `ROBOTS_BLOCKED`, `TIMEOUT`,
/// `TOO_MANY_RETRIES`, `CONTENT_TOO_LARGE`, `UNSUPPORTED_CONTENT_TYPE`,
/// `NETWORK_ERROR`, `PARSE_ERROR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrawlStatus {
    Success,
    Failed,
    Skipped,
    RobotsBlocked,
    Timeout,
    TooManyRetries,
    ContentTooLarge,
    UnsupportedContentType,
    NetworkError,
    ParseError,
}

impl CrawlStatus {
    pub fn is_success(self) -> bool {
        matches!(self, CrawlStatus::Success)
    }
}

/// Per-request timing and size metrics, always satisfying
/// `total_ms >= download_ms + extraction_ms`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CrawlMetrics {
    pub download_ms: u64,
    pub parse_ms: u64,
    pub extraction_ms: u64,
    pub total_ms: u64,
    pub content_bytes: usize,
    pub extracted_field_count: usize,
}

/// The record emitted by the pipeline for every submitted request, exactly
/// once, regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub request: Request,
    pub page: Option<WebPage>,
    pub status: CrawlStatus,
    pub error: Option<String>,
    pub new_requests: Vec<Request>,
    pub timestamp: DateTime<Utc>,
    pub metrics: CrawlMetrics,
}

impl CrawlResult {
    pub fn terminal(request: Request, status: CrawlStatus, error: impl Into<String>) -> Self {
        debug_assert!(!status.is_success());
        Self {
            request,
            page: None,
            status,
            error: Some(error.into()),
            new_requests: Vec::new(),
            timestamp: Utc::now(),
            metrics: CrawlMetrics::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_increments_depth_and_links_parent() {
        let parent = Request::new("https://a.test/", 2, Vec::new(), CrawlPolicy::default());
        let child = parent.child("https://a.test/p2");
        assert_eq!(child.depth, 1);
        assert_eq!(child.max_depth, 2);
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_ne!(child.id, parent.id);
    }

    #[test]
    fn retried_increments_retry_count() {
        let req = Request::new("https://a.test/", 1, Vec::new(), CrawlPolicy::default());
        assert_eq!(req.retry_count(), 0);
        let retry = req.retried();
        assert_eq!(retry.retry_count(), 1);
        assert_eq!(retry.retried().retry_count(), 2);
    }

    #[test]
    fn status_wire_values_round_trip() {
        let pairs = [
            (CrawlStatus::Success, "\"SUCCESS\""),
            (CrawlStatus::RobotsBlocked, "\"ROBOTS_BLOCKED\""),
            (CrawlStatus::UnsupportedContentType, "\"UNSUPPORTED_CONTENT_TYPE\""),
        ];
        for (status, wire) in pairs {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, wire);
            let back: CrawlStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn empty_for_required_rule_matches_multiple_flag() {
        assert_eq!(ExtractedValue::empty_for(false), ExtractedValue::Text(String::new()));
        assert_eq!(ExtractedValue::empty_for(true), ExtractedValue::List(Vec::new()));
    }
}
