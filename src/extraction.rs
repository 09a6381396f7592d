//! The extraction engine: turns `(content, content-type, rules, base_url)`
//! into a field map, plus the link/image/metadata scans the pipeline runs
//! on every successful fetch.

use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use scraper::{Html, Selector as CssSelector};
use tracing::warn;

use crate::models::{ExtractedValue, ExtractionRule, ExtractionType, Selector};
use crate::postprocess;
use crate::url_utils::{is_valid_http_url, resolve};

/// Substrings that mark a link as a non-content asset, never followed as a
/// child request.
const ASSET_DENYLIST: &[&str] = &[
    ".js", ".css", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ico", ".bmp",
    ".woff", ".woff2", ".ttf", ".eot", ".otf",
    ".pdf", ".zip", ".gz", ".tar", ".rar",
    ".mp4", ".mp3", ".avi", ".mov", ".wav", ".webm",
    "/static/", "/assets/", "/images/", "/_static/",
    "javascript:", "mailto:", "#",
];

fn is_denied_asset(url: &str) -> bool {
    let lower = url.to_lowercase();
    ASSET_DENYLIST.iter().any(|d| lower.contains(d))
}

/// A fetched page's structured metadata, before the pipeline folds the
/// well-known keys (`title`, `charset`, `language`) onto [`crate::models::WebPage`].
#[derive(Debug, Default, Clone)]
pub struct PageMeta {
    pub title: Option<String>,
    pub charset: Option<String>,
    pub language: Option<String>,
    pub fields: IndexMap<String, String>,
}

/// Stateless HTML/JSON/text field extractor, dispatched by content type.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractionEngine;

impl ExtractionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Extract every rule's field from `content`, routing by `content_type`.
    pub fn extract_data(
        &self,
        content: &str,
        content_type: &str,
        rules: &[ExtractionRule],
        base_url: &str,
    ) -> IndexMap<String, ExtractedValue> {
        let ct = content_type.to_lowercase();
        if ct.contains("html") {
            self.extract_html(content, rules, base_url)
        } else if ct.contains("json") {
            self.extract_json(content, rules)
        } else {
            self.extract_text(content, rules)
        }
    }

    fn extract_html(&self, content: &str, rules: &[ExtractionRule], base_url: &str) -> IndexMap<String, ExtractedValue> {
        let document = Html::parse_document(content);
        let mut out = IndexMap::new();
        for rule in rules {
            if let Some(value) = self.extract_html_rule(&document, rule, base_url) {
                out.insert(rule.name.clone(), value);
            }
        }
        out
    }

    fn extract_html_rule(&self, document: &Html, rule: &ExtractionRule, base_url: &str) -> Option<ExtractedValue> {
        match &rule.selector {
            Selector::CssSelector { query } => self.extract_css(document, query, rule, base_url),
            Selector::RegexSelector { pattern, group } => {
                self.extract_regex(&document_text(document), pattern, *group, rule)
            }
            Selector::XPathSelector { .. } => {
                warn!(rule = %rule.name, "XPath selectors are unsupported, skipping rule");
                required_fallback(rule)
            }
            Selector::JsonPathSelector { .. } => {
                warn!(rule = %rule.name, "JSONPath selector used against HTML content, skipping rule");
                required_fallback(rule)
            }
        }
    }

    fn extract_css(&self, document: &Html, query: &str, rule: &ExtractionRule, base_url: &str) -> Option<ExtractedValue> {
        let selector = match CssSelector::parse(query) {
            Ok(s) => s,
            Err(error) => {
                warn!(rule = %rule.name, %query, ?error, "invalid CSS selector, skipping rule");
                return required_fallback(rule);
            }
        };

        let mut values = Vec::new();
        for element in document.select(&selector) {
            let raw = match rule.extraction_type {
                ExtractionType::Text => Some(element.text().collect::<String>()),
                ExtractionType::Html => Some(element.html()),
                ExtractionType::Attribute => element.value().attr("href").map(str::to_string),
                ExtractionType::Link => element
                    .value()
                    .attr("href")
                    .and_then(|href| resolve(base_url, href)),
                ExtractionType::ImageSrc => element
                    .value()
                    .attr("src")
                    .and_then(|src| resolve(base_url, src)),
                ExtractionType::Json => Some(element.text().collect::<String>()),
            };
            let Some(raw) = raw else { continue };
            if raw.trim().is_empty() {
                continue;
            }
            values.push(postprocess::apply_chain(&rule.post_processors, raw));
            if !rule.multiple {
                break;
            }
        }

        finalize(values, rule)
    }

    fn extract_regex(&self, text: &str, pattern: &str, group: usize, rule: &ExtractionRule) -> Option<ExtractedValue> {
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(error) => {
                warn!(rule = %rule.name, %pattern, ?error, "invalid regex, skipping rule");
                return required_fallback(rule);
            }
        };

        let pick = |caps: &regex::Captures| -> String {
            if group > 0 {
                caps.get(group).or_else(|| caps.get(0))
            } else {
                caps.get(0)
            }
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
        };

        let mut values = Vec::new();
        if rule.multiple {
            for caps in re.captures_iter(text) {
                values.push(postprocess::apply_chain(&rule.post_processors, pick(&caps)));
            }
        } else if let Some(caps) = re.captures(text) {
            values.push(postprocess::apply_chain(&rule.post_processors, pick(&caps)));
        }

        finalize(values, rule)
    }

    fn extract_json(&self, content: &str, rules: &[ExtractionRule]) -> IndexMap<String, ExtractedValue> {
        let parsed: Option<serde_json::Value> = serde_json::from_str(content).ok();
        let mut out = IndexMap::new();
        for rule in rules {
            let value = match &rule.selector {
                Selector::JsonPathSelector { path } => match &parsed {
                    Some(root) => self.extract_json_path(root, path, rule),
                    None => required_fallback(rule),
                },
                Selector::RegexSelector { pattern, group } => {
                    self.extract_regex(content, pattern, *group, rule)
                }
                _ => {
                    warn!(rule = %rule.name, "selector not meaningful for JSON content, skipping rule");
                    required_fallback(rule)
                }
            };
            if let Some(value) = value {
                out.insert(rule.name.clone(), value);
            }
        }
        out
    }

    fn extract_json_path(&self, root: &serde_json::Value, path: &str, rule: &ExtractionRule) -> Option<ExtractedValue> {
        let trimmed = path.trim_start_matches('$').trim_start_matches('.');
        let mut current = Some(root);
        if !trimmed.is_empty() {
            for segment in trimmed.split('.') {
                current = current.and_then(|value| match value {
                    serde_json::Value::Object(map) => map.get(segment),
                    serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|idx| items.get(idx)),
                    _ => None,
                });
                if current.is_none() {
                    break;
                }
            }
        }
        match current {
            Some(value) => Some(self.json_value_to_extracted(value, rule)),
            None => required_fallback(rule),
        }
    }

    fn json_value_to_extracted(&self, value: &serde_json::Value, rule: &ExtractionRule) -> ExtractedValue {
        match value {
            serde_json::Value::Null => ExtractedValue::Null,
            serde_json::Value::Array(items) => {
                if rule.multiple {
                    let list = items
                        .iter()
                        .filter(|v| !v.is_array() && !v.is_object())
                        .map(|v| self.stringify_primitive(v, rule))
                        .collect();
                    ExtractedValue::List(list)
                } else {
                    match items.first() {
                        Some(first) => self.json_value_to_extracted(first, rule),
                        None => ExtractedValue::empty_for(rule.multiple),
                    }
                }
            }
            serde_json::Value::Object(_) => {
                ExtractedValue::Text(postprocess::apply_chain(&rule.post_processors, value.to_string()))
            }
            primitive => self.stringify_primitive(primitive, rule),
        }
    }

    fn stringify_primitive(&self, value: &serde_json::Value, rule: &ExtractionRule) -> ExtractedValue {
        let raw = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ExtractedValue::Text(postprocess::apply_chain(&rule.post_processors, raw))
    }

    fn extract_text(&self, content: &str, rules: &[ExtractionRule]) -> IndexMap<String, ExtractedValue> {
        let mut out = IndexMap::new();
        for rule in rules {
            let value = match &rule.selector {
                Selector::RegexSelector { pattern, group } => self.extract_regex(content, pattern, *group, rule),
                other => {
                    warn!(rule = %rule.name, selector = ?other, "only regex selectors run against plain-text content");
                    required_fallback(rule)
                }
            };
            if let Some(value) = value {
                out.insert(rule.name.clone(), value);
            }
        }
        out
    }
}

fn required_fallback(rule: &ExtractionRule) -> Option<ExtractedValue> {
    rule.required.then(|| ExtractedValue::empty_for(rule.multiple))
}

fn finalize(values: Vec<String>, rule: &ExtractionRule) -> Option<ExtractedValue> {
    if values.is_empty() {
        return required_fallback(rule);
    }
    if rule.multiple {
        Some(ExtractedValue::List(values.into_iter().map(ExtractedValue::Text).collect()))
    } else {
        Some(ExtractedValue::Text(values.into_iter().next().unwrap_or_default()))
    }
}

fn document_text(document: &Html) -> String {
    document.root_element().text().collect::<Vec<_>>().join(" ")
}

/// Discover outbound links: absolute, HTTP(S), deduped, asset-denylist filtered.
pub fn extract_links(document: &Html, base_url: &str) -> IndexSet<String> {
    let mut out = IndexSet::new();
    let Ok(selector) = CssSelector::parse("a[href]") else {
        return out;
    };
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else { continue };
        let Some(absolute) = resolve(base_url, href) else { continue };
        if is_valid_http_url(&absolute) && !is_denied_asset(&absolute) {
            out.insert(absolute);
        }
    }
    out
}

/// Discover `<img>` sources, including the first candidate of any `srcset`.
pub fn extract_images(document: &Html, base_url: &str) -> Vec<crate::models::ImageRecord> {
    use crate::models::ImageRecord;

    let mut out = Vec::new();
    let Ok(selector) = CssSelector::parse("img") else {
        return out;
    };
    for element in document.select(&selector) {
        let el = element.value();
        let alt = el.attr("alt").map(str::to_string);
        let width = el.attr("width").and_then(|v| v.parse().ok());
        let height = el.attr("height").and_then(|v| v.parse().ok());

        if let Some(src) = el.attr("src") {
            if let Some(absolute) = resolve(base_url, src) {
                if is_valid_http_url(&absolute) {
                    out.push(ImageRecord { url: absolute, alt: alt.clone(), width, height });
                }
            }
        }

        if let Some(srcset) = el.attr("srcset") {
            for candidate in srcset.split(',') {
                let Some(first_token) = candidate.trim().split_whitespace().next() else { continue };
                if let Some(absolute) = resolve(base_url, first_token) {
                    if is_valid_http_url(&absolute) {
                        out.push(ImageRecord { url: absolute, alt: alt.clone(), width: None, height: None });
                    }
                }
            }
        }
    }
    out
}

/// Discover document-level metadata: `<title>`, `<meta>` tags, `<meta charset>`,
/// and `<html lang>`.
pub fn extract_metadata(document: &Html) -> PageMeta {
    let mut meta = PageMeta::default();

    if let Ok(sel) = CssSelector::parse("title") {
        if let Some(el) = document.select(&sel).next() {
            let text = el.text().collect::<String>();
            if !text.trim().is_empty() {
                meta.title = Some(text.trim().to_string());
            }
        }
    }

    if let Ok(sel) = CssSelector::parse("meta") {
        for element in document.select(&sel) {
            let el = element.value();
            if let Some(charset) = el.attr("charset") {
                if !charset.trim().is_empty() {
                    meta.charset = Some(charset.trim().to_string());
                }
                continue;
            }
            let name = el.attr("name").or_else(|| el.attr("property"));
            if let (Some(name), Some(content)) = (name, el.attr("content")) {
                if !name.trim().is_empty() && !content.trim().is_empty() {
                    meta.fields.insert(name.trim().to_string(), content.trim().to_string());
                }
            }
        }
    }

    if let Ok(sel) = CssSelector::parse("html") {
        if let Some(el) = document.select(&sel).next() {
            if let Some(lang) = el.value().attr("lang") {
                if !lang.trim().is_empty() {
                    meta.language = Some(lang.trim().to_string());
                }
            }
        }
    }

    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractionRule, ExtractionType, PostProcessor, Selector};

    fn rule(name: &str, selector: Selector, ty: ExtractionType, required: bool, multiple: bool) -> ExtractionRule {
        ExtractionRule {
            name: name.to_string(),
            selector,
            extraction_type: ty,
            post_processors: Vec::new(),
            required,
            multiple,
        }
    }

    #[test]
    fn css_text_rule_extracts_title() {
        let engine = ExtractionEngine::new();
        let rules = vec![rule(
            "title",
            Selector::CssSelector { query: "h1".into() },
            ExtractionType::Text,
            true,
            false,
        )];
        let out = engine.extract_data("<html><h1>Hi</h1></html>", "text/html", &rules, "https://a.test/");
        assert_eq!(out.get("title"), Some(&ExtractedValue::Text("Hi".into())));
    }

    #[test]
    fn required_css_rule_with_no_match_yields_empty_text() {
        let engine = ExtractionEngine::new();
        let rules = vec![rule(
            "missing",
            Selector::CssSelector { query: "h2".into() },
            ExtractionType::Text,
            true,
            false,
        )];
        let out = engine.extract_data("<html><h1>Hi</h1></html>", "text/html", &rules, "https://a.test/");
        assert_eq!(out.get("missing"), Some(&ExtractedValue::Text(String::new())));
    }

    #[test]
    fn required_multiple_css_rule_with_no_match_yields_empty_list() {
        let engine = ExtractionEngine::new();
        let rules = vec![rule(
            "missing",
            Selector::CssSelector { query: "h2".into() },
            ExtractionType::Text,
            true,
            true,
        )];
        let out = engine.extract_data("<html><h1>Hi</h1></html>", "text/html", &rules, "https://a.test/");
        assert_eq!(out.get("missing"), Some(&ExtractedValue::List(Vec::new())));
    }

    #[test]
    fn non_required_rule_with_no_match_is_absent() {
        let engine = ExtractionEngine::new();
        let rules = vec![rule(
            "missing",
            Selector::CssSelector { query: "h2".into() },
            ExtractionType::Text,
            false,
            false,
        )];
        let out = engine.extract_data("<html><h1>Hi</h1></html>", "text/html", &rules, "https://a.test/");
        assert!(!out.contains_key("missing"));
    }

    #[test]
    fn link_extraction_resolves_absolute_and_drops_assets() {
        let html = r#"<html><a href="/p2">n</a><a href="/app.js">s</a><a href="#top">t</a></html>"#;
        let doc = Html::parse_document(html);
        let links = extract_links(&doc, "https://a.test/index");
        assert!(links.contains("https://a.test/p2"));
        assert!(!links.iter().any(|l| l.contains("app.js")));
        assert!(!links.iter().any(|l| l.contains('#')));
    }

    #[test]
    fn json_path_descends_dotted_segments() {
        let engine = ExtractionEngine::new();
        let rules = vec![rule(
            "name",
            Selector::JsonPathSelector { path: "$.user.name".into() },
            ExtractionType::Json,
            false,
            false,
        )];
        let out = engine.extract_data(r#"{"user":{"name":"Ada"}}"#, "application/json", &rules, "https://a.test/");
        assert_eq!(out.get("name"), Some(&ExtractedValue::Text("Ada".into())));
    }

    #[test]
    fn json_path_array_multiple_collects_primitives() {
        let engine = ExtractionEngine::new();
        let rules = vec![rule(
            "tags",
            Selector::JsonPathSelector { path: "$.tags".into() },
            ExtractionType::Json,
            false,
            true,
        )];
        let out = engine.extract_data(r#"{"tags":["a","b",1]}"#, "application/json", &rules, "https://a.test/");
        assert_eq!(
            out.get("tags"),
            Some(&ExtractedValue::List(vec![
                ExtractedValue::Text("a".into()),
                ExtractedValue::Text("b".into()),
                ExtractedValue::Text("1".into()),
            ]))
        );
    }

    #[test]
    fn text_content_only_runs_regex_rules() {
        let engine = ExtractionEngine::new();
        let rules = vec![
            rule("num", Selector::RegexSelector { pattern: r"\d+".into(), group: 0 }, ExtractionType::Text, false, false),
            rule("css", Selector::CssSelector { query: "h1".into() }, ExtractionType::Text, false, false),
        ];
        let out = engine.extract_data("order 42 confirmed", "text/plain", &rules, "https://a.test/");
        assert_eq!(out.get("num"), Some(&ExtractedValue::Text("42".into())));
        assert!(!out.contains_key("css"));
    }

    #[test]
    fn css_post_processors_apply_per_match() {
        let engine = ExtractionEngine::new();
        let mut r = rule(
            "title",
            Selector::CssSelector { query: "h1".into() },
            ExtractionType::Text,
            false,
            false,
        );
        r.post_processors = vec![PostProcessor::UpperCase];
        let out = engine.extract_data("<html><h1>hi</h1></html>", "text/html", &[r], "https://a.test/");
        assert_eq!(out.get("title"), Some(&ExtractedValue::Text("HI".into())));
    }
}
