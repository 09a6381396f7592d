//! The post-processor pipeline: an ordered chain of string transforms
//! applied to a raw extracted value.
//!
//! A failing processor (bad regex, unknown custom id) logs a warning and
//! passes the pre-processor value through unchanged — post-processing never
//! aborts extraction.

use std::collections::HashMap;

use regex::Regex;
use tracing::warn;

use crate::models::PostProcessor;

/// Fold `processors` left-to-right over `input`.
pub fn apply_chain(processors: &[PostProcessor], input: String) -> String {
    processors.iter().fold(input, |value, processor| apply_one(processor, value))
}

fn apply_one(processor: &PostProcessor, value: String) -> String {
    match processor {
        PostProcessor::Trim => value.trim().to_string(),
        PostProcessor::UpperCase => value.to_uppercase(),
        PostProcessor::LowerCase => value.to_lowercase(),
        PostProcessor::Replace { pattern, replacement } => match Regex::new(pattern) {
            Ok(re) => re.replace_all(&value, replacement.as_str()).into_owned(),
            Err(error) => {
                warn!(%pattern, %error, "Replace post-processor has an invalid pattern, keeping value as-is");
                value
            }
        },
        PostProcessor::Extract { pattern, group } => match Regex::new(pattern) {
            Ok(re) => match re.captures(&value) {
                Some(caps) => caps
                    .get(*group)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or(value),
                None => value,
            },
            Err(error) => {
                warn!(%pattern, %error, "Extract post-processor has an invalid pattern, keeping value as-is");
                value
            }
        },
        PostProcessor::Substring { start, end } => {
            let chars: Vec<char> = value.chars().collect();
            let len = chars.len();
            let start = (*start).min(len);
            let end = end.unwrap_or(len).min(len).max(start);
            chars[start..end].iter().collect()
        }
        PostProcessor::Custom { id, config } => custom_processor(id, &value, config).unwrap_or(value),
    }
}

/// Built-in custom processors, dispatched by id.
fn custom_processor(id: &str, value: &str, config: &HashMap<String, String>) -> Option<String> {
    match id {
        "clean_url" => Some(clean_url(value, config)),
        "normalize_text" => Some(normalize_text(value)),
        "extract_number" => Some(extract_number(value, config)),
        "strip_html" => Some(strip_html(value)),
        "normalize_whitespace" => Some(normalize_whitespace(value)),
        other => {
            warn!(id = other, "Unknown custom post-processor id, keeping value as-is");
            None
        }
    }
}

/// Strip the query string from `value` except for keys listed (comma
/// separated) under the `"keep"` config key.
fn clean_url(value: &str, config: &HashMap<String, String>) -> String {
    let Ok(parsed) = url::Url::parse(value) else {
        return value.to_string();
    };
    let keep: Vec<&str> = config
        .get("keep")
        .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    if keep.is_empty() {
        let mut stripped = parsed;
        stripped.set_query(None);
        return stripped.to_string();
    }

    let kept_pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| keep.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut stripped = parsed;
    if kept_pairs.is_empty() {
        stripped.set_query(None);
    } else {
        let query = kept_pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        stripped.set_query(Some(&query));
    }
    stripped.to_string()
}

/// Collapse runs of whitespace to a single space and normalise smart quotes
/// and ellipses to their ASCII equivalents.
fn normalize_text(value: &str) -> String {
    let collapsed = collapse_whitespace(value);
    collapsed
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{2026}', "...")
}

fn normalize_whitespace(value: &str) -> String {
    collapse_whitespace(value)
}

fn collapse_whitespace(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_was_space = false;
    for ch in value.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out
}

/// First match of `config["pattern"]` (default `\d+(\.\d+)?`).
fn extract_number(value: &str, config: &HashMap<String, String>) -> String {
    let pattern = config
        .get("pattern")
        .map(String::as_str)
        .unwrap_or(r"\d+(\.\d+)?");
    match Regex::new(pattern) {
        Ok(re) => re
            .find(value)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| value.to_string()),
        Err(error) => {
            warn!(%pattern, %error, "extract_number has an invalid pattern, keeping value as-is");
            value.to_string()
        }
    }
}

fn strip_html(value: &str) -> String {
    static TAG: once_tag::Lazy = once_tag::Lazy::new();
    TAG.get().replace_all(value, "").into_owned()
}

/// A tiny lazily-initialised regex cache, avoiding recompiling the tag
/// pattern on every `strip_html` call without pulling in `once_cell`.
mod once_tag {
    use regex::Regex;
    use std::sync::OnceLock;

    pub struct Lazy(OnceLock<Regex>);

    impl Lazy {
        pub const fn new() -> Self {
            Lazy(OnceLock::new())
        }

        pub fn get(&self) -> &Regex {
            self.0.get_or_init(|| Regex::new(r"<[^>]*>").expect("static pattern"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_trim_is_idempotent() {
        let chain = vec![PostProcessor::Trim, PostProcessor::Trim];
        assert_eq!(apply_chain(&chain, "  hi  ".to_string()), apply_chain(&[PostProcessor::Trim], "  hi  ".to_string()));
    }

    #[test]
    fn upper_then_lower_is_just_lower() {
        let chain = vec![PostProcessor::UpperCase, PostProcessor::LowerCase];
        assert_eq!(
            apply_chain(&chain, "Hello".to_string()),
            apply_chain(&[PostProcessor::LowerCase], "Hello".to_string())
        );
    }

    #[test]
    fn replace_swaps_matches() {
        let chain = vec![PostProcessor::Replace {
            pattern: r"\s+".to_string(),
            replacement: "-".to_string(),
        }];
        assert_eq!(apply_chain(&chain, "a  b   c".to_string()), "a-b-c");
    }

    #[test]
    fn extract_returns_group_or_whole_match() {
        let chain = vec![PostProcessor::Extract {
            pattern: r"price: (\d+)".to_string(),
            group: 1,
        }];
        assert_eq!(apply_chain(&chain, "price: 42".to_string()), "42");

        let no_match = vec![PostProcessor::Extract {
            pattern: r"price: (\d+)".to_string(),
            group: 1,
        }];
        assert_eq!(apply_chain(&no_match, "nope".to_string()), "nope");
    }

    #[test]
    fn substring_clamps_bounds() {
        let chain = vec![PostProcessor::Substring { start: 0, end: Some(100) }];
        assert_eq!(apply_chain(&chain, "short".to_string()), "short");
        let chain2 = vec![PostProcessor::Substring { start: 2, end: Some(4) }];
        assert_eq!(apply_chain(&chain2, "hello".to_string()), "ll");
    }

    #[test]
    fn custom_clean_url_strips_query_except_kept_keys() {
        let mut config = HashMap::new();
        config.insert("keep".to_string(), "id".to_string());
        let chain = vec![PostProcessor::Custom {
            id: "clean_url".to_string(),
            config,
        }];
        assert_eq!(
            apply_chain(&chain, "https://a.test/x?id=1&utm_source=foo".to_string()),
            "https://a.test/x?id=1"
        );
    }

    #[test]
    fn custom_normalize_text_collapses_and_fixes_quotes() {
        let chain = vec![PostProcessor::Custom {
            id: "normalize_text".to_string(),
            config: HashMap::new(),
        }];
        assert_eq!(
            apply_chain(&chain, "  He said \u{201C}hi\u{201D}\u{2026}  ".to_string()),
            "He said \"hi\"..."
        );
    }

    #[test]
    fn custom_extract_number_default_pattern() {
        let chain = vec![PostProcessor::Custom {
            id: "extract_number".to_string(),
            config: HashMap::new(),
        }];
        assert_eq!(apply_chain(&chain, "Price: $19.99 each".to_string()), "19.99");
    }

    #[test]
    fn custom_strip_html_removes_tags() {
        let chain = vec![PostProcessor::Custom {
            id: "strip_html".to_string(),
            config: HashMap::new(),
        }];
        assert_eq!(apply_chain(&chain, "<b>Hi</b> <i>there</i>".to_string()), "Hi there");
    }

    #[test]
    fn unknown_custom_id_keeps_value() {
        let chain = vec![PostProcessor::Custom {
            id: "nonexistent".to_string(),
            config: HashMap::new(),
        }];
        assert_eq!(apply_chain(&chain, "unchanged".to_string()), "unchanged");
    }
}
