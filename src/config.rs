//! Top-level crawler configuration and the fluent builder that assembles
//! it, generalising the teacher's single-site `CrawlerBuilder` to a set of
//! named [`SourceConfig`]s sharing a global policy and rule set.

use std::collections::HashMap;

use crate::models::{CrawlPolicy, ExtractionRule, Priority, Request};

/// One seed source to crawl: its own seed URLs, depth limit, and optional
/// overrides of the engine's global policy/rules.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub seed_urls: Vec<String>,
    pub max_depth: usize,
    pub priority: Priority,
    pub policy: Option<CrawlPolicy>,
    pub rules: Vec<ExtractionRule>,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, seed_urls: Vec<String>) -> Self {
        Self {
            name: name.into(),
            seed_urls,
            max_depth: 2,
            priority: Priority::default(),
            policy: None,
            rules: Vec::new(),
        }
    }
}

/// The crawler's full configuration: a name, a concurrency cap, and the
/// sources that feed it.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub name: String,
    pub max_concurrency: usize,
    pub sources: Vec<SourceConfig>,
    pub global_policy: CrawlPolicy,
    pub global_rules: Vec<ExtractionRule>,
    pub default_max_depth: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            name: "webcrawl".to_string(),
            max_concurrency: 50,
            sources: Vec::new(),
            global_policy: CrawlPolicy::default(),
            global_rules: Vec::new(),
            default_max_depth: 2,
        }
    }
}

impl CrawlerConfig {
    /// Expand every source's seed URLs into [`Request`]s, merging each
    /// source's policy/rules over the global defaults and stamping
    /// `metadata["source"]` so results can be attributed back to it.
    pub fn to_requests(&self) -> Vec<Request> {
        self.sources
            .iter()
            .flat_map(|source| {
                let policy = source.policy.clone().unwrap_or_else(|| self.global_policy.clone());
                let rules = if source.rules.is_empty() { self.global_rules.clone() } else { source.rules.clone() };
                source.seed_urls.iter().map(move |url| {
                    let mut request = Request::new(url.clone(), source.max_depth, rules.clone(), policy.clone());
                    request.priority = source.priority;
                    request.metadata.insert("source".to_string(), source.name.clone());
                    request
                })
            })
            .collect()
    }
}

/// Builder pattern for [`CrawlerConfig`]. Allows for customisable
/// configurations assembled source by source.
pub struct CrawlerConfigBuilder {
    config: CrawlerConfig,
}

impl Default for CrawlerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlerConfigBuilder {
    /// Initializes a new builder with default configuration.
    pub fn new() -> Self {
        Self { config: CrawlerConfig::default() }
    }

    /// Set a name for the crawler, surfaced in progress logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set a limit for concurrent requests.
    pub fn with_max_concurrent_requests(mut self, requests: usize) -> Self {
        self.config.max_concurrency = requests;
        self
    }

    /// Set the depth used by [`Self::with_seed_url`] sources.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.config.default_max_depth = depth;
        self
    }

    /// Enable or disable `robots.txt` handling globally.
    pub fn with_robots(mut self, respect: bool) -> Self {
        self.config.global_policy.respect_robots_txt = respect;
        self
    }

    /// Set a custom user agent applied to the global policy.
    pub fn with_user_agent(mut self, user_agent: impl AsRef<str>) -> Self {
        self.config.global_policy.user_agent = user_agent.as_ref().to_string();
        self
    }

    /// Define the default per-host delay, in milliseconds.
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.config.global_policy.delay_ms = delay_ms;
        self
    }

    /// Allow only a set of content types.
    pub fn with_allowed_content_types(mut self, content_types: Vec<String>) -> Self {
        self.config.global_policy.allowed_content_types = content_types;
        self
    }

    /// Apply extraction rules shared by every source that doesn't define
    /// its own.
    pub fn with_global_rules(mut self, rules: Vec<ExtractionRule>) -> Self {
        self.config.global_rules = rules;
        self
    }

    /// Add one source to crawl.
    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.config.sources.push(source);
        self
    }

    /// Add a bare seed URL as its own unnamed source, using the global
    /// depth/policy/rules.
    pub fn with_seed_url(mut self, url: impl Into<String>) -> Self {
        let max_depth = self.config.default_max_depth;
        let name = format!("source-{}", self.config.sources.len());
        self.config.sources.push(SourceConfig::new(name, vec![url.into()]).with_max_depth(max_depth));
        self
    }

    /// Consumes the builder and returns the assembled configuration.
    pub fn build(self) -> CrawlerConfig {
        self.config
    }
}

impl SourceConfig {
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_policy(mut self, policy: CrawlPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_rules(mut self, rules: Vec<ExtractionRule>) -> Self {
        self.rules = rules;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractionType, Selector};

    #[test]
    fn to_requests_stamps_source_metadata_and_merges_policy() {
        let mut custom_policy = CrawlPolicy::default();
        custom_policy.delay_ms = 5_000;

        let config = CrawlerConfigBuilder::new()
            .with_source(SourceConfig::new("blog", vec!["https://a.test/".to_string()]).with_max_depth(1).with_policy(custom_policy.clone()))
            .with_source(SourceConfig::new("docs", vec!["https://b.test/".to_string()]))
            .build();

        let requests = config.to_requests();
        assert_eq!(requests.len(), 2);

        let blog = requests.iter().find(|r| r.url == "https://a.test/").unwrap();
        assert_eq!(blog.source(), Some("blog"));
        assert_eq!(blog.policy.delay_ms, 5_000);
        assert_eq!(blog.max_depth, 1);

        let docs = requests.iter().find(|r| r.url == "https://b.test/").unwrap();
        assert_eq!(docs.policy.delay_ms, config.global_policy.delay_ms);
    }

    #[test]
    fn source_without_own_rules_falls_back_to_global() {
        let rule = ExtractionRule::new("title", Selector::CssSelector { query: "h1".into() }, ExtractionType::Text);
        let config = CrawlerConfigBuilder::new()
            .with_global_rules(vec![rule])
            .with_source(SourceConfig::new("blog", vec!["https://a.test/".to_string()]))
            .build();

        let requests = config.to_requests();
        assert_eq!(requests[0].rules.len(), 1);
    }
}
