//! Robots.txt cache and parser: per-host rules, TTL-bounded, with
//! double-checked-locked inserts so concurrent workers hitting the same
//! uncached host only trigger one fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::fetcher::Fetcher;
use crate::url_utils::{host_of, origin_of};

const DEFAULT_CACHE_CAPACITY: usize = 1_000;
const DEFAULT_TTL: Duration = Duration::from_secs(6 * 3_600);
const DEFAULT_CRAWL_DELAY_MS: u64 = 1_000;

/// Rules for a single `User-agent:` group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserAgentRules {
    pub disallow: Vec<String>,
    pub crawl_delay_ms: Option<u64>,
}

/// The parsed contents of one host's `robots.txt`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RobotsRules {
    /// Lower-cased user-agent -> rules. `"*"` is the wildcard group.
    pub groups: IndexMap<String, UserAgentRules>,
    pub sitemaps: Vec<String>,
}

impl RobotsRules {
    /// An empty rule set allows everything — used both for hosts with no
    /// `robots.txt` and as the degrade-to-allow-all outcome of a fetch failure.
    pub fn allow_all() -> Self {
        Self::default()
    }

    fn group_for(&self, user_agent: &str) -> Option<&UserAgentRules> {
        let ua = user_agent.to_lowercase();
        self.groups.get(&ua).or_else(|| self.groups.get("*"))
    }

    pub fn is_allowed(&self, path: &str, user_agent: &str) -> bool {
        match self.group_for(user_agent) {
            Some(rules) => !rules.disallow.iter().any(|prefix| path.starts_with(prefix.as_str())),
            None => true,
        }
    }

    pub fn crawl_delay_ms(&self, user_agent: &str) -> Option<u64> {
        self.group_for(user_agent).and_then(|rules| rules.crawl_delay_ms)
    }

    /// Serialise back to `robots.txt` text. Round-trips through [`parse`]
    /// to an equivalent rule set (modulo user-agent group ordering).
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (ua, rules) in &self.groups {
            out.push_str(&format!("User-agent: {ua}\n"));
            for path in &rules.disallow {
                out.push_str(&format!("Disallow: {path}\n"));
            }
            if let Some(delay_ms) = rules.crawl_delay_ms {
                out.push_str(&format!("Crawl-delay: {}\n", delay_ms as f64 / 1000.0));
            }
        }
        for sitemap in &self.sitemaps {
            out.push_str(&format!("Sitemap: {sitemap}\n"));
        }
        out
    }
}

/// Line-based `robots.txt` parser: case-insensitive directives, `#`
/// comments and blanks skipped, the final group flushed at end-of-input.
pub fn parse(text: &str) -> RobotsRules {
    let mut rules = RobotsRules::default();
    let mut current_ua: Option<String> = None;
    let mut current = UserAgentRules::default();

    fn flush(rules: &mut RobotsRules, ua: &mut Option<String>, current: &mut UserAgentRules) {
        if let Some(ua) = ua.take() {
            rules.groups.insert(ua, std::mem::take(current));
        }
    }

    for raw_line in text.lines() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((directive, value)) = line.split_once(':') else { continue };
        let directive = directive.trim().to_lowercase();
        let value = value.trim();

        match directive.as_str() {
            "user-agent" => {
                flush(&mut rules, &mut current_ua, &mut current);
                if !value.is_empty() {
                    current_ua = Some(value.to_lowercase());
                }
            }
            "disallow" => {
                if !value.is_empty() {
                    current.disallow.push(value.to_string());
                }
            }
            "crawl-delay" => {
                if let Ok(seconds) = value.parse::<f64>() {
                    current.crawl_delay_ms = Some((seconds * 1000.0) as u64);
                }
            }
            "sitemap" => {
                if !value.is_empty() {
                    rules.sitemaps.push(value.to_string());
                }
            }
            _ => {}
        }
    }
    flush(&mut rules, &mut current_ua, &mut current);
    rules
}

struct CacheEntry {
    rules: Arc<RobotsRules>,
    cached_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

/// Host-keyed robots.txt cache/fetcher, with a TTL and a capacity bound
/// (oldest entries evicted first).
pub struct RobotsCache {
    fetcher: Arc<dyn Fetcher>,
    entries: RwLock<IndexMap<String, CacheEntry>>,
    fetch_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    capacity: usize,
    ttl: Duration,
}

impl RobotsCache {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            entries: RwLock::new(IndexMap::new()),
            fetch_locks: RwLock::new(HashMap::new()),
            capacity: DEFAULT_CACHE_CAPACITY,
            ttl: DEFAULT_TTL,
        }
    }

    async fn lock_for(&self, host: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.fetch_locks.read().await.get(host) {
            return lock.clone();
        }
        let mut locks = self.fetch_locks.write().await;
        locks.entry(host.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Double-checked-locked get-or-fetch: a reader that misses takes the
    /// per-host lock, rechecks the cache, then fetches and inserts. `host`
    /// keys the cache; `origin` (scheme + host + port) is what's actually
    /// fetched from, since they can differ (truncated host vs. real origin).
    pub async fn get_or_fetch(&self, host: &str, origin: &str) -> Arc<RobotsRules> {
        if let Some(rules) = self.cached(host).await {
            return rules;
        }

        let lock = self.lock_for(host).await;
        let _guard = lock.lock().await;

        if let Some(rules) = self.cached(host).await {
            return rules;
        }

        let rules = Arc::new(self.fetch(origin).await);
        self.insert(host, rules.clone()).await;
        rules
    }

    async fn cached(&self, host: &str) -> Option<Arc<RobotsRules>> {
        let entries = self.entries.read().await;
        let entry = entries.get(host)?;
        if entry.is_expired(self.ttl) {
            None
        } else {
            Some(entry.rules.clone())
        }
    }

    async fn insert(&self, host: &str, rules: Arc<RobotsRules>) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.capacity && !entries.contains_key(host) {
            if let Some((oldest, _)) = entries.iter().next().map(|(k, _)| (k.clone(), ())) {
                entries.shift_remove(&oldest);
            }
        }
        entries.insert(host.to_string(), CacheEntry { rules, cached_at: Instant::now() });
    }

    async fn fetch(&self, origin: &str) -> RobotsRules {
        let url = format!("{origin}/robots.txt");
        debug!(%origin, "fetching robots.txt");
        match self.fetcher.fetch(&url).await {
            Ok(response) if response.is_successful => match response.body {
                Some(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => parse(&text),
                    Err(error) => {
                        warn!(%origin, %error, "robots.txt body was not valid UTF-8, allowing all");
                        RobotsRules::allow_all()
                    }
                },
                None => RobotsRules::allow_all(),
            },
            Ok(_) => {
                debug!(%origin, "robots.txt fetch was not successful, allowing all");
                RobotsRules::allow_all()
            }
            Err(error) => {
                warn!(%origin, %error, "robots.txt fetch failed, allowing all");
                RobotsRules::allow_all()
            }
        }
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn refresh(&self, host: &str, origin: &str) -> Arc<RobotsRules> {
        let rules = Arc::new(self.fetch(origin).await);
        self.insert(host, rules.clone()).await;
        rules
    }
}

/// The robots.txt policy surface the rate limiter and pipeline consume.
#[async_trait]
pub trait RobotsService: Send + Sync {
    async fn is_allowed(&self, url: &str, user_agent: &str) -> bool;
    /// `url` (not just a bare host) so the fetch, if one is needed, can use
    /// the crawled page's actual scheme and port rather than guessing.
    async fn get_crawl_delay(&self, url: &str, user_agent: &str) -> Option<u64>;
    async fn get_sitemaps(&self, host: &str) -> Vec<String>;
    async fn refresh_robots_txt(&self, host: &str);
    async fn prefetch_robots(&self, host: &str);
    async fn clear_cache(&self);
}

pub struct DefaultRobotsService {
    cache: RobotsCache,
}

impl DefaultRobotsService {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { cache: RobotsCache::new(fetcher) }
    }
}

#[async_trait]
impl RobotsService for DefaultRobotsService {
    async fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        let Some(host) = host_of(url) else { return true };
        let Some(origin) = origin_of(url) else { return true };
        let path = path_of(url);
        let rules = self.cache.get_or_fetch(&host, &origin).await;
        rules.is_allowed(&path, user_agent)
    }

    async fn get_crawl_delay(&self, url: &str, user_agent: &str) -> Option<u64> {
        let host = host_of(url)?;
        let origin = origin_of(url)?;
        let rules = self.cache.get_or_fetch(&host, &origin).await;
        rules.crawl_delay_ms(user_agent)
    }

    async fn get_sitemaps(&self, host: &str) -> Vec<String> {
        let origin = format!("https://{host}");
        self.cache.get_or_fetch(host, &origin).await.sitemaps.clone()
    }

    async fn refresh_robots_txt(&self, host: &str) {
        let origin = format!("https://{host}");
        self.cache.refresh(host, &origin).await;
    }

    async fn prefetch_robots(&self, host: &str) {
        let origin = format!("https://{host}");
        self.cache.get_or_fetch(host, &origin).await;
    }

    async fn clear_cache(&self) {
        self.cache.clear().await;
    }
}

fn path_of(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| {
            let mut p = u.path().to_string();
            if let Some(query) = u.query() {
                p.push('?');
                p.push_str(query);
            }
            p
        })
        .unwrap_or_else(|_| "/".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reads_disallow_crawl_delay_and_sitemap() {
        let text = "User-agent: *\nDisallow: /private\nCrawl-delay: 2.5\nSitemap: https://a.test/sitemap.xml\n";
        let rules = parse(text);
        assert!(!rules.is_allowed("/private/x", "AnyBot"));
        assert!(rules.is_allowed("/public", "AnyBot"));
        assert_eq!(rules.crawl_delay_ms("AnyBot"), Some(2500));
        assert_eq!(rules.sitemaps, vec!["https://a.test/sitemap.xml".to_string()]);
    }

    #[test]
    fn exact_user_agent_match_takes_precedence_over_wildcard() {
        let text = "User-agent: *\nDisallow: /all\n\nUser-agent: GoodBot\nDisallow: /goodbot-only\n";
        let rules = parse(text);
        assert!(!rules.is_allowed("/goodbot-only", "GoodBot"));
        assert!(rules.is_allowed("/all", "GoodBot"));
        assert!(!rules.is_allowed("/all", "OtherBot"));
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let text = "# comment\n\nUser-agent: *\n# another\nDisallow: /x\n";
        let rules = parse(text);
        assert!(!rules.is_allowed("/x", "Bot"));
    }

    #[test]
    fn missing_user_agent_group_allows_everything() {
        let rules = RobotsRules::allow_all();
        assert!(rules.is_allowed("/anything", "Bot"));
    }

    #[test]
    fn parse_serialize_parse_round_trips() {
        let text = "User-agent: *\nDisallow: /a\nDisallow: /b\nCrawl-delay: 1\nSitemap: https://a.test/sm.xml\n";
        let rules = parse(text);
        let serialized = rules.serialize();
        let reparsed = parse(&serialized);
        assert_eq!(rules, reparsed);
    }
}
