//! Per-domain politeness: a concurrent `host -> last crawl time` map, plus
//! a cached `host -> robots delay` so we don't re-ask the robots service on
//! every single request.
//!
//! This is a floor, not a mutex: two workers racing on the same host may
//! both compute a small wait and fetch close together. The crawl-delay is a
//! politeness target, not a critical section (see §5).

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::robots::RobotsService;
use crate::url_utils::host_of;
use std::sync::Arc;

/// Per-host crawl-delay politeness tracker.
pub struct DomainRateLimiter {
    last_crawl: RwLock<IndexMap<String, Instant>>,
    robots_delay_cache: RwLock<IndexMap<String, u64>>,
    robots: Arc<dyn RobotsService>,
    default_delay_ms: u64,
}

impl DomainRateLimiter {
    pub fn new(robots: Arc<dyn RobotsService>, default_delay_ms: u64) -> Self {
        Self {
            last_crawl: RwLock::new(IndexMap::new()),
            robots_delay_cache: RwLock::new(IndexMap::new()),
            robots,
            default_delay_ms,
        }
    }

    /// How long the caller must wait before fetching `url`.
    pub async fn compute_wait(&self, url: &str, user_agent: &str) -> Duration {
        let Some(host) = host_of(url) else {
            return Duration::ZERO;
        };

        let base_delay_ms = self.delay_for(url, &host, user_agent).await;

        let last = self.last_crawl.read().await.get(&host).copied();
        let elapsed = last.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
        let base = Duration::from_millis(base_delay_ms);
        base.saturating_sub(elapsed)
    }

    async fn delay_for(&self, url: &str, host: &str, user_agent: &str) -> u64 {
        if let Some(delay) = self.robots_delay_cache.read().await.get(host).copied() {
            return delay;
        }
        let delay = self
            .robots
            .get_crawl_delay(url, user_agent)
            .await
            .unwrap_or(self.default_delay_ms);
        self.robots_delay_cache.write().await.insert(host.to_string(), delay);
        delay
    }

    /// Suspend the caller for [`Self::compute_wait`], then record the crawl.
    pub async fn wait_then_note(&self, url: &str, user_agent: &str) {
        let wait = self.compute_wait(url, user_agent).await;
        if !wait.is_zero() {
            sleep(wait).await;
        }
        self.note_crawl(url).await;
    }

    /// Record `now` as the last crawl time for `url`'s host. Called
    /// unconditionally, even when the subsequent fetch fails.
    pub async fn note_crawl(&self, url: &str) {
        let Some(host) = host_of(url) else { return };
        self.last_crawl.write().await.insert(host, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{FetchResponse, Fetcher};
    use async_trait::async_trait;

    struct StaticFetcher;

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> anyhow::Result<FetchResponse> {
            Ok(FetchResponse { is_successful: false, ..Default::default() })
        }
    }

    #[tokio::test]
    async fn first_request_to_a_host_waits_zero() {
        let robots = Arc::new(crate::robots::DefaultRobotsService::new(Arc::new(StaticFetcher)));
        let limiter = DomainRateLimiter::new(robots, 1_000);
        let wait = limiter.compute_wait("https://a.test/x", "Bot").await;
        assert_eq!(wait, Duration::ZERO);
    }

    #[tokio::test]
    async fn second_request_waits_close_to_the_configured_delay() {
        let robots = Arc::new(crate::robots::DefaultRobotsService::new(Arc::new(StaticFetcher)));
        let limiter = DomainRateLimiter::new(robots, 200);
        limiter.wait_then_note("https://a.test/x", "Bot").await;
        let wait = limiter.compute_wait("https://a.test/y", "Bot").await;
        assert!(wait <= Duration::from_millis(200));
    }
}
