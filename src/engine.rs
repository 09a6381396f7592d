//! The scheduler/worker pool (§4.1): a bounded request queue drained by N
//! workers, a bounded result channel the caller streams from, live stats,
//! and the standalone `batch_crawl` variant (§4.7).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::models::{CrawlResult, CrawlStatus, Request};
use crate::pipeline::PagePipeline;
use crate::rate_limiter::DomainRateLimiter;

const DEFAULT_MAX_CONCURRENCY: usize = 50;
const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_RESULT_BUFFER_SIZE: usize = 1_000;
const DEFAULT_PROGRESS_REPORT_INTERVAL_MS: u64 = 5_000;
const RPS_WINDOW: Duration = Duration::from_secs(60);
const RPS_WINDOW_MAX_SAMPLES: usize = 1_000;

/// Construction parameters for [`CrawlEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub queue_capacity: usize,
    pub result_buffer_size: usize,
    pub progress_report_interval_ms: u64,
    pub default_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            result_buffer_size: DEFAULT_RESULT_BUFFER_SIZE,
            progress_report_interval_ms: DEFAULT_PROGRESS_REPORT_INTERVAL_MS,
            default_delay_ms: 1_000,
            max_retries: 3,
        }
    }
}

/// A point-in-time snapshot of [`CrawlEngine::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStatsSnapshot {
    pub running: bool,
    pub total: u64,
    pub processed: u64,
    pub successes: u64,
    pub failures: u64,
    pub queue_size: usize,
    pub rps: f64,
    pub success_rate: f64,
}

/// Atomics-backed live counters, safe to read concurrently without ever
/// observing a half-updated snapshot.
struct Stats {
    total: AtomicU64,
    processed: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    completions: Mutex<VecDeque<Instant>>,
}

impl Stats {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            completions: Mutex::new(VecDeque::new()),
        }
    }

    fn note_submitted(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    async fn note_completed(&self, success: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }

        let now = Instant::now();
        let mut completions = self.completions.lock().await;
        completions.push_back(now);
        while completions.len() > RPS_WINDOW_MAX_SAMPLES {
            completions.pop_front();
        }
        while completions.front().map(|t| t.elapsed() > RPS_WINDOW).unwrap_or(false) {
            completions.pop_front();
        }
    }

    async fn rps(&self) -> f64 {
        let completions = self.completions.lock().await;
        if completions.is_empty() {
            return 0.0;
        }
        let span = completions.front().unwrap().elapsed().as_secs_f64().max(1.0).min(RPS_WINDOW.as_secs_f64());
        completions.len() as f64 / span
    }

    async fn snapshot(&self, running: bool, queue_size: usize) -> EngineStatsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            running,
            total: self.total.load(Ordering::Relaxed),
            processed,
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            queue_size,
            rps: self.rps().await,
            success_rate: if processed == 0 { 0.0 } else { successes as f64 / processed as f64 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopped,
}

/// Errors specific to engine lifecycle misuse.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is already running")]
    AlreadyRunning,
    #[error("engine is not running")]
    NotRunning,
}

/// The bounded-queue, N-worker scheduler described in §4.1.
pub struct CrawlEngine {
    config: EngineConfig,
    pipeline: Arc<PagePipeline>,
    rate_limiter: Arc<DomainRateLimiter>,
    state: Mutex<State>,
    queue_tx: mpsc::Sender<Request>,
    queue_rx: Mutex<Option<mpsc::Receiver<Request>>>,
    stats: Arc<Stats>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl CrawlEngine {
    pub fn new(config: EngineConfig, pipeline: Arc<PagePipeline>, rate_limiter: Arc<DomainRateLimiter>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        Self {
            config,
            pipeline,
            rate_limiter,
            state: Mutex::new(State::Idle),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            stats: Arc::new(Stats::new()),
            workers: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
        }
    }

    /// Spawn `max_concurrency` workers and the progress monitor, returning
    /// the result stream. Idempotent per spec only in the sense that a
    /// second call while RUNNING fails with [`EngineError::AlreadyRunning`].
    pub async fn start(&self) -> Result<ReceiverStream<CrawlResult>, EngineError> {
        let mut state = self.state.lock().await;
        if *state == State::Running {
            return Err(EngineError::AlreadyRunning);
        }
        *state = State::Running;
        drop(state);

        let queue_rx = self.queue_rx.lock().await.take().expect("queue receiver taken exactly once");
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let queue_tx = self.queue_tx.clone();

        let (result_tx, result_rx) = mpsc::channel(self.config.result_buffer_size);

        let mut handles = Vec::with_capacity(self.config.max_concurrency);
        for worker_id in 0..self.config.max_concurrency {
            let pipeline = self.pipeline.clone();
            let rate_limiter = self.rate_limiter.clone();
            let queue_rx = queue_rx.clone();
            let queue_tx = queue_tx.clone();
            let result_tx = result_tx.clone();
            let stats = self.stats.clone();

            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, pipeline, rate_limiter, queue_rx, queue_tx, result_tx, stats).await;
            }));
        }
        drop(result_tx);

        *self.workers.lock().await = handles;

        let stats = self.stats.clone();
        let interval_ms = self.config.progress_report_interval_ms;
        let monitor = tokio::spawn(async move {
            progress_monitor(stats, interval_ms).await;
        });
        *self.monitor.lock().await = Some(monitor);

        Ok(ReceiverStream::new(result_rx))
    }

    /// Enqueue `request`, suspending if the queue is full. Fails with
    /// [`EngineError::NotRunning`] if the engine isn't RUNNING.
    pub async fn submit(&self, request: Request) -> Result<(), EngineError> {
        if *self.state.lock().await != State::Running {
            return Err(EngineError::NotRunning);
        }
        self.stats.note_submitted();
        self.queue_tx.send(request).await.map_err(|_| EngineError::NotRunning)
    }

    pub async fn submit_many(&self, requests: Vec<Request>) -> Result<(), EngineError> {
        for request in requests {
            self.submit(request).await?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> EngineStatsSnapshot {
        let running = *self.state.lock().await == State::Running;
        let queue_size = self.config.queue_capacity.saturating_sub(self.queue_tx.capacity());
        self.stats.snapshot(running, queue_size).await
    }

    /// Transition to STOPPED: closes the request queue, joins workers, and
    /// drops the result sender (closing the caller's stream).
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if *state != State::Running {
            *state = State::Stopped;
            return;
        }
        *state = State::Stopped;
        drop(state);

        // Dropping our sender clone lets in-flight `queue.recv` calls see
        // end-of-stream once all submitters have also dropped their clones.
        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    pipeline: Arc<PagePipeline>,
    rate_limiter: Arc<DomainRateLimiter>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Request>>>,
    queue_tx: mpsc::Sender<Request>,
    result_tx: mpsc::Sender<CrawlResult>,
    stats: Arc<Stats>,
) {
    loop {
        let request = {
            let mut rx = queue_rx.lock().await;
            rx.recv().await
        };
        let Some(request) = request else {
            debug!(worker_id, "queue closed, worker exiting");
            break;
        };

        if request.policy.respect_robots_txt || request.policy.delay_ms > 0 {
            rate_limiter.wait_then_note(&request.url, &request.policy.user_agent).await;
        }

        let result = pipeline.execute(request).await;
        stats.note_completed(result.status.is_success()).await;

        let children = if result.status == CrawlStatus::Success { result.new_requests.clone() } else { Vec::new() };

        if result_tx.send(result).await.is_err() {
            debug!(worker_id, "result channel closed, worker exiting");
            break;
        }

        for child in children {
            // Non-blocking: drop silently on a full queue rather than
            // deadlock against the very workers draining it.
            let _ = queue_tx.try_send(child);
        }
    }
}

async fn progress_monitor(stats: Arc<Stats>, interval_ms: u64) {
    let mut last_milestone: u64 = 0;
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    loop {
        ticker.tick().await;
        let processed = stats.processed.load(Ordering::Relaxed);
        let milestone = processed / 1_000;
        if milestone > last_milestone {
            last_milestone = milestone;
            info!(processed, "crawl progress");
        }
    }
}

/// A self-contained crawl that does not share state with a [`CrawlEngine`]
/// (§4.7): its own unbounded request channel, its own bounded result
/// channel, completing once every submitted and transitively-discovered
/// request has a result.
pub async fn batch_crawl(
    pipeline: Arc<PagePipeline>,
    rate_limiter: Arc<DomainRateLimiter>,
    requests: Vec<Request>,
    max_concurrency: usize,
    batch_id: String,
) -> ReceiverStream<CrawlResult> {
    let (queue_tx, queue_rx) = mpsc::unbounded_channel::<Request>();
    let (result_tx, result_rx) = mpsc::channel(1_000);
    let queue_rx = Arc::new(Mutex::new(queue_rx));

    let total = Arc::new(AtomicU64::new(requests.len() as u64));
    let completed = Arc::new(AtomicU64::new(0));
    let running = Arc::new(AtomicBool::new(true));

    for request in requests {
        let _ = queue_tx.send(request);
    }

    let mut handles = Vec::with_capacity(max_concurrency);
    for _ in 0..max_concurrency {
        let pipeline = pipeline.clone();
        let rate_limiter = rate_limiter.clone();
        let queue_rx = queue_rx.clone();
        let queue_tx = queue_tx.clone();
        let result_tx = result_tx.clone();
        let total = total.clone();
        let completed = completed.clone();
        let running = running.clone();
        let batch_id = batch_id.clone();

        handles.push(tokio::spawn(async move {
            batch_worker(pipeline, rate_limiter, queue_rx, queue_tx, result_tx, total, completed, running, batch_id).await;
        }));
    }
    drop(result_tx);
    drop(queue_tx);

    tokio::spawn(async move {
        for handle in handles {
            let _ = handle.await;
        }
    });

    ReceiverStream::new(result_rx)
}

#[allow(clippy::too_many_arguments)]
async fn batch_worker(
    pipeline: Arc<PagePipeline>,
    rate_limiter: Arc<DomainRateLimiter>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<Request>>>,
    queue_tx: mpsc::UnboundedSender<Request>,
    result_tx: mpsc::Sender<CrawlResult>,
    total: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    batch_id: String,
) {
    while running.load(Ordering::Relaxed) {
        let request = {
            let mut rx = queue_rx.lock().await;
            // An unbounded channel never truly closes while senders exist;
            // poll with a short timeout so we notice `completed >= total`.
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
        };

        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(_) => {
                if completed.load(Ordering::Relaxed) >= total.load(Ordering::Relaxed) {
                    break;
                }
                continue;
            }
        };

        rate_limiter.wait_then_note(&request.url, &request.policy.user_agent).await;
        let result = pipeline.execute(request).await;

        if result.status == CrawlStatus::Success && !result.new_requests.is_empty() {
            total.fetch_add(result.new_requests.len() as u64, Ordering::Relaxed);
            for child in &result.new_requests {
                let _ = queue_tx.send(child.clone());
            }
        }

        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
        if done % 100 == 0 {
            info!(batch_id = %batch_id, completed = done, total = total.load(Ordering::Relaxed), "batch crawl progress");
        }

        if result_tx.send(result).await.is_err() {
            running.store(false, Ordering::Relaxed);
            break;
        }

        if done >= total.load(Ordering::Relaxed) {
            running.store(false, Ordering::Relaxed);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{FetchResponse, Fetcher};
    use crate::models::CrawlPolicy;
    use crate::robots::DefaultRobotsService;
    use crate::sink::InMemoryResultSink;
    use async_trait::async_trait;
    use futures::StreamExt;

    struct AlwaysFailFetcher;

    #[async_trait]
    impl Fetcher for AlwaysFailFetcher {
        async fn fetch(&self, _url: &str) -> anyhow::Result<FetchResponse> {
            Ok(FetchResponse { is_successful: false, error: Some("no such host".into()), ..Default::default() })
        }
    }

    fn test_engine(queue_capacity: usize, max_concurrency: usize) -> CrawlEngine {
        let fetcher: Arc<dyn Fetcher> = Arc::new(AlwaysFailFetcher);
        let sink = Arc::new(InMemoryResultSink::new());
        let robots = Arc::new(DefaultRobotsService::new(fetcher.clone()));
        let pipeline = Arc::new(PagePipeline::new(fetcher, sink, robots.clone()));
        let rate_limiter = Arc::new(DomainRateLimiter::new(robots, 0));
        let config = EngineConfig { max_concurrency, queue_capacity, ..EngineConfig::default() };
        CrawlEngine::new(config, pipeline, rate_limiter)
    }

    #[tokio::test]
    async fn every_submitted_request_yields_exactly_one_result() {
        let engine = test_engine(100, 4);
        let mut stream = engine.start().await.unwrap();

        for i in 0..20 {
            let request = Request::new(format!("https://a.test/{i}"), 0, Vec::new(), CrawlPolicy::default());
            engine.submit(request).await.unwrap();
        }

        let mut seen = 0;
        while seen < 20 {
            if stream.next().await.is_some() {
                seen += 1;
            }
        }
        assert_eq!(seen, 20);

        let snapshot = engine.stats().await;
        assert_eq!(snapshot.processed, snapshot.successes + snapshot.failures);
    }

    #[tokio::test]
    async fn start_twice_fails_with_already_running() {
        let engine = test_engine(10, 1);
        let _stream = engine.start().await.unwrap();
        assert!(matches!(engine.start().await, Err(EngineError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn submit_after_stop_fails_with_not_running() {
        let engine = test_engine(10, 1);
        let _stream = engine.start().await.unwrap();
        engine.stop().await;
        let request = Request::new("https://a.test/", 0, Vec::new(), CrawlPolicy::default());
        assert!(matches!(engine.submit(request).await, Err(EngineError::NotRunning)));
    }
}
