//! The per-page pipeline (§4.2): dedup -> robots -> fetch -> gate ->
//! extract -> link discovery -> child generation -> persist, always
//! producing exactly one [`CrawlResult`].

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use indexmap::IndexMap;
use scraper::Html;
use tracing::{debug, warn};

use crate::extraction::{extract_images, extract_links, extract_metadata, ExtractionEngine};
use crate::fetcher::Fetcher;
use crate::models::{CrawlMetrics, CrawlResult, CrawlStatus, PageMetadata, Request, WebPage};
use crate::robots::RobotsService;
use crate::sink::{log_persist_failure, ResultSink};
use crate::url_utils::{is_valid_http_url, same_host};

const RECENTLY_CRAWLED_WINDOW_MINUTES: i64 = 60;
const MAX_CHILD_REQUESTS: usize = 100;

/// Orchestrates a single request through every pipeline step.
pub struct PagePipeline {
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn ResultSink>,
    robots: Arc<dyn RobotsService>,
    extraction: ExtractionEngine,
}

impl PagePipeline {
    pub fn new(fetcher: Arc<dyn Fetcher>, sink: Arc<dyn ResultSink>, robots: Arc<dyn RobotsService>) -> Self {
        Self { fetcher, sink, robots, extraction: ExtractionEngine::new() }
    }

    #[tracing::instrument(skip(self, request), fields(url = %request.url, depth = request.depth))]
    pub async fn execute(&self, request: Request) -> CrawlResult {
        let pipeline_start = Instant::now();

        if self.sink.was_recently_crawled(&request.url, RECENTLY_CRAWLED_WINDOW_MINUTES).await {
            debug!("skipping, recently crawled");
            return self.finish(CrawlResult::terminal(request, CrawlStatus::Skipped, "Recently crawled")).await;
        }

        if request.policy.respect_robots_txt {
            let allowed = self.robots.is_allowed(&request.url, &request.policy.user_agent).await;
            if !allowed {
                debug!("blocked by robots.txt");
                return self.finish(CrawlResult::terminal(request, CrawlStatus::RobotsBlocked, "Disallowed by robots.txt")).await;
            }
        }

        let download_start = Instant::now();
        let response = match self.fetcher.fetch(&request.url).await {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "fetch raised an error");
                return self.finish(CrawlResult::terminal(request, CrawlStatus::Failed, error.to_string())).await;
            }
        };
        let download_ms = download_start.elapsed().as_millis() as u64;

        if !response.is_successful || response.body.as_ref().map(|b| b.is_empty()).unwrap_or(true) {
            let message = response.error.clone().unwrap_or_else(|| {
                format!("request failed with status {:?}", response.status_code)
            });
            let status = if response.error.is_some() { CrawlStatus::NetworkError } else { CrawlStatus::Failed };
            return self.finish(CrawlResult::terminal(request, status, message)).await;
        }

        let content_type = response.content_type();
        if !content_type.is_empty() {
            let allowed = request
                .policy
                .allowed_content_types
                .iter()
                .any(|allowed| content_type.to_lowercase().contains(&allowed.to_lowercase()));
            if !allowed {
                return self.finish(CrawlResult::terminal(
                    request,
                    CrawlStatus::UnsupportedContentType,
                    format!("content-type '{content_type}' is not in the allow list"),
                )).await;
            }
        } else {
            warn!("empty content-type header, accepting anyway");
        }

        let body = response.body.unwrap_or_default();
        if body.len() > request.policy.max_content_length {
            return self.finish(CrawlResult::terminal(
                request,
                CrawlStatus::ContentTooLarge,
                format!("body of {} bytes exceeds limit of {} bytes", body.len(), request.policy.max_content_length),
            )).await;
        }

        let content = String::from_utf8_lossy(&body).into_owned();

        let extraction_start = Instant::now();
        let fields = self.extraction.extract_data(&content, &content_type, &request.rules, &request.url);
        let extraction_ms = extraction_start.elapsed().as_millis() as u64;

        let (links, images, meta) = if content_type.to_lowercase().contains("html") {
            let document = Html::parse_document(&content);
            (
                extract_links(&document, &request.url),
                extract_images(&document, &request.url),
                extract_metadata(&document),
            )
        } else {
            Default::default()
        };

        let metadata = PageMetadata {
            status_code: response.status_code.unwrap_or(0),
            content_type: content_type.clone(),
            content_length: body.len(),
            headers: response.headers.clone(),
            charset: meta.charset,
            language: meta.language,
        };

        let total_ms = pipeline_start.elapsed().as_millis() as u64;
        let metrics = CrawlMetrics {
            download_ms,
            parse_ms: 0,
            extraction_ms,
            total_ms: total_ms.max(download_ms + extraction_ms),
            content_bytes: body.len(),
            extracted_field_count: fields.len(),
        };

        let new_requests = if request.depth < request.max_depth {
            self.child_requests(&request, &links)
        } else {
            Vec::new()
        };

        let page = WebPage {
            url: response.url,
            title: meta.title,
            content,
            fields,
            links: links.into_iter().collect(),
            images,
            metadata,
            completed_at: Utc::now(),
            request_id: request.id.clone(),
            depth: request.depth,
            source: request.source().map(str::to_string),
            response_time_ms: total_ms,
        };

        if let Err(error) = self.sink.save_web_page(&page).await {
            log_persist_failure("save_web_page", &page.url, &error);
        }

        let result = CrawlResult {
            request,
            page: Some(page),
            status: CrawlStatus::Success,
            error: None,
            new_requests,
            timestamp: Utc::now(),
            metrics,
        };
        self.finish(result).await
    }

    fn child_requests(&self, parent: &Request, links: &indexmap::IndexSet<String>) -> Vec<Request> {
        links
            .iter()
            .filter(|link| is_valid_http_url(link) && same_host(link, &parent.url))
            .take(MAX_CHILD_REQUESTS)
            .map(|link| parent.child(link.clone()))
            .collect()
    }

    /// Persist the result (fire-and-await; failures are logged, not
    /// propagated) and return it unchanged.
    async fn finish(&self, result: CrawlResult) -> CrawlResult {
        let url = result.request.url.clone();
        if let Err(error) = self.sink.save_result(&result).await {
            log_persist_failure("save_result", &url, &error);
        }
        debug!(status = ?result.status, %url, "pipeline finished");
        result
    }
}
