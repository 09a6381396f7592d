//! A concurrent, policy-aware web crawler library.
//!
//! [`CrawlEngine`] drives a bounded worker pool over a queue of
//! [`Request`]s, each processed by [`PagePipeline`]: dedup against the
//! result sink, a `robots.txt` check, a fetch, content-type/size gates, a
//! composable extraction DSL, and link discovery for the next depth. Per
//! host, [`DomainRateLimiter`] enforces politeness delays sourced from
//! `robots.txt` or a configured default.
//!
//! [`CrawlerConfig`]/[`CrawlerConfigBuilder`] assemble a set of named
//! sources into the requests the engine consumes; [`ResultSink`] is the
//! storage seam callers implement for anything beyond the in-memory
//! reference.

pub mod config;
pub mod engine;
pub mod extraction;
pub mod fetcher;
pub mod models;
pub mod pipeline;
pub mod postprocess;
pub mod rate_limiter;
pub mod robots;
pub mod sink;
pub mod url_utils;

pub use config::{CrawlerConfig, CrawlerConfigBuilder, SourceConfig};
pub use engine::{CrawlEngine, EngineConfig, EngineError, EngineStatsSnapshot};
pub use extraction::ExtractionEngine;
pub use fetcher::{FetchResponse, Fetcher, ReqwestFetcher};
pub use models::{
    CrawlMetrics, CrawlPolicy, CrawlResult, CrawlStatus, ExtractedValue, ExtractionRule,
    ExtractionType, ImageRecord, PageMetadata, PostProcessor, Priority, Request, Selector, WebPage,
};
pub use pipeline::PagePipeline;
pub use rate_limiter::DomainRateLimiter;
pub use robots::{DefaultRobotsService, RobotsRules, RobotsService};
pub use sink::{InMemoryResultSink, ResultSink, SourceStats};
