//! The HTTP fetcher contract (§6) and a `reqwest`-backed default
//! implementation.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::debug;

use crate::models::CrawlPolicy;

/// The response shape every fetcher implementation must produce: header
/// names normalised to lower case, redirects already followed.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub url: String,
    pub status_code: Option<u16>,
    pub body: Option<Vec<u8>>,
    pub headers: IndexMap<String, Vec<String>>,
    pub is_successful: bool,
    pub error: Option<String>,
}

impl FetchResponse {
    /// First value of the (already lower-cased) `content-type` header, or
    /// an empty string if absent.
    pub fn content_type(&self) -> String {
        self.headers
            .get("content-type")
            .and_then(|values| values.first())
            .cloned()
            .unwrap_or_default()
    }
}

/// Fetches a single URL. Implementations are expected to follow redirects
/// internally per the caller's policy and to never panic on network errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchResponse>;
}

/// Default fetcher backed by `reqwest`, configured per [`CrawlPolicy`].
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn from_policy(policy: &CrawlPolicy) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &policy.additional_headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        let redirect_policy = if policy.follow_redirects {
            reqwest::redirect::Policy::limited(policy.max_redirects)
        } else {
            reqwest::redirect::Policy::none()
        };

        let client = reqwest::Client::builder()
            .user_agent(policy.user_agent.as_str())
            .timeout(Duration::from_millis(policy.request_timeout_ms))
            .connect_timeout(Duration::from_secs(10))
            .redirect(redirect_policy)
            .default_headers(headers)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchResponse> {
        debug!(%url, "fetching");
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(error) => {
                return Ok(FetchResponse {
                    url: url.to_string(),
                    is_successful: false,
                    error: Some(error.to_string()),
                    ..Default::default()
                });
            }
        };

        let final_url = response.url().to_string();
        let status_code = response.status().as_u16();
        let is_successful = response.status().is_success();

        let mut headers: IndexMap<String, Vec<String>> = IndexMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_lowercase())
                    .or_default()
                    .push(value.to_string());
            }
        }

        let body = match response.bytes().await {
            Ok(bytes) => Some(bytes.to_vec()),
            Err(error) => {
                return Ok(FetchResponse {
                    url: final_url,
                    status_code: Some(status_code),
                    headers,
                    is_successful: false,
                    error: Some(error.to_string()),
                    body: None,
                });
            }
        };

        Ok(FetchResponse {
            url: final_url,
            status_code: Some(status_code),
            body,
            headers,
            is_successful,
            error: None,
        })
    }
}
