//! Web access: pluggable search backends and page sources.
//!
//! The executor in `tools/mod.rs` owns policy (blocklist, rate limiting,
//! truncation); the types here only move bytes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const USER_AGENT: &str = "verdict-fanout-tool-executor/1.0";
pub const DEFAULT_SEARXNG_URL: &str = "http://localhost:8080/search";

/// One search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// The search backend could not be used.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error("search backend timed out")]
    Timeout,
    #[error("search backend is unreachable: {0}")]
    Unreachable(String),
    #[error("search backend returned HTTP {0}")]
    Http(u16),
    #[error("search backend returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// A source of web search results.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError>;
}

/// Typed failure of a page fetch. Returned to the backend, never raised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("blocked_domain")]
    BlockedDomain,
    #[error("invalid_url: {0}")]
    InvalidUrl(String),
    #[error("HTTP {0}")]
    HttpStatus(u16),
    #[error("timeout")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("extraction_empty")]
    ExtractionEmpty,
}

impl FetchError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BlockedDomain => "blocked_domain",
            Self::InvalidUrl(_) => "invalid_url",
            Self::HttpStatus(_) => "http_status",
            Self::Timeout => "timeout",
            Self::Network(_) => "network",
            Self::ExtractionEmpty => "extraction_empty",
        }
    }

    /// JSON payload placed in the tool-result turn.
    pub fn to_payload(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        if let Self::HttpStatus(status) = self {
            payload["status"] = serde_json::json!(status);
        }
        payload
    }
}

/// Raw response from a page source.
#[derive(Debug, Clone)]
pub struct Page {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

/// Performs the actual HTTP GET for a fetch.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn get(&self, url: &url::Url) -> Result<Page, FetchError>;
}

/// SearxNG JSON API search backend.
pub struct SearxngSearch {
    client: reqwest::Client,
    endpoint: String,
}

impl SearxngSearch {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearxngResponse {
    #[serde(default)]
    results: Vec<SearxngResult>,
}

#[derive(Debug, Deserialize)]
struct SearxngResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

#[async_trait]
impl SearchBackend for SearxngSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json")])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchError::Timeout
                } else {
                    SearchError::Unreachable(format!("{} ({})", self.endpoint, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Http(status.as_u16()));
        }

        let parsed: SearxngResponse = response
            .json()
            .await
            .map_err(|e| SearchError::InvalidResponse(e.to_string()))?;

        Ok(parsed
            .results
            .into_iter()
            .map(|r| SearchHit {
                title: r.title,
                url: r.url,
                snippet: r.content,
            })
            .collect())
    }
}

/// reqwest-backed page source.
pub struct HttpPageSource {
    client: reqwest::Client,
}

impl HttpPageSource {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn get(&self, url: &url::Url) -> Result<Page, FetchError> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = if response.status().is_success() {
            response.text().await.map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Network(e.to_string())
                }
            })?
        } else {
            String::new()
        };

        Ok(Page {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_payload() {
        let payload = FetchError::HttpStatus(404).to_payload();
        assert_eq!(payload["error"], "http_status");
        assert_eq!(payload["status"], 404);

        let payload = FetchError::BlockedDomain.to_payload();
        assert_eq!(payload["error"], "blocked_domain");
        assert!(payload.get("status").is_none());
    }

    #[test]
    fn test_searxng_response_parse() {
        let body = r#"{"query": "x", "results": [
            {"title": "Douglas Adams", "url": "https://example.org/da", "content": "English author", "engine": "ddg"},
            {"url": "https://example.org/bare"}
        ]}"#;
        let parsed: SearxngResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.results[0].content, "English author");
        assert_eq!(parsed.results[1].title, "");
    }

    #[tokio::test]
    async fn test_unreachable_searxng_is_an_error_not_a_panic() {
        // Port 9 (discard) is essentially never listening on localhost.
        let search = SearxngSearch::new("http://127.0.0.1:9/search", Duration::from_secs(2));
        let result = search.search("anything").await;
        assert!(result.is_err());
    }
}
