//! Tool executor: the `web_search` and `web_fetch` capabilities offered to
//! backends during investigation.
//!
//! ## Failure shape
//!
//! Nothing in here returns an error to the worker. Every outcome, including
//! an unknown tool name or unparseable arguments, becomes a [`ToolOutcome`]
//! whose rendered text is appended to the conversation as the tool result.
//!
//! ## Shared state
//!
//! The [`FetchRateLimiter`] is the only mutable state shared between
//! concurrently running workers.

pub mod blocklist;
pub mod extract;
pub mod rate_limit;
pub mod web;

pub use blocklist::{BlocklistError, DomainBlocklist};
pub use rate_limit::FetchRateLimiter;
pub use web::{
    FetchError, HttpPageSource, Page, PageSource, SearchBackend, SearchError, SearchHit,
    SearxngSearch,
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::llm::{FunctionCall, FunctionDefinition, ToolDefinition};

pub const SEARCH_TOOL: &str = "web_search";
pub const FETCH_TOOL: &str = "web_fetch";

/// A validated tool request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocation {
    Search { query: String },
    Fetch { url: String },
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
}

#[derive(Deserialize)]
struct FetchArgs {
    url: String,
}

/// A tool call the executor refused to run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolDispatchError {
    #[error("Unknown tool '{0}'. Valid tools are: web_search, web_fetch")]
    UnknownTool(String),
    #[error("Malformed arguments for {tool}: {reason}")]
    MalformedArguments { tool: String, reason: String },
}

impl ToolDispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::MalformedArguments { .. } => "malformed_arguments",
        }
    }
}

impl ToolInvocation {
    /// Validate a raw function call against the declared tool schemas.
    pub fn parse(call: &FunctionCall) -> Result<Self, ToolDispatchError> {
        let raw = if call.arguments.trim().is_empty() {
            "{}"
        } else {
            call.arguments.as_str()
        };
        let malformed = |reason: String| ToolDispatchError::MalformedArguments {
            tool: call.name.clone(),
            reason,
        };

        match call.name.as_str() {
            SEARCH_TOOL => {
                let args: SearchArgs =
                    serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
                let query = args.query.trim();
                if query.is_empty() {
                    return Err(malformed("query must not be empty".to_string()));
                }
                Ok(ToolInvocation::Search {
                    query: query.to_string(),
                })
            }
            FETCH_TOOL => {
                let args: FetchArgs =
                    serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
                let url = args.url.trim();
                if url.is_empty() {
                    return Err(malformed("url must not be empty".to_string()));
                }
                Ok(ToolInvocation::Fetch {
                    url: url.to_string(),
                })
            }
            other => Err(ToolDispatchError::UnknownTool(other.to_string())),
        }
    }
}

/// Result of a search. An unreachable backend and an empty result set have
/// the same shape; the note says which it was.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Outcome of one dispatched tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Search(SearchOutcome),
    Fetched(String),
    FetchFailed(FetchError),
    Rejected(ToolDispatchError),
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::FetchFailed(_) | ToolOutcome::Rejected(_))
    }

    /// Text placed in the tool-result turn.
    pub fn render(&self) -> String {
        match self {
            ToolOutcome::Search(outcome) => {
                serde_json::to_string(outcome).unwrap_or_else(|_| "{\"results\":[]}".to_string())
            }
            ToolOutcome::Fetched(text) => text.clone(),
            ToolOutcome::FetchFailed(err) => err.to_payload().to_string(),
            ToolOutcome::Rejected(err) => json!({
                "error": err.code(),
                "message": err.to_string(),
            })
            .to_string(),
        }
    }
}

/// Size limits applied to tool output.
#[derive(Debug, Clone)]
pub struct ToolLimits {
    pub max_fetch_chars: usize,
    pub max_search_results: usize,
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            max_fetch_chars: 15_000,
            max_search_results: 10,
        }
    }
}

/// Executes tool calls on behalf of a backend mid-conversation.
pub struct ToolExecutor {
    search: Arc<dyn SearchBackend>,
    pages: Arc<dyn PageSource>,
    blocklist: DomainBlocklist,
    rate_limiter: Arc<FetchRateLimiter>,
    limits: ToolLimits,
}

impl ToolExecutor {
    pub fn new(
        search: Arc<dyn SearchBackend>,
        pages: Arc<dyn PageSource>,
        blocklist: DomainBlocklist,
        rate_limiter: Arc<FetchRateLimiter>,
        limits: ToolLimits,
    ) -> Self {
        Self {
            search,
            pages,
            blocklist,
            rate_limiter,
            limits,
        }
    }

    /// JSON-schema tool declarations offered to backends.
    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: SEARCH_TOOL.to_string(),
                    description: "Search the web for information. Returns titles, URLs, and snippets."
                        .to_string(),
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "query": {"type": "string", "description": "Search query"}
                        },
                        "required": ["query"]
                    }),
                },
            },
            ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: FETCH_TOOL.to_string(),
                    description: "Fetch and read the text content of a web page.".to_string(),
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "url": {"type": "string", "description": "URL to fetch"}
                        },
                        "required": ["url"]
                    }),
                },
            },
        ]
    }

    /// Validate and run one tool call.
    pub async fn dispatch(&self, call: &FunctionCall) -> ToolOutcome {
        match ToolInvocation::parse(call) {
            Ok(ToolInvocation::Search { query }) => ToolOutcome::Search(self.search(&query).await),
            Ok(ToolInvocation::Fetch { url }) => match self.fetch(&url).await {
                Ok(text) => ToolOutcome::Fetched(text),
                Err(err) => ToolOutcome::FetchFailed(err),
            },
            Err(err) => {
                tracing::debug!("Rejected tool call {}: {}", call.name, err);
                ToolOutcome::Rejected(err)
            }
        }
    }

    /// Search the web. Never fails: backend errors degrade to an empty
    /// result list with an explanatory note.
    pub async fn search(&self, query: &str) -> SearchOutcome {
        self.rate_limiter.acquire().await;
        match self.search.search(query).await {
            Ok(hits) => {
                let results: Vec<SearchHit> = hits
                    .into_iter()
                    .filter(|hit| !self.blocklist.is_blocked(&hit.url))
                    .take(self.limits.max_search_results)
                    .collect();
                let note = results
                    .is_empty()
                    .then(|| format!("No results found for: {}", query));
                SearchOutcome { results, note }
            }
            Err(err) => {
                tracing::warn!("Search unavailable for {:?}: {}", query, err);
                SearchOutcome {
                    results: Vec::new(),
                    note: Some(format!("Search could not be performed: {}", err)),
                }
            }
        }
    }

    /// Fetch a page and return its extracted text.
    ///
    /// Blocked domains short-circuit before the rate limiter and the network.
    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        if self.blocklist.is_blocked(url) {
            tracing::debug!("Refusing to fetch blocked URL {}", url);
            return Err(FetchError::BlockedDomain);
        }
        let parsed = url::Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        self.rate_limiter.acquire().await;
        let page = self.pages.get(&parsed).await?;
        if !(200..300).contains(&page.status) {
            return Err(FetchError::HttpStatus(page.status));
        }

        let text = extract::extract_text(&page.body, page.content_type.as_deref());
        if text.trim().is_empty() {
            return Err(FetchError::ExtractionEmpty);
        }
        Ok(extract::truncate_chars(text, self.limits.max_fetch_chars))
    }
}
