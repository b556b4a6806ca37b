//! OpenRouter API client implementation.
//!
//! Each call is a single HTTP request; retry policy is applied by the caller
//! so that a retry repeats one turn rather than a whole conversation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{classify_http_status, LlmError, LlmErrorKind};
use super::{
    ChatMessage, ChatOptions, ChatResponse, FinishReason, GenerationUsage, LlmClient,
    ReasoningContent, ResponseFormat, TokenUsage, ToolCall, ToolDefinition,
};

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const USAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// OpenRouter API client.
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    base_url: String,
    /// Generation stats are not queryable the instant a completion returns.
    usage_lookup_delay: Duration,
}

impl OpenRouterClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, OPENROUTER_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            usage_lookup_delay: Duration::from_millis(500),
        }
    }

    pub fn with_usage_lookup_delay(mut self, delay: Duration) -> Self {
        self.usage_lookup_delay = delay;
        self
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Create an LlmError from HTTP response status and body.
    fn create_error(
        status: reqwest::StatusCode,
        body: &str,
        retry_after: Option<Duration>,
    ) -> LlmError {
        let status_code = status.as_u16();
        match classify_http_status(status_code) {
            LlmErrorKind::RateLimited => LlmError::rate_limited(body.to_string(), retry_after),
            LlmErrorKind::ClientError => LlmError::client_error(status_code, body.to_string()),
            _ => LlmError::server_error(status_code, body.to_string()),
        }
    }

    fn network_error(e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::network_error(format!("Request timeout: {}", e))
        } else if e.is_connect() {
            LlmError::network_error(format!("Connection failed: {}", e))
        } else {
            LlmError::network_error(format!("Request failed: {}", e))
        }
    }

    async fn execute_request(&self, request: &OpenRouterRequest) -> Result<ChatResponse, LlmError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("X-Title", "verdict-fanout")
            .json(request)
            .send()
            .await
            .map_err(Self::network_error)?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Self::create_error(status, &body, retry_after));
        }

        let parsed: OpenRouterResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;

        // OpenRouter reports some upstream failures inside a 200 body.
        if let Some(err) = parsed.error {
            let code = err.code.unwrap_or(500);
            return Err(Self::create_error(
                reqwest::StatusCode::from_u16(code).unwrap_or(reqwest::StatusCode::BAD_GATEWAY),
                &err.message,
                retry_after,
            ));
        }

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;

        if choice.message.reasoning_details.is_some() {
            tracing::debug!(
                "Received {} reasoning blocks from model",
                choice.message.reasoning_details.as_ref().map_or(0, |r| r.len())
            );
        }

        Ok(ChatResponse {
            id: parsed.id,
            content: choice.message.content,
            tool_calls: choice.message.tool_calls,
            finish_reason: FinishReason::parse(choice.finish_reason.as_deref()),
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            model: parsed.model.or_else(|| Some(request.model.clone())),
            reasoning: choice.message.reasoning_details,
        })
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        options: ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let request = OpenRouterRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            tools: tools.map(|t| t.to_vec()),
            tool_choice: tools.map(|_| "auto".to_string()),
            response_format: options.response_format,
        };

        tracing::debug!(
            "Sending request to OpenRouter: model={}, messages={}, tools={}",
            model,
            messages.len(),
            tools.map_or(0, |t| t.len())
        );

        self.execute_request(&request).await
    }

    async fn generation_usage(&self, response_id: &str) -> Result<Option<GenerationUsage>, LlmError> {
        if !self.usage_lookup_delay.is_zero() {
            tokio::time::sleep(self.usage_lookup_delay).await;
        }

        let response = self
            .client
            .get(format!("{}/generation", self.base_url))
            .query(&[("id", response_id)])
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(USAGE_TIMEOUT)
            .send()
            .await
            .map_err(Self::network_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Self::create_error(status, &body, retry_after));
        }

        let parsed: GenerationResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse generation stats: {}", e))
        })?;

        Ok(parsed.data.map(|d| GenerationUsage {
            prompt_tokens: d.native_tokens_prompt,
            completion_tokens: d.native_tokens_completion,
            cost_usd: d.total_cost,
        }))
    }
}

/// OpenRouter API request format.
#[derive(Debug, Serialize)]
struct OpenRouterRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

/// OpenRouter API response format.
#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<OpenRouterChoice>,
    #[serde(default)]
    usage: Option<OpenRouterUsage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    error: Option<OpenRouterError>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterError {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
    #[serde(default)]
    reasoning_details: Option<Vec<ReasoningContent>>,
}

/// Usage data (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct OpenRouterUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// `GET /generation?id=` response.
#[derive(Debug, Deserialize)]
struct GenerationResponse {
    #[serde(default)]
    data: Option<GenerationData>,
}

#[derive(Debug, Deserialize)]
struct GenerationData {
    #[serde(default)]
    native_tokens_prompt: Option<u64>,
    #[serde(default)]
    native_tokens_completion: Option<u64>,
    #[serde(default)]
    total_cost: Option<f64>,
}
