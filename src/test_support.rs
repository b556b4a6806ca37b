//! Scripted stand-ins for the network so tests never leave the process.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::llm::{
    ChatMessage, ChatOptions, ChatResponse, FinishReason, GenerationUsage, LlmClient, LlmError,
    TokenUsage, ToolCall, ToolDefinition,
};
use crate::tools::{FetchError, Page, PageSource, SearchBackend, SearchError, SearchHit};

pub const VALID_VERDICT: &str = r#"{"verdict": "verified-high", "rationale": "Confirmed by the cited page.", "sources": [{"url": "https://example.org/a", "supports_claim": true, "provenance": "verified"}]}"#;

/// One scripted backend reply.
#[derive(Debug, Clone)]
pub enum Step {
    Reply {
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
        finish_reason: FinishReason,
    },
    Fail(LlmError),
}

impl Step {
    pub fn stop(content: &str) -> Self {
        Step::Reply {
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn truncated(content: &str) -> Self {
        Step::Reply {
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Length,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Step::Reply {
            content: None,
            tool_calls: calls,
            finish_reason: FinishReason::ToolCalls,
        }
    }

    pub fn search(id: &str, query: &str) -> Self {
        Self::tool_calls(vec![ToolCall::function(
            id,
            "web_search",
            serde_json::json!({ "query": query }).to_string(),
        )])
    }
}

/// What the backend saw on one call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub tools_offered: bool,
    pub forced_format: bool,
    pub messages: Vec<ChatMessage>,
}

/// Backend that replays per-model scripts.
///
/// When a model's script runs out it investigates nothing and returns a
/// valid verdict, so batch tests need no scripting at all.
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<RecordedCall>>,
    usage_available: bool,
    usage_lookups: AtomicUsize,
    next_id: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            delays: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            usage_available: true,
            usage_lookups: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn script(self, model: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(model.to_string(), steps.into());
        self
    }

    /// Every call for `model` sleeps this long first.
    pub fn slow(mut self, model: &str, delay: Duration) -> Self {
        self.delays.insert(model.to_string(), delay);
        self
    }

    pub fn without_usage(mut self) -> Self {
        self.usage_available = false;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, model: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.model == model)
            .collect()
    }

    pub fn usage_lookups(&self) -> usize {
        self.usage_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedBackend {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        options: ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        self.calls.lock().unwrap().push(RecordedCall {
            model: model.to_string(),
            tools_offered: tools.is_some(),
            forced_format: options.response_format.is_some(),
            messages: messages.to_vec(),
        });

        if let Some(delay) = self.delays.get(model) {
            tokio::time::sleep(*delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(model)
            .and_then(|steps| steps.pop_front());
        let step = scripted.unwrap_or_else(|| {
            if tools.is_some() {
                Step::stop("Investigation complete.")
            } else {
                Step::stop(VALID_VERDICT)
            }
        });

        match step {
            Step::Fail(err) => Err(err),
            Step::Reply {
                content,
                tool_calls,
                finish_reason,
            } => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                Ok(ChatResponse {
                    id: Some(format!("gen-{}", n)),
                    content,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    finish_reason,
                    usage: Some(TokenUsage::new(100, 50)),
                    model: Some(model.to_string()),
                    reasoning: None,
                })
            }
        }
    }

    async fn generation_usage(
        &self,
        _response_id: &str,
    ) -> Result<Option<GenerationUsage>, LlmError> {
        self.usage_lookups.fetch_add(1, Ordering::SeqCst);
        if !self.usage_available {
            return Err(LlmError::network_error("usage endpoint down".to_string()));
        }
        Ok(Some(GenerationUsage {
            prompt_tokens: Some(110),
            completion_tokens: Some(55),
            cost_usd: Some(0.001),
        }))
    }
}

/// Search backend with a fixed answer.
pub struct ScriptedSearch {
    result: Result<Vec<SearchHit>, SearchError>,
}

impl ScriptedSearch {
    pub fn hits(hits: Vec<SearchHit>) -> Self {
        Self { result: Ok(hits) }
    }

    pub fn unavailable() -> Self {
        Self {
            result: Err(SearchError::Unreachable("connection refused".to_string())),
        }
    }
}

#[async_trait]
impl SearchBackend for ScriptedSearch {
    async fn search(&self, _query: &str) -> Result<Vec<SearchHit>, SearchError> {
        self.result.clone()
    }
}

/// Page source that records every request it receives.
pub struct RecordingPageSource {
    status: u16,
    body: String,
    requests: Mutex<Vec<String>>,
}

impl RecordingPageSource {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            body: body.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageSource for RecordingPageSource {
    async fn get(&self, url: &url::Url) -> Result<Page, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());
        Ok(Page {
            status: self.status,
            content_type: Some("text/html".to_string()),
            body: self.body.clone(),
        })
    }
}
