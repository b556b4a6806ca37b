//! Verification worker - runs the investigate-then-verdict protocol for a
//! single (task, backend) pair.
//!
//! # States
//! `Start -> Investigating -> VerdictPending -> {Done | Error}`. Timeouts are
//! imposed from outside by dropping the future returned from [`VerificationWorker::run`].
//!
//! Phase A offers the search and fetch tools and loops until the backend
//! stops calling them or the turn budget runs out. Phase B withdraws the
//! tools and forces output into the verdict schema. Phase A always finishes
//! before Phase B starts.

mod conversation;

pub use conversation::{Conversation, ConversationError};

use std::sync::Arc;

use crate::budget::{authoritative_usage, BackendDescriptor, Usage};
use crate::llm::{
    ChatMessage, ChatOptions, ChatResponse, FinishReason, LlmClient, LlmError, ResponseFormat,
    RetryConfig, TokenUsage, ToolDefinition,
};
use crate::results::{InvestigationExit, PARSE_FAILED};
use crate::task::Task;
use crate::tools::ToolExecutor;
use crate::verdict::{parse_partial_verdict, parse_verdict, verdict_schema, PartialVerdict};

/// Built-in investigation prompt, used when no prompt file is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a careful fact checker. You will be given a claim together with the \
material it came from. Investigate whether the claim is supported using the \
web_search and web_fetch tools. Prefer primary and independent sources, read \
the pages you cite, and note which sources you fetched yourself and which were \
only mentioned by other sources. When you have enough evidence, stop calling \
tools and summarise what you found.";

/// Knobs for one worker. Shared by every pair in a run.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Backend calls allowed in the investigation phase.
    pub max_turns: u32,
    pub retry: RetryConfig,
    /// Fraction of the context window at which a warning is logged.
    pub context_warning_ratio: f64,
    pub system_prompt: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_turns: 15,
            retry: RetryConfig::default(),
            context_warning_ratio: 0.8,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Protocol state of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Start,
    Investigating,
    VerdictPending,
    Done,
    Error,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Done | WorkerState::Error)
    }
}

/// Everything the worker learned about one pair.
#[derive(Debug, Clone)]
pub struct PairOutcome {
    pub state: WorkerState,
    pub verdict: Option<PartialVerdict>,
    pub finish_status: Option<InvestigationExit>,
    /// Backend calls made during the investigation phase.
    pub turns: u32,
    /// The verdict output was cut off; `verdict` holds whatever parsed.
    pub incomplete: bool,
    pub error: Option<String>,
    pub usage: Usage,
    pub reported_usage: TokenUsage,
}

/// Progress through one pair, threaded through both phases.
struct PairRun {
    state: WorkerState,
    response_ids: Vec<String>,
    reported: TokenUsage,
    context_window: u64,
    context_warned: bool,
    turns: u32,
    finish_status: Option<InvestigationExit>,
}

impl PairRun {
    fn new(backend: &BackendDescriptor) -> Self {
        Self {
            state: WorkerState::Start,
            response_ids: Vec::new(),
            reported: TokenUsage::default(),
            context_window: backend.context_window,
            context_warned: false,
            turns: 0,
            finish_status: None,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::trace!("Worker state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Account for one backend response.
    fn observe(&mut self, response: &ChatResponse, backend_id: &str, warning_ratio: f64) {
        if let Some(id) = &response.id {
            self.response_ids.push(id.clone());
        }
        if let Some(usage) = &response.usage {
            self.reported.add(usage);
        }

        let threshold = (self.context_window as f64 * warning_ratio) as u64;
        if !self.context_warned && self.context_window > 0 && self.reported.total_tokens > threshold {
            self.context_warned = true;
            tracing::warn!(
                "{} at {}/{} tokens ({:.0}% of context window)",
                backend_id,
                self.reported.total_tokens,
                self.context_window,
                100.0 * self.reported.total_tokens as f64 / self.context_window as f64
            );
        }
    }
}

/// Runs the two-phase protocol against one backend client.
pub struct VerificationWorker {
    client: Arc<dyn LlmClient>,
    tools: Arc<ToolExecutor>,
    tool_definitions: Vec<ToolDefinition>,
    config: WorkerConfig,
}

impl VerificationWorker {
    pub fn new(client: Arc<dyn LlmClient>, tools: Arc<ToolExecutor>, config: WorkerConfig) -> Self {
        Self {
            client,
            tools,
            tool_definitions: ToolExecutor::definitions(),
            config,
        }
    }

    /// Run one pair to a terminal state. Never fails: every problem ends up
    /// in the returned outcome.
    pub async fn run(&self, task: &Task, backend: &BackendDescriptor) -> PairOutcome {
        let mut run = PairRun::new(backend);
        let mut convo = Conversation::new(&self.config.system_prompt, task.render_context());

        let (verdict, incomplete, error) = match self.investigate(&mut run, &mut convo, backend).await {
            Ok(()) => self.request_verdict(&mut run, &mut convo, backend).await,
            Err(err) => (None, false, Some(err)),
        };

        let state = if error.is_some() {
            WorkerState::Error
        } else {
            WorkerState::Done
        };
        run.transition(state);
        debug_assert!(run.state.is_terminal());

        // One accounting pass per pair, once it has reached a terminal state.
        let usage = authoritative_usage(self.client.as_ref(), &run.response_ids).await;

        match &error {
            Some(err) => tracing::error!("{} x {} failed: {}", task.id, backend.id, err),
            None => tracing::info!(
                "{} x {} -> {} in {} turns{}",
                task.id,
                backend.id,
                verdict
                    .as_ref()
                    .and_then(|v| v.verdict)
                    .map(|l| l.as_str())
                    .unwrap_or("no verdict"),
                run.turns,
                if incomplete { " (incomplete)" } else { "" }
            ),
        }

        PairOutcome {
            state: run.state,
            verdict,
            finish_status: run.finish_status,
            turns: run.turns,
            incomplete,
            error,
            usage,
            reported_usage: run.reported,
        }
    }

    /// Phase A. Returns an error message if the backend could not be reached.
    async fn investigate(
        &self,
        run: &mut PairRun,
        convo: &mut Conversation,
        backend: &BackendDescriptor,
    ) -> Result<(), String> {
        run.transition(WorkerState::Investigating);

        let exit = loop {
            if run.turns >= self.config.max_turns {
                tracing::warn!(
                    "{} hit max turns ({}) without completing investigation",
                    backend.id,
                    self.config.max_turns
                );
                break InvestigationExit::MaxTurns;
            }

            let response = self
                .call_backend(
                    &backend.id,
                    convo.messages(),
                    Some(&self.tool_definitions),
                    ChatOptions::default(),
                )
                .await
                .map_err(|e| format!("backend_error: {}", e))?;
            run.turns += 1;
            run.observe(&response, &backend.id, self.config.context_warning_ratio);

            let calls = convo.push_assistant(&response);
            if calls.is_empty() {
                break match &response.finish_reason {
                    FinishReason::Length => {
                        tracing::warn!("{} hit its output limit during investigation", backend.id);
                        InvestigationExit::Length
                    }
                    FinishReason::Stop | FinishReason::ToolCalls => InvestigationExit::Stop,
                    FinishReason::Other(reason) => {
                        tracing::warn!("Unexpected finish reason '{}' from {}", reason, backend.id);
                        InvestigationExit::Stop
                    }
                };
            }

            for call in calls {
                tracing::debug!("{} calls {}({})", backend.id, call.function.name, call.function.arguments);
                let outcome = self.tools.dispatch(&call.function).await;
                if outcome.is_error() {
                    tracing::debug!("{} tool call {} failed: {}", backend.id, call.function.name, outcome.render());
                }
                convo
                    .push_tool_result(&call.id, outcome.render())
                    .map_err(|e| format!("conversation_error: {}", e))?;
            }
        };

        run.finish_status = Some(exit);
        Ok(())
    }

    /// Phase B. Returns the verdict, the truncation flag and any error.
    async fn request_verdict(
        &self,
        run: &mut PairRun,
        convo: &mut Conversation,
        backend: &BackendDescriptor,
    ) -> (Option<PartialVerdict>, bool, Option<String>) {
        run.transition(WorkerState::VerdictPending);

        let schema = verdict_schema();
        if let Err(e) = convo.push_user(verdict_request(&schema)) {
            return (None, false, Some(format!("conversation_error: {}", e)));
        }

        let options = ChatOptions {
            response_format: Some(ResponseFormat::json_schema("verdict", schema)),
        };
        let response = match self
            .call_backend(&backend.id, convo.messages(), None, options)
            .await
        {
            Ok(response) => response,
            Err(e) => return (None, false, Some(format!("backend_error: {}", e))),
        };
        run.observe(&response, &backend.id, self.config.context_warning_ratio);

        let raw = response.content.as_deref().unwrap_or_default();
        if response.finish_reason == FinishReason::Length {
            tracing::warn!("{} verdict output was truncated", backend.id);
            return (parse_partial_verdict(raw), true, None);
        }

        match parse_verdict(raw) {
            Ok(verdict) => (Some(verdict.into()), false, None),
            Err(e) => {
                let preview: String = raw.chars().take(200).collect();
                tracing::warn!("{} returned an invalid verdict ({}): {}", backend.id, e, preview);
                (None, false, Some(PARSE_FAILED.to_string()))
            }
        }
    }

    /// One logical backend call, retrying transient failures with backoff.
    async fn call_backend(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        options: ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let retry = &self.config.retry;
        let mut retries = 0;
        loop {
            tracing::debug!("Requesting {} with {} messages", model, messages.len());
            match self
                .client
                .chat_completion(model, messages, tools, options.clone())
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) if retry.should_retry(&err, retries) => {
                    let delay = retry.next_delay(&err, retries);
                    tracing::warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        model,
                        err,
                        retries + 1,
                        retry.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// The instruction turn that opens the verdict phase.
fn verdict_request(schema: &serde_json::Value) -> String {
    let pretty = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "Based on your investigation, please provide your final verdict as JSON. \
         Use this exact schema:\n\n{}\n\nRespond with only valid JSON matching the schema.",
        pretty
    )
}
