//! Append-only conversation for one (task, backend) pair.

use crate::llm::{ChatMessage, ChatResponse, ToolCall};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    #[error("tool result for '{0}' has no matching open tool call")]
    UnmatchedToolResult(String),
    #[error("{0} tool call(s) still awaiting results")]
    PendingToolCalls(usize),
}

/// Ordered turns of one pair's conversation.
///
/// Every tool result answers exactly one earlier tool call; user turns are
/// refused while any call is still unanswered.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    open_calls: Vec<String>,
    synthetic_ids: usize,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>, task_context: impl Into<String>) -> Self {
        Self {
            messages: vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(task_context),
            ],
            open_calls: Vec::new(),
            synthetic_ids: 0,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn has_open_calls(&self) -> bool {
        !self.open_calls.is_empty()
    }

    /// Append the backend's reply and return the tool calls it opened.
    ///
    /// Calls that arrive without an id (or with a repeated one) are given a
    /// fresh id so each result can be matched to its request.
    pub fn push_assistant(&mut self, response: &ChatResponse) -> Vec<ToolCall> {
        let mut calls: Vec<ToolCall> = response.requested_tool_calls().to_vec();
        for call in &mut calls {
            if call.id.trim().is_empty() || self.open_calls.contains(&call.id) {
                self.synthetic_ids += 1;
                call.id = format!("call_local_{}", self.synthetic_ids);
            }
            self.open_calls.push(call.id.clone());
        }

        self.messages.push(ChatMessage::assistant(
            response.content.clone(),
            Some(calls.clone()),
            response.reasoning.clone(),
        ));
        calls
    }

    /// Append the result for an open tool call.
    pub fn push_tool_result(
        &mut self,
        call_id: &str,
        content: impl Into<String>,
    ) -> Result<(), ConversationError> {
        let position = self
            .open_calls
            .iter()
            .position(|id| id == call_id)
            .ok_or_else(|| ConversationError::UnmatchedToolResult(call_id.to_string()))?;
        self.open_calls.remove(position);
        self.messages.push(ChatMessage::tool_result(call_id, content));
        Ok(())
    }

    /// Append a user instruction. All tool calls must be answered first.
    pub fn push_user(&mut self, content: impl Into<String>) -> Result<(), ConversationError> {
        if !self.open_calls.is_empty() {
            return Err(ConversationError::PendingToolCalls(self.open_calls.len()));
        }
        self.messages.push(ChatMessage::user(content));
        Ok(())
    }
}
