//! Shared data structures modeling conversations, generation requests, and responses.
//!
//! These types normalize provider-specific payloads so the rest of the crate can stay
//! agnostic of individual API differences.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, LLMError};

/// Author of a conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Normalized chat message shared across providers.
///
/// Each message bundles a [`Role`], optional name, optional tool-call correlation id,
/// and an ordered sequence of [`ContentPart`] entries so text and tool directives can
/// be mixed in one turn. Providers only ever see messages through shared references.
///
/// # Examples
///
/// ```
/// # use llm_switchboard::types::{Message, Role};
/// let msg = Message::user("Describe Rust traits").with_name("alice");
/// assert_eq!(msg.role, Role::User);
/// assert_eq!(msg.text(), "Describe Rust traits");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role associated with this message.
    pub role: Role,
    /// Content parts provided in order.
    #[serde(default)]
    pub content: Vec<ContentPart>,
    /// Optional participant name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool call this message answers, for [`Role::Tool`] turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Builds a single-text-part message.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::text(text)],
            name: None,
            tool_call_id: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Tool-result turn correlated with the call that produced it.
    pub fn tool(call_id: impl Into<String>, output: Value) -> Self {
        let call_id = call_id.into();
        Self {
            role: Role::Tool,
            content: vec![ContentPart::ToolResult(ToolResult {
                call_id: call_id.clone(),
                output,
                is_error: false,
            })],
            name: None,
            tool_call_id: Some(call_id),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Concatenation of every text part, in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Tool invocations referenced by this message.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolCall(call) => Some(call),
            _ => None,
        })
    }
}

/// One segment of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain UTF-8 text.
    Text { text: String },
    /// Tool invocation emitted by the assistant.
    ToolCall(ToolCall),
    /// Tool execution result authored by the tool role.
    ToolResult(ToolResult),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Declarative definition of a tool available to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique name exposed to the model.
    pub name: String,
    /// Natural-language description of the tool purpose.
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema describing the input payload.
    #[serde(default)]
    pub input_schema: Option<Value>,
}

/// Tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-supplied invocation identifier.
    pub id: String,
    pub name: String,
    /// Structured arguments serialized as JSON.
    pub arguments: Value,
}

/// Result returned by a tool execution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub output: Value,
    #[serde(default)]
    pub is_error: bool,
}

/// Tool-choice strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Provider decides when to call tools.
    Auto,
    /// Provider must invoke at least one tool.
    Required,
    /// Tools are disabled for the request.
    None,
    /// Force a specific tool by name.
    Tool { name: String },
}

/// Tunable generation parameters.
///
/// Every field is optional so callers only set knobs they care about. Providers
/// ignore what they do not support.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Sampling temperature, typically within `0.0..=2.0`.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter where `1.0` disables the filter.
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Maximum number of output tokens.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sequences that end generation when produced.
    #[serde(default)]
    pub stop: Vec<String>,
    /// Opaque hints forwarded to the provider; the core never reads them.
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

/// Generation request shared across all providers.
///
/// # Examples
///
/// ```
/// # use llm_switchboard::types::{GenerateRequest, GenerationOptions, Message};
/// let request = GenerateRequest::new("m1", vec![
///     Message::system("You are concise."),
///     Message::user("Summarize Rust traits."),
/// ])
/// .with_options(GenerationOptions { temperature: Some(0.3), ..Default::default() });
/// assert!(request.validate().is_ok());
/// assert_eq!(request.messages.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Model identifier understood by the bound provider.
    pub model: String,
    /// Ordered conversation; must not be empty.
    pub messages: Vec<Message>,
    #[serde(default)]
    pub options: GenerationOptions,
    /// Tool definitions available to the model.
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
    /// Whether the caller intends to consume the reply incrementally.
    #[serde(default)]
    pub stream: bool,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            options: GenerationOptions::default(),
            tools: Vec::new(),
            tool_choice: None,
            stream: false,
        }
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Checks the structural invariants every provider relies on.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::InvalidRequest`] error when the model identifier is
    /// blank, the conversation is empty, or a forced tool is not declared.
    pub fn validate(&self) -> Result<(), LLMError> {
        if self.model.trim().is_empty() {
            return Err(LLMError::invalid_request("model identifier must not be empty"));
        }
        if self.messages.is_empty() {
            return Err(LLMError::invalid_request("messages must not be empty"));
        }
        if let Some(ToolChoice::Tool { name }) = &self.tool_choice {
            if !self.tools.iter().any(|tool| &tool.name == name) {
                return Err(LLMError::invalid_request(format!(
                    "tool_choice references undeclared tool: {name}"
                )));
            }
        }
        if let Some(temperature) = self.options.temperature {
            if !temperature.is_finite() || temperature < 0.0 {
                return Err(LLMError::new(
                    ErrorKind::InvalidRequest,
                    format!("temperature must be a non-negative number, got {temperature}"),
                ));
            }
        }
        Ok(())
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCall,
    ContentFilter,
    Error,
}

/// Token accounting. Counts are zero when the provider does not report them.
///
/// # Examples
///
/// ```
/// # use llm_switchboard::types::Usage;
/// let mut usage = Usage::new(10, 2);
/// usage.accumulate(&Usage::new(0, 3));
/// assert_eq!(usage, Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 });
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Adds another usage report onto this one.
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

/// One alternative produced by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: Message,
}

/// Complete response to a [`GenerateRequest`].
///
/// # Examples
///
/// ```
/// # use llm_switchboard::types::{FinishReason, GenerateResponse, Message, Usage};
/// let response = GenerateResponse::new(Message::assistant("Hello"), FinishReason::Stop)
///     .with_usage(Usage::new(1, 1));
/// assert_eq!(response.text(), "Hello");
/// assert_eq!(response.usage.total_tokens, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// At least one generated alternative.
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
    pub finish_reason: FinishReason,
    /// Tool invocations requested by the model.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Effective model identifier reported by the provider.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: ProviderMetadata,
}

impl GenerateResponse {
    /// Single-choice response with empty usage.
    pub fn new(message: Message, finish_reason: FinishReason) -> Self {
        let tool_calls = message.tool_calls().cloned().collect();
        Self {
            choices: vec![Choice { index: 0, message }],
            usage: Usage::default(),
            finish_reason,
            tool_calls,
            model: None,
            provider: ProviderMetadata::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// The first choice's message, when any.
    pub fn message(&self) -> Option<&Message> {
        self.choices.first().map(|choice| &choice.message)
    }

    /// Text of the first choice, or an empty string.
    pub fn text(&self) -> String {
        self.message().map(Message::text).unwrap_or_default()
    }
}

/// Metadata about the provider invocation, for correlating logs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Provider identifier.
    pub provider: String,
    /// Upstream request identifier.
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Incremental tool-call fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Position of the call within the response; fragments sharing it belong together.
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Raw JSON text appended to the arguments so far.
    #[serde(default)]
    pub arguments_fragment: String,
}

/// Payload of a single [`StreamChunk`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkDelta {
    /// Text appended to the message.
    Text { text: String },
    /// Fragment of a tool call.
    ToolCall(ToolCallDelta),
    /// No payload, typical for error chunks.
    #[default]
    Empty,
}

impl ChunkDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// One element of a streamed generation.
///
/// Sequences start at index 0, increase by one per chunk, and end with exactly one
/// chunk whose `is_final` is set. Only that final chunk carries a finish reason,
/// the accumulated usage, and, when the stream failed, the error.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub index: u64,
    pub delta: ChunkDelta,
    pub is_final: bool,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
    pub error: Option<LLMError>,
}

impl StreamChunk {
    /// Intermediate chunk carrying a delta.
    pub fn delta(index: u64, delta: ChunkDelta) -> Self {
        Self {
            index,
            delta,
            is_final: false,
            finish_reason: None,
            usage: None,
            error: None,
        }
    }

    /// Successful terminal chunk.
    pub fn finished(index: u64, delta: ChunkDelta, reason: FinishReason, usage: Usage) -> Self {
        Self {
            index,
            delta,
            is_final: true,
            finish_reason: Some(reason),
            usage: Some(usage),
            error: None,
        }
    }

    /// Failed terminal chunk.
    pub fn failed(index: u64, error: LLMError, usage: Usage) -> Self {
        Self {
            index,
            delta: ChunkDelta::Empty,
            is_final: true,
            finish_reason: Some(FinishReason::Error),
            usage: Some(usage),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Capability descriptor used to reject requests a provider cannot serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub supports_stream: bool,
    pub supports_tools: bool,
}

impl Default for CapabilityDescriptor {
    fn default() -> Self {
        Self {
            supports_stream: true,
            supports_tools: true,
        }
    }
}
