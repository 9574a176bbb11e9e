//! Message domain types.
//!
//! A conversation is a sequence of [`Message`] values. The set of message
//! kinds is closed: every place that branches on the kind of a message does
//! so with an exhaustive `match`.
//!
//! User sends a [`UserMessage`] → the provider answers with either an
//! [`AssistantMessage`] or a [`ToolCallMessage`] → the agent executes the
//! tools and records a [`ToolCallResultMessage`] → the provider is asked again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a conversation (session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The model (plain text or tool requests)
    Assistant,
    /// Tool execution results
    Tool,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Accumulate another usage report into this one.
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Text typed by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl UserMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Text produced by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl AssistantMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            timestamp: Utc::now(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }
}

/// The model asking for one or more tools to be run, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallMessage {
    pub id: String,
    pub invocations: Vec<ToolInvocation>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ToolCallMessage {
    pub fn new(invocations: Vec<ToolInvocation>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            invocations,
            timestamp: Utc::now(),
            usage: None,
        }
    }
}

/// The outcome of every invocation of a [`ToolCallMessage`], same order, same count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResultMessage {
    pub id: String,
    pub invocations: Vec<ToolInvocation>,
    pub timestamp: DateTime<Utc>,
}

impl ToolCallResultMessage {
    pub fn new(invocations: Vec<ToolInvocation>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            invocations,
            timestamp: Utc::now(),
        }
    }

    /// True when this result answers `call` invocation for invocation.
    pub fn pairs_with(&self, call: &ToolCallMessage) -> bool {
        self.invocations.len() == call.invocations.len()
            && self
                .invocations
                .iter()
                .zip(&call.invocations)
                .all(|(r, c)| r.tool_name == c.tool_name && r.call_id == c.call_id)
    }
}

/// One call of a tool: the inputs the model chose, the provider's call id and,
/// once executed, the outcome.
///
/// The tool itself is referenced by name only; its definition lives in the
/// registry and is never copied into the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,

    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<InvocationOutcome>,
}

impl ToolInvocation {
    pub fn new(
        tool_name: impl Into<String>,
        inputs: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            call_id: None,
            inputs,
            outcome: None,
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn with_outcome(mut self, outcome: InvocationOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    /// The text the model sees for this invocation.
    pub fn result_text(&self) -> Option<String> {
        self.outcome.as_ref().map(InvocationOutcome::to_text)
    }
}

/// What happened when an invocation ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// The capability returned a value.
    Success { result: serde_json::Value },

    /// The capability failed; `diagnostic` is what the model is shown.
    Failed { error: String, diagnostic: String },
}

impl InvocationOutcome {
    pub fn to_text(&self) -> String {
        match self {
            Self::Success {
                result: serde_json::Value::String(s),
            } => s.clone(),
            Self::Success { result } => result.to_string(),
            Self::Failed { diagnostic, .. } => diagnostic.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A single entry of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolCall(ToolCallMessage),
    ToolCallResult(ToolCallResultMessage),
}

impl Message {
    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::User(UserMessage::new(content))
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant(AssistantMessage::new(content))
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User(m) => &m.id,
            Self::Assistant(m) => &m.id,
            Self::ToolCall(m) => &m.id,
            Self::ToolCallResult(m) => &m.id,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::User(_) => Role::User,
            Self::Assistant(_) | Self::ToolCall(_) => Role::Assistant,
            Self::ToolCallResult(_) => Role::Tool,
        }
    }

    /// Text content. Tool envelopes carry no text of their own.
    pub fn content(&self) -> &str {
        match self {
            Self::User(m) => &m.content,
            Self::Assistant(m) => &m.content,
            Self::ToolCall(_) | Self::ToolCallResult(_) => "",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::User(m) => m.timestamp,
            Self::Assistant(m) => m.timestamp,
            Self::ToolCall(m) => m.timestamp,
            Self::ToolCallResult(m) => m.timestamp,
        }
    }

    pub fn usage(&self) -> Option<Usage> {
        match self {
            Self::Assistant(m) => m.usage,
            Self::ToolCall(m) => m.usage,
            Self::User(_) | Self::ToolCallResult(_) => None,
        }
    }

    /// Check structural invariants before the message enters a history.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::User(_) | Self::Assistant(_) => Ok(()),
            Self::ToolCall(m) if m.invocations.is_empty() => Err(Error::InvalidMessage(
                "tool call message has no invocations".into(),
            )),
            Self::ToolCall(_) => Ok(()),
            Self::ToolCallResult(m) => {
                if m.invocations.is_empty() {
                    return Err(Error::InvalidMessage(
                        "tool call result message has no invocations".into(),
                    ));
                }
                match m.invocations.iter().find(|inv| !inv.is_resolved()) {
                    Some(inv) => Err(Error::InvalidMessage(format!(
                        "invocation of '{}' has neither a result nor an error",
                        inv.tool_name
                    ))),
                    None => Ok(()),
                }
            }
        }
    }
}

impl From<UserMessage> for Message {
    fn from(m: UserMessage) -> Self {
        Self::User(m)
    }
}

impl From<AssistantMessage> for Message {
    fn from(m: AssistantMessage) -> Self {
        Self::Assistant(m)
    }
}

impl From<ToolCallMessage> for Message {
    fn from(m: ToolCallMessage) -> Self {
        Self::ToolCall(m)
    }
}

impl From<ToolCallResultMessage> for Message {
    fn from(m: ToolCallResultMessage) -> Self {
        Self::ToolCallResult(m)
    }
}

/// Whatever a caller hands to `chat()` / `stream()`, normalized to a sequence.
#[derive(Debug, Clone, Default)]
pub struct ChatInput(Vec<Message>);

impl ChatInput {
    /// Validate and unwrap the messages. An empty input is rejected.
    pub fn into_messages(self) -> Result<Vec<Message>> {
        if self.0.is_empty() {
            return Err(Error::InvalidMessage("no messages supplied".into()));
        }
        for message in &self.0 {
            message.validate()?;
        }
        Ok(self.0)
    }
}

impl From<Message> for ChatInput {
    fn from(m: Message) -> Self {
        Self(vec![m])
    }
}

impl From<Vec<Message>> for ChatInput {
    fn from(messages: Vec<Message>) -> Self {
        Self(messages)
    }
}

impl From<UserMessage> for ChatInput {
    fn from(m: UserMessage) -> Self {
        Self(vec![Message::User(m)])
    }
}

impl From<&str> for ChatInput {
    fn from(text: &str) -> Self {
        Self(vec![Message::user(text)])
    }
}

impl From<String> for ChatInput {
    fn from(text: String) -> Self {
        Self(vec![Message::user(text)])
    }
}
