//! Agent-level streaming events.
//!
//! `AgentStreamEvent` wraps provider-level stream chunks into higher-level
//! events a host can forward to its own clients (terminal, SSE, WebSocket).

use serde::{Deserialize, Serialize};
use switchyard_core::message::{AssistantMessage, ToolCallMessage, ToolCallResultMessage};

/// Events emitted by the agent during a streaming turn.
///
/// - `chunk`: partial text from the model, in arrival order
/// - `tool_calls`: the model asked for tools; they are about to run
/// - `tool_results`: those tools finished (successfully or not)
/// - `done`: the final assistant message, with the turn's usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    /// Partial text token from the LLM.
    Chunk { content: String },

    /// The tool request, forwarded as received.
    ToolCalls { message: ToolCallMessage },

    /// The outcome of every invocation of the preceding `ToolCalls`.
    ToolResults { message: ToolCallResultMessage },

    /// The stream is complete.
    Done { message: AssistantMessage },
}

impl AgentStreamEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::ToolCalls { .. } => "tool_calls",
            Self::ToolResults { .. } => "tool_results",
            Self::Done { .. } => "done",
        }
    }
}
