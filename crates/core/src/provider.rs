//! Provider trait: the abstraction over LLM backends.
//!
//! A Provider knows how to send a conversation to an LLM and get a response
//! back, either as a complete [`Message`] or as a stream of [`StreamChunk`]s.
//!
//! Streaming never fails past the provider boundary: transport problems are
//! delivered in-band as [`StreamChunk::Error`] so the agent can hand them to
//! the model like any other tool failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::message::{
    InvocationOutcome, Message, ToolCallMessage, ToolCallResultMessage, ToolInvocation, Usage,
};
use crate::tool::ToolSchema;

/// Name of the pseudo-tool under which transport failures are recorded.
pub const TRANSPORT_TOOL_NAME: &str = "stream_transport";

/// Everything a provider needs for one completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "gpt-4o")
    pub model: String,

    /// System prompt, sent ahead of the conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSchema>,

    /// The full conversation history
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

/// A synthesized tool call and its failed result, standing in for a
/// transport error so the history stays a valid call/result sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExchange {
    pub call: ToolCallMessage,
    pub result: ToolCallResultMessage,
}

impl ToolExchange {
    /// Record a transport failure as a failed `stream_transport` invocation.
    pub fn transport_failure(error: impl Into<String>) -> Self {
        let error = error.into();
        let call_id = format!("call_{}", Uuid::new_v4().simple());
        let invocation = ToolInvocation::new(TRANSPORT_TOOL_NAME, Map::new()).with_call_id(call_id);
        let diagnostic = format!(
            "The connection to the model failed while streaming the previous response: {error}. \
             Continue from where the response was interrupted."
        );
        Self {
            call: ToolCallMessage::new(vec![invocation.clone()]),
            result: ToolCallResultMessage::new(vec![invocation.with_outcome(
                InvocationOutcome::Failed { error, diagnostic },
            )]),
        }
    }

    pub fn into_messages(self) -> [Message; 2] {
        [Message::ToolCall(self.call), Message::ToolCallResult(self.result)]
    }
}

/// A single unit of streamed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Partial content delta
    Content { text: String },

    /// A fully assembled tool request
    ToolCalls { message: ToolCallMessage },

    /// Token usage, typically at the end of the stream
    Usage { usage: Usage },

    /// A transport failure. When `exchange` is present it is fed back to the
    /// model; without it the failure is fatal.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exchange: Option<ToolExchange>,
    },
}

impl StreamChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content { text: text.into() }
    }

    /// A recoverable transport error carrying its synthetic tool exchange.
    pub fn transport_error(error: impl std::fmt::Display) -> Self {
        let message = error.to_string();
        Self::Error {
            exchange: Some(ToolExchange::transport_failure(message.clone())),
            message,
        }
    }
}

/// The core Provider trait.
///
/// Every LLM backend implements this trait. The agent calls `request()` or
/// `stream()` without knowing which provider is being used.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai", "ollama").
    fn name(&self) -> &str;

    /// Send a request and get the complete reply: either an
    /// `AssistantMessage` or a `ToolCallMessage`.
    async fn request(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<Message, ProviderError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// Default implementation calls `request()` and replays the reply as
    /// chunks; a failed request becomes a transport-error chunk.
    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(4);
        let chunks = match self.request(request, cancel).await {
            Ok(Message::ToolCall(message)) => {
                let usage = message.usage;
                let mut chunks = vec![StreamChunk::ToolCalls { message }];
                chunks.extend(usage.map(|usage| StreamChunk::Usage { usage }));
                chunks
            }
            Ok(reply) => {
                let mut chunks = vec![StreamChunk::content(reply.content())];
                chunks.extend(reply.usage().map(|usage| StreamChunk::Usage { usage }));
                chunks
            }
            Err(ProviderError::Cancelled) => vec![],
            Err(e) => vec![StreamChunk::transport_error(e)],
        };
        for chunk in chunks {
            let _ = tx.send(chunk).await;
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider(Result<Message, ProviderError>);

    #[async_trait]
    impl Provider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn request(
            &self,
            _request: ProviderRequest,
            _cancel: &CancellationToken,
        ) -> Result<Message, ProviderError> {
            self.0.clone()
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "test".into(),
            system_prompt: None,
            tools: vec![],
            messages: vec![Message::user("hi")],
            temperature: default_temperature(),
            max_tokens: None,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn default_stream_replays_text_and_usage() {
        let reply = Message::Assistant(
            crate::message::AssistantMessage::new("hello").with_usage(Some(Usage::new(3, 1))),
        );
        let provider = FixedProvider(Ok(reply));
        let chunks = drain(provider.stream(request(), &CancellationToken::new()).await).await;
        assert_eq!(
            chunks,
            vec![
                StreamChunk::content("hello"),
                StreamChunk::Usage {
                    usage: Usage::new(3, 1)
                },
            ]
        );
    }

    #[tokio::test]
    async fn default_stream_converts_failure_to_error_chunk() {
        let provider = FixedProvider(Err(ProviderError::Network("refused".into())));
        let chunks = drain(provider.stream(request(), &CancellationToken::new()).await).await;
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            StreamChunk::Error {
                message,
                exchange: Some(exchange),
            } => {
                assert!(message.contains("refused"));
                assert!(exchange.result.pairs_with(&exchange.call));
            }
            other => panic!("expected error chunk, got {other:?}"),
        }
    }

    #[test]
    fn transport_exchange_is_a_resolved_pair() {
        let exchange = ToolExchange::transport_failure("reset by peer");
        let [call, result] = exchange.into_messages();
        assert!(call.validate().is_ok());
        assert!(result.validate().is_ok());
        match result {
            Message::ToolCallResult(r) => {
                let outcome = r.invocations[0].outcome.as_ref().unwrap();
                assert!(outcome.to_text().contains("reset by peer"));
                assert_eq!(r.invocations[0].tool_name, TRANSPORT_TOOL_NAME);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
