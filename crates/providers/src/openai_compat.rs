//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, Fireworks AI,
//! and any endpoint exposing `/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool use / function calling
//! - Cancellation and timeouts on both paths

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use switchyard_config::ProviderConfig;
use switchyard_core::error::ProviderError;
use switchyard_core::message::{
    AssistantMessage, Message, ToolCallMessage, ToolInvocation, Usage,
};
use switchyard_core::provider::{Provider, ProviderRequest, StreamChunk};
use switchyard_core::tool::ToolSchema;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sse;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// An OpenAI-compatible LLM provider.
///
/// This handles the vast majority of LLM providers since most expose
/// an OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        // Per-request timeouts are applied around each call instead of on the
        // client, so a long stream is not cut off by a whole-request deadline.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
        }
    }

    /// Create an OpenRouter provider (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        // Ollama doesn't need a key
        Self::new("ollama", base_url.unwrap_or("http://localhost:11434/v1"), "")
    }

    /// Build a provider from the `[provider]` config section.
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(
            config.name.clone(),
            config.base_url.clone(),
            config.api_key.clone().unwrap_or_default(),
        )
        .with_timeouts(
            Duration::from_secs(config.request_timeout_secs),
            Duration::from_secs(config.stream_idle_timeout_secs),
        )
    }

    /// `request` bounds a whole non-streaming call and the wait for a
    /// stream's response headers; `stream_idle` bounds the gap between reads.
    pub fn with_timeouts(mut self, request: Duration, stream_idle: Duration) -> Self {
        self.request_timeout = request;
        self.stream_idle_timeout = stream_idle;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert the conversation to OpenAI wire messages.
    fn format_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<ApiMessage> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(prompt) = system_prompt {
            out.push(ApiMessage::text("system", prompt));
        }

        for message in messages {
            match message {
                Message::User(m) => out.push(ApiMessage::text("user", &m.content)),
                Message::Assistant(m) => out.push(ApiMessage::text("assistant", &m.content)),
                Message::ToolCall(m) => {
                    let tool_calls = m
                        .invocations
                        .iter()
                        .map(|inv| ApiToolCall {
                            id: inv.call_id.clone().unwrap_or_else(synthesize_call_id),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: inv.tool_name.clone(),
                                arguments: serde_json::Value::Object(inv.inputs.clone())
                                    .to_string(),
                            },
                        })
                        .collect();
                    out.push(ApiMessage {
                        role: "assistant".into(),
                        content: None,
                        tool_calls: Some(tool_calls),
                        tool_call_id: None,
                    });
                }
                Message::ToolCallResult(m) => {
                    for inv in &m.invocations {
                        let Some(call_id) = &inv.call_id else {
                            warn!(
                                tool = %inv.tool_name,
                                "Dropping tool result without a call id from the request"
                            );
                            continue;
                        };
                        out.push(ApiMessage {
                            role: "tool".into(),
                            content: Some(inv.result_text().unwrap_or_default()),
                            tool_calls: None,
                            tool_call_id: Some(call_id.clone()),
                        });
                    }
                }
            }
        }
        out
    }

    /// Convert tool schemas to OpenAI API format.
    fn format_tools(tools: &[ToolSchema]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn build_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::format_messages(request.system_prompt.as_deref(), &request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::format_tools(&request.tools));
        }

        body
    }

    /// POST the body and map non-success statuses to typed errors.
    async fn send(
        &self,
        body: &serde_json::Value,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body);
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder.send().await.map_err(|e| self.map_transport(e))?;
        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if !response.status().is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, status, body = %error_body, "Provider returned error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        Ok(response)
    }

    fn map_transport(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.request_timeout.as_secs())
        } else {
            ProviderError::Network(e.to_string())
        }
    }

    async fn complete(&self, body: serde_json::Value) -> Result<Message, ProviderError> {
        let response = self.send(&body, false).await?;
        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {e}")))?;
        parse_response(api_response)
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn request(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<Message, ProviderError> {
        let body = Self::build_body(&request, false);
        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = tokio::time::timeout(self.request_timeout, self.complete(body)) => {
                result.map_err(|_| ProviderError::Timeout(self.request_timeout.as_secs()))?
            }
        }
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let body = Self::build_body(&request, true);
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return rx,
            sent = tokio::time::timeout(self.request_timeout, self.send(&body, true)) => {
                sent.unwrap_or(Err(ProviderError::Timeout(self.request_timeout.as_secs())))
            }
        };

        match sent {
            Ok(response) => {
                let bytes = Box::pin(response.bytes_stream());
                tokio::spawn(sse::pump(
                    bytes,
                    tx,
                    cancel.clone(),
                    self.stream_idle_timeout,
                ));
            }
            // The model cannot fix credentials, so don't hand this back to it
            Err(e @ ProviderError::AuthenticationFailed(_)) => {
                let _ = tx.try_send(StreamChunk::Error {
                    message: e.to_string(),
                    exchange: None,
                });
            }
            Err(e) => {
                warn!(provider = %self.name, error = %e, "Streaming request failed");
                let _ = tx.try_send(StreamChunk::transport_error(e));
            }
        }
        rx
    }
}

/// Parse a function-call argument string. Empty means no arguments.
pub(crate) fn parse_arguments(
    tool_name: &str,
    raw: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, ProviderError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Map::new());
    }
    match serde_json::from_str(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(ProviderError::InvalidResponse(format!(
            "arguments for {tool_name} are not an object: {other}"
        ))),
        Err(e) => Err(ProviderError::InvalidResponse(format!(
            "arguments for {tool_name} are not valid JSON: {e}"
        ))),
    }
}

/// Fallback id for a tool call the provider did not label.
fn synthesize_call_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{millis}_{}", &random[..8])
}

fn parse_response(api_response: ApiResponse) -> Result<Message, ProviderError> {
    let usage = api_response
        .usage
        .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens));

    let choice = api_response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".into()))?;

    let tool_calls = choice.message.tool_calls.unwrap_or_default();
    if !tool_calls.is_empty() {
        let invocations = tool_calls
            .into_iter()
            .map(|tc| {
                let inputs = parse_arguments(&tc.function.name, &tc.function.arguments)?;
                let invocation = ToolInvocation::new(tc.function.name, inputs);
                Ok(if tc.id.is_empty() {
                    invocation
                } else {
                    invocation.with_call_id(tc.id)
                })
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;
        let mut message = ToolCallMessage::new(invocations);
        message.usage = usage;
        return Ok(Message::ToolCall(message));
    }

    Ok(Message::Assistant(
        AssistantMessage::new(choice.message.content.unwrap_or_default()).with_usage(usage),
    ))
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: ApiFunction,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}
