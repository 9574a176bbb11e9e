//! The agent orchestrator.
//!
//! An [`Agent`] owns one conversation: its history, its tools, its observers
//! and the circuit breaker guarding the tool loop. A turn starts with
//! [`Agent::chat`] or [`Agent::stream`] and runs
//!
//! 1. **Save** the caller's messages to history
//! 2. **Send** the full history to the provider
//! 3. **If tool calls**: run them, save call + results, go back to step 2
//! 4. **If text**: save it and finish
//!
//! Turns are serialized: the conversation state sits behind one async mutex
//! held for the whole turn.

use std::sync::Arc;

use switchyard_config::AppConfig;
use switchyard_core::error::{Error, ProviderError, Result};
use switchyard_core::event::{AgentEvent, Observer, ObserverRegistry};
use switchyard_core::history::ChatHistory;
use switchyard_core::message::{
    AssistantMessage, ChatInput, ConversationId, Message, Role, ToolCallMessage, Usage,
};
use switchyard_core::provider::{Provider, ProviderRequest, StreamChunk, TRANSPORT_TOOL_NAME};
use switchyard_core::task::{InMemoryTaskTracker, TaskTracker};
use switchyard_core::tool::{ToolDefinition, ToolRegistry};
use switchyard_providers::OpenAiCompatProvider;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::{CircuitBreaker, Verdict};
use crate::executor::{ToolExecutor, bind_call_ids};
use crate::stream::AgentStream;
use crate::stream_event::AgentStreamEvent;

const DEFAULT_STREAM_BUFFER: usize = 64;

/// Per-conversation state mutated by a turn. The breaker is reset when a
/// turn starts, so failures never carry over from an earlier turn.
struct TurnState {
    history: ChatHistory,
    breaker: CircuitBreaker,
}

struct AgentInner {
    provider: Arc<dyn Provider>,
    model: String,
    system_prompt: Option<String>,
    temperature: f32,
    max_tokens: Option<u32>,
    tools: ToolRegistry,
    observers: ObserverRegistry,
    tracker: Option<Arc<dyn TaskTracker>>,
    conversation_id: ConversationId,
    stream_buffer: usize,
    state: Mutex<TurnState>,
}

/// The orchestrator. Cheap to clone; clones share the same conversation.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("provider", &self.inner.provider.name())
            .field("model", &self.inner.model)
            .field("conversation_id", &self.inner.conversation_id)
            .field("tools", &self.inner.tools.names())
            .field("observers", &self.inner.observers.len())
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.inner.conversation_id
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    /// A copy of the conversation so far.
    pub async fn history(&self) -> Vec<Message> {
        self.inner.state.lock().await.history.messages()
    }

    pub async fn last_message(&self) -> Option<Message> {
        self.inner.state.lock().await.history.last().cloned()
    }

    /// Forget the conversation and reset the circuit breaker.
    pub async fn clear_history(&self) {
        let mut state = self.inner.state.lock().await;
        state.history.clear();
        state.breaker.reset();
    }

    /// Swap in a previously saved conversation. Every message is validated first.
    pub async fn replace_history(&self, messages: Vec<Message>) -> Result<()> {
        for message in &messages {
            message.validate()?;
        }
        let mut state = self.inner.state.lock().await;
        state.history = ChatHistory::from_messages(messages);
        state.breaker.reset();
        Ok(())
    }

    /// Run one turn to completion and return the final assistant message.
    ///
    /// Fatal errors (provider failure, unknown tool, missing parameter,
    /// circuit breaker, cancellation) abort the turn; whatever was saved to
    /// history before the failure stays there.
    pub async fn chat(
        &self,
        input: impl Into<ChatInput>,
        cancel: &CancellationToken,
    ) -> Result<AssistantMessage> {
        let mut pending = input.into().into_messages()?;

        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.inner.state.lock() => guard,
        };
        let TurnState { history, breaker } = &mut *guard;
        breaker.reset();

        let inner = &self.inner;
        info!(conversation_id = %inner.conversation_id, messages = pending.len(), "Starting chat turn");
        inner.emit(AgentEvent::ChatStart {
            conversation_id: inner.conversation_id.to_string(),
            timestamp: chrono::Utc::now(),
        });

        let mut usage = Usage::default();
        let mut round = 0usize;
        loop {
            round += 1;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            inner.save_all(history, std::mem::take(&mut pending));

            debug!(conversation_id = %inner.conversation_id, round, "Requesting completion");
            let request = inner.build_request(history);
            let reply = inner
                .provider
                .request(request, cancel)
                .await
                .map_err(into_turn_error)?;
            inner.emit(AgentEvent::MessageSent {
                reply: Some(reply.clone()),
            });
            if let Some(delta) = reply.usage() {
                usage.add(delta);
            }

            let text = match reply {
                Message::ToolCall(mut call) => {
                    bind_call_ids(&mut call);
                    debug!(tool_count = call.invocations.len(), "Executing tool calls");
                    let result = inner.executor().run(&call, breaker, cancel).await?;
                    pending = vec![call.into(), result.into()];
                    continue;
                }
                Message::Assistant(message) => message,
                // Some backends echo the wrong role; treat it as the answer
                Message::User(message) => AssistantMessage::new(message.content),
                Message::ToolCallResult(_) => {
                    return Err(ProviderError::InvalidResponse(
                        "provider replied with a tool result".into(),
                    )
                    .into());
                }
            };
            let text = text.with_usage((!usage.is_empty()).then_some(usage));

            inner.save(history, Message::Assistant(text.clone()));
            inner.emit(AgentEvent::ChatStop {
                conversation_id: inner.conversation_id.to_string(),
                message: Message::Assistant(text.clone()),
            });
            info!(conversation_id = %inner.conversation_id, rounds = round, "Chat turn complete");
            return Ok(text);
        }
    }

    /// Run one turn in a background task, streaming events as they happen.
    ///
    /// The returned [`AgentStream`] yields `Chunk`s in arrival order, a
    /// `ToolCalls`/`ToolResults` pair per tool round, and finally `Done`. A
    /// fatal error is delivered as the last item. Dropping the stream cancels
    /// the turn.
    pub fn stream(&self, input: impl Into<ChatInput>, cancel: &CancellationToken) -> AgentStream {
        let (tx, rx) = mpsc::channel(self.inner.stream_buffer);
        let cancel = cancel.child_token();
        let agent = self.clone();
        let input = input.into();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            if let Err(e) = agent.run_stream(input, &tx, &task_cancel).await {
                debug!(error = %e, "Streaming turn ended with an error");
                let _ = tx.send(Err(e)).await;
            }
        });

        AgentStream::new(rx, cancel)
    }

    async fn run_stream(
        &self,
        input: ChatInput,
        tx: &mpsc::Sender<Result<AgentStreamEvent>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut pending = input.into_messages()?;

        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.inner.state.lock() => guard,
        };
        let TurnState { history, breaker } = &mut *guard;
        breaker.reset();

        let inner = &self.inner;
        info!(conversation_id = %inner.conversation_id, messages = pending.len(), "Starting streaming turn");
        inner.emit(AgentEvent::StreamStart {
            conversation_id: inner.conversation_id.to_string(),
        });

        let mut usage = Usage::default();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            inner.save_all(history, std::mem::take(&mut pending));

            let request = inner.build_request(history);
            let mut chunks = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                chunks = inner.provider.stream(request, cancel) => chunks,
            };

            let mut text = String::new();
            let mut tool_call: Option<ToolCallMessage> = None;
            let mut interrupted = None;

            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    chunk = chunks.recv() => chunk,
                };
                let Some(chunk) = chunk else { break };

                match chunk {
                    StreamChunk::Content { text: delta } => {
                        text.push_str(&delta);
                        send(tx, AgentStreamEvent::Chunk { content: delta }).await?;
                    }
                    StreamChunk::Usage { usage: delta } => usage.add(delta),
                    StreamChunk::ToolCalls { mut message } => {
                        bind_call_ids(&mut message);
                        send(
                            tx,
                            AgentStreamEvent::ToolCalls {
                                message: message.clone(),
                            },
                        )
                        .await?;
                        match &mut tool_call {
                            Some(call) => call.invocations.extend(message.invocations),
                            None => tool_call = Some(message),
                        }
                    }
                    StreamChunk::Error {
                        message,
                        exchange: Some(exchange),
                    } => {
                        warn!(error = %message, "Stream interrupted, handing the failure to the model");
                        interrupted = Some((message, exchange));
                        break;
                    }
                    StreamChunk::Error {
                        message,
                        exchange: None,
                    } => {
                        return Err(ProviderError::StreamInterrupted(message).into());
                    }
                }
            }

            inner.emit(AgentEvent::MessageSent {
                reply: tool_call.clone().map(Message::ToolCall),
            });

            if let Some((error, exchange)) = interrupted {
                if let Verdict::Tripped { consecutive_errors } =
                    breaker.record_failure(TRANSPORT_TOOL_NAME, &error)
                {
                    return Err(Error::CircuitBreakerTripped {
                        tool_name: TRANSPORT_TOOL_NAME.to_string(),
                        error,
                        consecutive_errors,
                    });
                }
                // Keep what the model already said so it can pick up from there
                if !text.is_empty() {
                    pending.push(Message::Assistant(AssistantMessage::new(text)));
                }
                pending.extend(exchange.into_messages());
                continue;
            }

            if let Some(call) = tool_call {
                debug!(tool_count = call.invocations.len(), "Executing streamed tool calls");
                let result = inner.executor().run(&call, breaker, cancel).await?;
                send(
                    tx,
                    AgentStreamEvent::ToolResults {
                        message: result.clone(),
                    },
                )
                .await?;
                pending = vec![call.into(), result.into()];
                continue;
            }

            let usage = (!usage.is_empty()).then_some(usage);
            let message = AssistantMessage::new(text).with_usage(usage);
            if history.last().map(Message::role) == Some(Role::Assistant) {
                debug!("Last history entry is already an assistant turn, not saving again");
            } else {
                inner.save(history, Message::Assistant(message.clone()));
            }
            inner.emit(AgentEvent::StreamStop {
                conversation_id: inner.conversation_id.to_string(),
                message: Some(Message::Assistant(message.clone())),
            });
            info!(conversation_id = %inner.conversation_id, "Streaming turn complete");
            send(tx, AgentStreamEvent::Done { message }).await?;
            return Ok(());
        }
    }
}

impl AgentInner {
    fn emit(&self, event: AgentEvent) {
        self.observers.dispatch(&event);
    }

    fn save(&self, history: &mut ChatHistory, message: Message) {
        self.emit(AgentEvent::MessageSaving {
            message: message.clone(),
        });
        history.append(message.clone());
        self.emit(AgentEvent::MessageSaved {
            message,
            history_len: history.len(),
        });
    }

    fn save_all(&self, history: &mut ChatHistory, messages: Vec<Message>) {
        for message in messages {
            self.save(history, message);
        }
    }

    fn build_request(&self, history: &ChatHistory) -> ProviderRequest {
        let tools = self.tools.schemas();
        self.emit(AgentEvent::MessageSending {
            history_len: history.len(),
            tool_count: tools.len(),
        });
        ProviderRequest {
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            tools,
            messages: history.messages(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    fn executor(&self) -> ToolExecutor<'_> {
        ToolExecutor {
            tools: &self.tools,
            observers: &self.observers,
            tracker: self.tracker.as_ref(),
            conversation_id: &self.conversation_id,
        }
    }
}

fn into_turn_error(e: ProviderError) -> Error {
    match e {
        ProviderError::Cancelled => Error::Cancelled,
        other => Error::Provider(other),
    }
}

/// Deliver an event; a closed channel means the reader went away.
async fn send(
    tx: &mpsc::Sender<Result<AgentStreamEvent>>,
    event: AgentStreamEvent,
) -> Result<()> {
    tx.send(Ok(event)).await.map_err(|_| Error::Cancelled)
}

/// Builder for [`Agent`]. Only the provider is mandatory.
pub struct AgentBuilder {
    provider: Option<Arc<dyn Provider>>,
    model: String,
    system_prompt: Option<String>,
    temperature: f32,
    max_tokens: Option<u32>,
    tools: ToolRegistry,
    observers: ObserverRegistry,
    tracker: Option<Arc<dyn TaskTracker>>,
    conversation_id: Option<ConversationId>,
    max_retries: u32,
    stream_buffer: usize,
    history: Vec<Message>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            provider: None,
            model: "gpt-4o-mini".into(),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: None,
            tools: ToolRegistry::new(),
            observers: ObserverRegistry::new(),
            tracker: None,
            conversation_id: None,
            max_retries: 1,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            history: Vec::new(),
        }
    }
}

impl AgentBuilder {
    /// Start from a loaded configuration: an OpenAI-compatible provider, the
    /// configured model settings, and an in-memory task tracker.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut tracker = InMemoryTaskTracker::new();
        if let Some(limit) = config.agent.task_result_max_chars {
            tracker = tracker.with_max_result_chars(limit);
        }

        let mut builder = Self::default()
            .provider(Arc::new(OpenAiCompatProvider::from_config(&config.provider)))
            .model(config.provider.model.clone())
            .temperature(config.provider.temperature)
            .max_retries(config.agent.max_retries)
            .stream_buffer(config.agent.stream_buffer)
            .task_tracker(Arc::new(tracker));
        builder.max_tokens = config.provider.max_tokens;
        builder.system_prompt = config.agent.system_prompt.clone();
        builder
    }

    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Register a tool. Duplicate names are rejected.
    pub fn tool(mut self, tool: ToolDefinition) -> Result<Self> {
        self.tools.register(tool)?;
        Ok(self)
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Observe every event.
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.subscribe_all(observer);
        self
    }

    /// Observe one event name, e.g. `"tool-error"`.
    pub fn observe(mut self, event_name: impl Into<String>, observer: Arc<dyn Observer>) -> Self {
        self.observers.subscribe(event_name, observer);
        self
    }

    pub fn task_tracker(mut self, tracker: Arc<dyn TaskTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn conversation_id(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    /// Identical consecutive tool failures tolerated before a turn is aborted.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Capacity of the channel between a streaming turn and its reader.
    pub fn stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity;
        self
    }

    /// Seed the conversation.
    pub fn history(mut self, messages: Vec<Message>) -> Self {
        self.history = messages;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self.provider.ok_or_else(|| Error::Config {
            message: "an agent needs a provider".into(),
        })?;
        if self.max_retries == 0 {
            return Err(Error::Config {
                message: "max_retries must be at least 1".into(),
            });
        }
        if self.stream_buffer == 0 {
            return Err(Error::Config {
                message: "stream_buffer must be at least 1".into(),
            });
        }
        for message in &self.history {
            message.validate()?;
        }

        Ok(Agent {
            inner: Arc::new(AgentInner {
                provider,
                model: self.model,
                system_prompt: self.system_prompt,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                tools: self.tools,
                observers: self.observers,
                tracker: self.tracker,
                conversation_id: self.conversation_id.unwrap_or_default(),
                stream_buffer: self.stream_buffer,
                state: Mutex::new(TurnState {
                    history: ChatHistory::from_messages(self.history),
                    breaker: CircuitBreaker::new(self.max_retries),
                }),
            }),
        })
    }
}
