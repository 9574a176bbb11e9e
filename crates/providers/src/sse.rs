//! Server-Sent-Events parsing for OpenAI-compatible streaming responses.
//!
//! Two layers:
//! - [`SseParser`] turns raw bytes into [`SseEvent`]s. It buffers partial
//!   lines across reads, only decodes complete lines (so a multi-byte
//!   character split between two reads survives), recognizes `data: ` frames
//!   and the `[DONE]` sentinel, and silently skips anything malformed.
//! - [`pump`] drives a byte stream through the parser and forwards
//!   [`StreamChunk`]s to the agent, assembling tool-call deltas into one
//!   `ToolCalls` chunk when the response finishes.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::Deserialize;
use switchyard_core::error::ProviderError;
use switchyard_core::message::{ToolCallMessage, ToolInvocation, Usage};
use switchyard_core::provider::StreamChunk;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::openai_compat::parse_arguments;

/// One meaningful SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Content(String),
    ToolCallDelta(Vec<ToolCallDelta>),
    Usage(Usage),
    Done,
}

/// A fragment of a tool call, keyed by its position in the response.
///
/// Some backends leave out `index` when the response has a single call; it
/// then defaults to the first slot.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

// --- Wire frames ---

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Incremental line splitter and frame decoder.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the events completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = Self::parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        Self::parse_line(&rest).into_iter().collect()
    }

    fn parse_line(raw: &[u8]) -> Option<SseEvent> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\n', '\r']);

        // Blank separators, comments and non-data fields carry nothing for us
        let data = line.strip_prefix("data: ")?.trim();
        if data == "[DONE]" {
            return Some(SseEvent::Done);
        }

        let frame: StreamResponse = match serde_json::from_str(data) {
            Ok(frame) => frame,
            Err(e) => {
                trace!(data = %data, error = %e, "Ignoring unparseable SSE frame");
                return None;
            }
        };

        let delta = frame.choices.into_iter().next().map(|c| c.delta);
        if let Some(delta) = delta {
            if let Some(calls) = delta.tool_calls.filter(|c| !c.is_empty()) {
                return Some(SseEvent::ToolCallDelta(calls));
            }
            if let Some(text) = delta.content.filter(|c| !c.is_empty()) {
                return Some(SseEvent::Content(text));
            }
        }

        frame
            .usage
            .map(|u| SseEvent::Usage(Usage::new(u.prompt_tokens, u.completion_tokens)))
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Collects tool-call deltas until the response is complete.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAssembler {
    pub fn absorb(&mut self, deltas: Vec<ToolCallDelta>) {
        for delta in deltas {
            let call = self.calls.entry(delta.index).or_default();
            if let Some(id) = delta.id {
                call.id = Some(id);
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    call.name.push_str(&name);
                }
                if let Some(args) = function.arguments {
                    call.arguments.push_str(&args);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Materialize the collected calls, in index order.
    pub fn finish(self) -> Result<Option<ToolCallMessage>, ProviderError> {
        if self.calls.is_empty() {
            return Ok(None);
        }
        let invocations = self
            .calls
            .into_values()
            .map(|call| {
                let inputs = parse_arguments(&call.name, &call.arguments)?;
                let invocation = ToolInvocation::new(call.name, inputs);
                Ok(match call.id {
                    Some(id) => invocation.with_call_id(id),
                    None => invocation,
                })
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;
        Ok(Some(ToolCallMessage::new(invocations)))
    }
}

/// Read `bytes` to completion, forwarding chunks to `tx`.
///
/// Content and usage are forwarded as they arrive. Tool calls are emitted
/// once, after `[DONE]` or the end of the body. Read errors and idle
/// timeouts become a transport-error chunk and end the stream; cancellation
/// ends it silently.
pub async fn pump<S, B, E>(
    mut bytes: S,
    tx: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
    idle_timeout: Duration,
) where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut parser = SseParser::new();
    let mut tools = ToolCallAssembler::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stream cancelled by caller");
                return;
            }
            next = tokio::time::timeout(idle_timeout, bytes.next()) => next,
        };

        let (events, ended) = match next {
            Err(_) => {
                warn!(idle_secs = idle_timeout.as_secs(), "Stream idle timeout");
                let err = ProviderError::Timeout(idle_timeout.as_secs());
                let _ = tx.send(StreamChunk::transport_error(err)).await;
                return;
            }
            Ok(Some(Err(e))) => {
                warn!(error = %e, "Stream read failed");
                let err = ProviderError::StreamInterrupted(e.to_string());
                let _ = tx.send(StreamChunk::transport_error(err)).await;
                return;
            }
            Ok(Some(Ok(chunk))) => (parser.push(chunk.as_ref()), false),
            Ok(None) => (parser.finish(), true),
        };

        for event in events {
            let chunk = match event {
                SseEvent::Content(text) => StreamChunk::Content { text },
                SseEvent::Usage(usage) => StreamChunk::Usage { usage },
                SseEvent::ToolCallDelta(deltas) => {
                    tools.absorb(deltas);
                    continue;
                }
                SseEvent::Done => {
                    flush_tools(tools, &tx).await;
                    return;
                }
            };
            if tx.send(chunk).await.is_err() {
                return; // receiver dropped
            }
        }

        if ended {
            debug!("Stream ended without [DONE]");
            flush_tools(tools, &tx).await;
            return;
        }
    }
}

async fn flush_tools(tools: ToolCallAssembler, tx: &mpsc::Sender<StreamChunk>) {
    let chunk = match tools.finish() {
        Ok(Some(message)) => StreamChunk::ToolCalls { message },
        Ok(None) => return,
        Err(e) => StreamChunk::Error {
            message: e.to_string(),
            exchange: None,
        },
    };
    let _ = tx.send(chunk).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn run(parts: Vec<Result<&'static str, &'static str>>) -> Vec<StreamChunk> {
        let (tx, mut rx) = mpsc::channel(64);
        let stream = futures::stream::iter(parts);
        pump(stream, tx, CancellationToken::new(), Duration::from_secs(5)).await;
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    }

    #[test]
    fn single_content_frame_then_done() {
        let mut parser = SseParser::new();
        let events = parser.push(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\ndata: [DONE]\n\n",
        );
        assert_eq!(events, vec![SseEvent::Content("a".into()), SseEvent::Done]);
    }

    #[test]
    fn partial_lines_are_buffered() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"choices\":[{\"delta\":{\"con").is_empty());
        let events = parser.push(b"tent\":\"hi\"}}]}\n");
        assert_eq!(events, vec![SseEvent::Content("hi".into())]);
    }

    #[test]
    fn split_multibyte_character_survives() {
        let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"h\u{e9}\"}}]}\n".as_bytes();
        // Split inside the two-byte 'é'
        let cut = frame.iter().position(|&b| b == 0xc3).unwrap() + 1;
        let mut parser = SseParser::new();
        assert!(parser.push(&frame[..cut]).is_empty());
        assert_eq!(
            parser.push(&frame[cut..]),
            vec![SseEvent::Content("h\u{e9}".into())]
        );
    }

    #[test]
    fn malformed_and_foreign_lines_are_skipped() {
        let mut parser = SseParser::new();
        let events = parser.push(
            b": keep-alive\nevent: message\ndata: {not json\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\r\n",
        );
        assert_eq!(events, vec![SseEvent::Content("ok".into())]);
    }

    #[test]
    fn usage_frame() {
        let mut parser = SseParser::new();
        let events = parser.push(
            b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5,\"total_tokens\":15}}\n",
        );
        assert_eq!(events, vec![SseEvent::Usage(Usage::new(10, 5))]);
    }

    #[test]
    fn empty_delta_yields_nothing() {
        let mut parser = SseParser::new();
        let events =
            parser.push(b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n");
        assert!(events.is_empty());
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: [DONE]").is_empty());
        assert_eq!(parser.finish(), vec![SseEvent::Done]);
    }

    #[test]
    fn assembler_joins_fragments_in_index_order() {
        let mut tools = ToolCallAssembler::default();
        let deltas: Vec<ToolCallDelta> = serde_json::from_value(json!([
            {"index": 1, "id": "call_b", "function": {"name": "calc", "arguments": ""}},
            {"index": 0, "id": "call_a", "function": {"name": "search", "arguments": "{\"q\""}}
        ]))
        .unwrap();
        tools.absorb(deltas);
        let more: Vec<ToolCallDelta> = serde_json::from_value(json!([
            {"index": 0, "function": {"arguments": ": \"rust\"}"}}
        ]))
        .unwrap();
        tools.absorb(more);

        let message = tools.finish().unwrap().unwrap();
        assert_eq!(message.invocations.len(), 2);
        assert_eq!(message.invocations[0].tool_name, "search");
        assert_eq!(message.invocations[0].call_id.as_deref(), Some("call_a"));
        assert_eq!(message.invocations[0].inputs["q"], "rust");
        assert_eq!(message.invocations[1].tool_name, "calc");
        assert!(message.invocations[1].inputs.is_empty());
    }

    #[test]
    fn tool_delta_without_index_is_kept() {
        let mut parser = SseParser::new();
        let events = parser.push(
            b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"id\":\"call_1\",\"function\":{\"name\":\"echo\",\"arguments\":\"{\\\"text\\\":\\\"hi\\\"}\"}}]}}]}\n",
        );
        let deltas = match events.as_slice() {
            [SseEvent::ToolCallDelta(deltas)] => deltas.clone(),
            other => panic!("expected one tool delta, got {other:?}"),
        };
        assert_eq!(deltas[0].index, 0);

        let mut tools = ToolCallAssembler::default();
        tools.absorb(deltas);
        let message = tools.finish().unwrap().unwrap();
        assert_eq!(message.invocations[0].tool_name, "echo");
        assert_eq!(message.invocations[0].inputs["text"], "hi");
    }

    #[tokio::test]
    async fn pump_forwards_content_in_order() {
        let chunks = run(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: [DONE]\n\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n"),
        ])
        .await;
        assert_eq!(
            chunks,
            vec![StreamChunk::content("Hel"), StreamChunk::content("lo")]
        );
    }

    #[tokio::test]
    async fn pump_emits_tool_calls_once_at_the_end() {
        let chunks = run(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"create_file\",\"arguments\":\"{\\\"path\\\":\"}}]}}]}\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"x.txt\\\"}\"}}]}}]}\n"),
            Ok("data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":3}}\n"),
        ])
        .await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0],
            StreamChunk::Usage {
                usage: Usage::new(7, 3)
            }
        );
        match &chunks[1] {
            StreamChunk::ToolCalls { message } => {
                assert_eq!(message.invocations[0].tool_name, "create_file");
                assert_eq!(message.invocations[0].inputs["path"], "x.txt");
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_error_becomes_transport_chunk() {
        let chunks = run(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n"),
            Err("connection reset"),
        ])
        .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], StreamChunk::content("par"));
        match &chunks[1] {
            StreamChunk::Error {
                message,
                exchange: Some(_),
            } => assert!(message.contains("connection reset")),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_stream_times_out() {
        let (tx, mut rx) = mpsc::channel(8);
        let pending = futures::stream::pending::<Result<&'static str, &'static str>>();
        tokio::time::pause();
        pump(pending, tx, CancellationToken::new(), Duration::from_secs(1)).await;
        match rx.recv().await {
            Some(StreamChunk::Error { message, .. }) => assert!(message.contains("timed out")),
            other => panic!("expected timeout chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_ends_silently() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pending = futures::stream::pending::<Result<&'static str, &'static str>>();
        pump(pending, tx, cancel, Duration::from_secs(60)).await;
        assert!(rx.recv().await.is_none());
    }
}
