//! LLM provider implementations for Switchyard.
//!
//! Every provider implements the `switchyard_core::Provider` trait. Only the
//! OpenAI-compatible wire protocol is shipped; it covers OpenAI, OpenRouter,
//! Ollama and most hosted inference endpoints.

pub mod openai_compat;
pub mod sse;

pub use openai_compat::OpenAiCompatProvider;
pub use sse::{SseEvent, SseParser};
