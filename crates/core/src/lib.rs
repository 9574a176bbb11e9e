//! # Switchyard Core
//!
//! Domain types, traits, and error definitions for the Switchyard agent core.
//! This crate has **no HTTP or runtime dependencies** beyond tokio's sync
//! primitives. It defines the model that the provider and agent crates
//! implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator is defined as a trait here (provider, tool capability,
//! observer, task tracker). Implementations live in their respective crates
//! or in the host application. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod event;
pub mod history;
pub mod message;
pub mod provider;
pub mod task;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, ToolError};
pub use event::{AgentEvent, BroadcastObserver, Observer, ObserverRegistry};
pub use history::ChatHistory;
pub use message::{
    AssistantMessage, ChatInput, ConversationId, InvocationOutcome, Message, Role,
    ToolCallMessage, ToolCallResultMessage, ToolInvocation, Usage, UserMessage,
};
pub use provider::{Provider, ProviderRequest, StreamChunk, ToolExchange};
pub use task::{InMemoryTaskTracker, StepUpdate, Task, TaskStatus, TaskTracker};
pub use tool::{PropertyType, ToolDefinition, ToolProperty, ToolRegistry, ToolSchema};
pub use tokio_util::sync::CancellationToken;
