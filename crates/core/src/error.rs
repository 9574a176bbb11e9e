//! Error types for the Switchyard domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the top-level [`Error`]
//! is what escapes `chat()` and `stream()`.
//!
//! Only fatal conditions are represented here. Recoverable tool failures
//! never surface as an `Error`: they are turned into conversation content.

use thiserror::Error;

/// The top-level error type for all Switchyard operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Message validation ---
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    // --- Circuit breaker ---
    #[error(
        "Circuit breaker tripped: {tool_name} failed {consecutive_errors} times in a row with: {error}"
    )]
    CircuitBreakerTripped {
        tool_name: String,
        error: String,
        consecutive_errors: u32,
    },

    // --- Cancellation ---
    #[error("Operation cancelled")]
    Cancelled,

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool already registered: {0}")]
    Duplicate(String),

    #[error("Missing required parameter '{parameter}' for tool {tool_name}")]
    MissingParameter { tool_name: String, parameter: String },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },
}
