//! The agent orchestrator for Switchyard.
//!
//! The agent follows a **request → act → observe** cycle:
//!
//! 1. **Receive** messages from the host (`chat` or `stream`)
//! 2. **Send** the conversation and tool schemas to the provider
//! 3. **If tool calls**: execute them in order, append call + results, loop back to step 2
//! 4. **If text**: append it and return it to the host
//!
//! The loop continues until the model answers with text, a fatal error
//! occurs, or the circuit breaker gives up on a repeating tool failure.

pub mod agent;
pub mod breaker;
mod executor;
pub mod stream;
pub mod stream_event;

#[cfg(test)]
mod test_helpers;

pub use agent::{Agent, AgentBuilder};
pub use breaker::{CircuitBreaker, Verdict};
pub use stream::AgentStream;
pub use stream_event::AgentStreamEvent;
