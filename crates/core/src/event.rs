//! Agent events and observer dispatch.
//!
//! The agent announces what it is doing (messages being saved, requests
//! being sent, tools being called) to registered [`Observer`]s. Dispatch is
//! synchronous and in registration order, but each observer is isolated: an
//! observer that fails is logged and skipped, it never aborts a turn.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::message::Message;
use crate::task::{Task, TaskStatus};

/// Everything the agent reports while running a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AgentEvent {
    ChatStart {
        conversation_id: String,
        timestamp: DateTime<Utc>,
    },

    ChatStop {
        conversation_id: String,
        message: Message,
    },

    MessageSaving {
        message: Message,
    },

    MessageSaved {
        message: Message,
        history_len: usize,
    },

    MessageSending {
        history_len: usize,
        tool_count: usize,
    },

    MessageSent {
        reply: Option<Message>,
    },

    ToolCalling {
        tool_name: String,
        call_id: String,
        inputs: serde_json::Map<String, serde_json::Value>,
    },

    ToolCalled {
        tool_name: String,
        call_id: String,
        result: serde_json::Value,
        duration_ms: u64,
    },

    ToolError {
        tool_name: String,
        call_id: String,
        error: String,
        consecutive_errors: u32,
    },

    TaskCreated {
        task: Task,
    },

    TaskUpdated {
        task_id: String,
        status: TaskStatus,
    },

    StreamStart {
        conversation_id: String,
    },

    StreamStop {
        conversation_id: String,
        message: Option<Message>,
    },
}

impl AgentEvent {
    /// The event name observers subscribe to.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChatStart { .. } => "chat-start",
            Self::ChatStop { .. } => "chat-stop",
            Self::MessageSaving { .. } => "message-saving",
            Self::MessageSaved { .. } => "message-saved",
            Self::MessageSending { .. } => "message-sending",
            Self::MessageSent { .. } => "message-sent",
            Self::ToolCalling { .. } => "tool-calling",
            Self::ToolCalled { .. } => "tool-called",
            Self::ToolError { .. } => "tool-error",
            Self::TaskCreated { .. } => "task-created",
            Self::TaskUpdated { .. } => "task-updated",
            Self::StreamStart { .. } => "stream-start",
            Self::StreamStop { .. } => "stream-stop",
        }
    }
}

/// Error an observer may report. Logged, never propagated.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

pub trait Observer: Send + Sync {
    fn notify(&self, event: &AgentEvent) -> Result<(), ObserverError>;
}

impl<F> Observer for F
where
    F: Fn(&AgentEvent) -> Result<(), ObserverError> + Send + Sync,
{
    fn notify(&self, event: &AgentEvent) -> Result<(), ObserverError> {
        self(event)
    }
}

struct Registration {
    /// `None` = every event
    event_name: Option<String>,
    observer: Arc<dyn Observer>,
}

/// Observers in registration order, global or bound to one event name.
#[derive(Default, Clone)]
pub struct ObserverRegistry {
    registrations: Vec<Arc<Registration>>,
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.registrations.len())
            .finish()
    }
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe every event.
    pub fn subscribe_all(&mut self, observer: Arc<dyn Observer>) {
        self.registrations.push(Arc::new(Registration {
            event_name: None,
            observer,
        }));
    }

    /// Observe a single event name, e.g. `"tool-called"`.
    pub fn subscribe(&mut self, event_name: impl Into<String>, observer: Arc<dyn Observer>) {
        self.registrations.push(Arc::new(Registration {
            event_name: Some(event_name.into()),
            observer,
        }));
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Deliver `event` to every matching observer.
    pub fn dispatch(&self, event: &AgentEvent) {
        let name = event.name();
        for reg in &self.registrations {
            if reg.event_name.as_deref().is_some_and(|n| n != name) {
                continue;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| reg.observer.notify(event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event = name, error = %e, "Observer failed, continuing"),
                Err(_) => warn!(event = name, "Observer panicked, continuing"),
            }
        }
    }
}

/// Forwards every event into a `tokio::sync::broadcast` channel.
///
/// Lets async consumers (a UI, a log shipper) subscribe without sitting on
/// the agent's hot path.
pub struct BroadcastObserver {
    sender: broadcast::Sender<Arc<AgentEvent>>,
}

impl BroadcastObserver {
    /// Create a broadcast observer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AgentEvent>> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastObserver {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Observer for BroadcastObserver {
    fn notify(&self, event: &AgentEvent) -> Result<(), ObserverError> {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn start() -> AgentEvent {
        AgentEvent::ChatStart {
            conversation_id: "c1".into(),
            timestamp: Utc::now(),
        }
    }

    fn sending() -> AgentEvent {
        AgentEvent::MessageSending {
            history_len: 1,
            tool_count: 0,
        }
    }

    #[test]
    fn event_names_are_kebab_case() {
        assert_eq!(start().name(), "chat-start");
        assert_eq!(sending().name(), "message-sending");
        let json = serde_json::to_string(&sending()).unwrap();
        assert!(json.contains(r#""event":"message-sending""#));
    }

    #[test]
    fn dispatch_follows_registration_order_and_filters() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ObserverRegistry::new();

        let log = seen.clone();
        registry.subscribe_all(Arc::new(move |e: &AgentEvent| -> Result<(), ObserverError> {
            log.lock().unwrap().push(format!("all:{}", e.name()));
            Ok(())
        }));
        let log = seen.clone();
        registry.subscribe(
            "chat-start",
            Arc::new(move |e: &AgentEvent| -> Result<(), ObserverError> {
                log.lock().unwrap().push(format!("named:{}", e.name()));
                Ok(())
            }),
        );

        registry.dispatch(&start());
        registry.dispatch(&sending());

        assert_eq!(
            *seen.lock().unwrap(),
            ["all:chat-start", "named:chat-start", "all:message-sending"]
        );
    }

    #[test]
    fn failing_observer_does_not_stop_dispatch() {
        let count = Arc::new(Mutex::new(0));
        let mut registry = ObserverRegistry::new();
        registry.subscribe_all(Arc::new(|_: &AgentEvent| -> Result<(), ObserverError> {
            Err("observer exploded".into())
        }));
        let c = count.clone();
        registry.subscribe_all(Arc::new(move |_: &AgentEvent| -> Result<(), ObserverError> {
            *c.lock().unwrap() += 1;
            Ok(())
        }));

        registry.dispatch(&start());
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn panicking_observer_is_isolated() {
        let count = Arc::new(Mutex::new(0));
        let mut registry = ObserverRegistry::new();
        registry.subscribe_all(Arc::new(|_: &AgentEvent| -> Result<(), ObserverError> {
            panic!("observer bug")
        }));
        let c = count.clone();
        registry.subscribe_all(Arc::new(move |_: &AgentEvent| -> Result<(), ObserverError> {
            *c.lock().unwrap() += 1;
            Ok(())
        }));

        registry.dispatch(&sending());
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn broadcast_observer_publishes() {
        let observer = BroadcastObserver::new(16);
        let mut rx = observer.subscribe();
        observer.notify(&sending()).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "message-sending");
    }

    #[test]
    fn broadcast_without_subscribers_is_ok() {
        let observer = BroadcastObserver::default();
        assert!(observer.notify(&start()).is_ok());
    }
}
