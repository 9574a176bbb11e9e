//! The tool loop: runs every invocation of a [`ToolCallMessage`] in order.
//!
//! Invocations execute strictly one after another. Execution failures are
//! turned into diagnostics the model sees on its next request, until the
//! circuit breaker decides the same failure has repeated too often. Unknown
//! tools and missing parameters abort the turn immediately.

use std::sync::Arc;
use std::time::Instant;

use switchyard_core::error::{Error, Result, ToolError};
use switchyard_core::event::{AgentEvent, ObserverRegistry};
use switchyard_core::message::{
    ConversationId, InvocationOutcome, ToolCallMessage, ToolCallResultMessage, ToolInvocation,
};
use switchyard_core::task::{StepUpdate, Task, TaskStatus, TaskTracker};
use switchyard_core::tool::ToolRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::breaker::{CircuitBreaker, Verdict};

/// Give every invocation a call id so the call and its result pair up on the wire.
pub(crate) fn bind_call_ids(call: &mut ToolCallMessage) {
    for invocation in &mut call.invocations {
        if invocation.call_id.is_none() {
            invocation.call_id = Some(format!("call_{}", Uuid::new_v4().simple()));
        }
    }
}

/// The text the model sees in place of a failed tool's result.
pub(crate) fn failure_diagnostic(tool_name: &str, error: &str, consecutive_errors: u32) -> String {
    format!(
        "Tool '{tool_name}' failed: {error}. \
         This call has now failed {consecutive_errors} time(s) in a row. \
         Do not repeat the same call unchanged: check the arguments or try a different approach."
    )
}

/// Borrowed view of everything a tool round needs.
pub(crate) struct ToolExecutor<'a> {
    pub tools: &'a ToolRegistry,
    pub observers: &'a ObserverRegistry,
    pub tracker: Option<&'a Arc<dyn TaskTracker>>,
    pub conversation_id: &'a ConversationId,
}

impl ToolExecutor<'_> {
    /// Run `call` and return its result message: same invocations, same
    /// order, each resolved.
    pub async fn run(
        &self,
        call: &ToolCallMessage,
        breaker: &mut CircuitBreaker,
        cancel: &CancellationToken,
    ) -> Result<ToolCallResultMessage> {
        let mut resolved = Vec::with_capacity(call.invocations.len());
        for invocation in &call.invocations {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            resolved.push(self.run_one(invocation, breaker, cancel).await?);
        }
        Ok(ToolCallResultMessage::new(resolved))
    }

    async fn run_one(
        &self,
        invocation: &ToolInvocation,
        breaker: &mut CircuitBreaker,
        cancel: &CancellationToken,
    ) -> Result<ToolInvocation> {
        let tool_name = invocation.tool_name.as_str();
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;
        let call_id = invocation.call_id.clone().unwrap_or_default();

        let task = self.track_start(invocation).await;
        self.observers.dispatch(&AgentEvent::ToolCalling {
            tool_name: tool_name.to_string(),
            call_id: call_id.clone(),
            inputs: invocation.inputs.clone(),
        });

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = tool.execute(&invocation.inputs) => outcome,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                debug!(tool = tool_name, duration_ms, "Tool succeeded");
                breaker.record_success();
                self.observers.dispatch(&AgentEvent::ToolCalled {
                    tool_name: tool_name.to_string(),
                    call_id,
                    result: result.clone(),
                    duration_ms,
                });
                self.track_update(task, StepUpdate::completed(result.clone()))
                    .await;
                Ok(invocation
                    .clone()
                    .with_outcome(InvocationOutcome::Success { result }))
            }
            Err(ToolError::ExecutionFailed { reason, .. }) => {
                let verdict = breaker.record_failure(tool_name, &reason);
                let consecutive_errors = match verdict {
                    Verdict::Retry { consecutive_errors }
                    | Verdict::Tripped { consecutive_errors } => consecutive_errors,
                };
                self.observers.dispatch(&AgentEvent::ToolError {
                    tool_name: tool_name.to_string(),
                    call_id,
                    error: reason.clone(),
                    consecutive_errors,
                });

                if let Verdict::Tripped { .. } = verdict {
                    warn!(tool = tool_name, error = %reason, consecutive_errors, "Circuit breaker tripped");
                    self.track_update(task, StepUpdate::failed(TaskStatus::Failed, &reason, None))
                        .await;
                    return Err(Error::CircuitBreakerTripped {
                        tool_name: tool_name.to_string(),
                        error: reason,
                        consecutive_errors,
                    });
                }

                warn!(tool = tool_name, error = %reason, consecutive_errors, "Tool failed, handing error back to the model");
                let diagnostic = failure_diagnostic(tool_name, &reason, consecutive_errors);
                self.track_update(
                    task,
                    StepUpdate::failed(TaskStatus::NeedsRecovery, &reason, Some(diagnostic.clone())),
                )
                .await;
                Ok(invocation.clone().with_outcome(InvocationOutcome::Failed {
                    error: reason,
                    diagnostic,
                }))
            }
            Err(other) => {
                self.track_update(
                    task,
                    StepUpdate::failed(TaskStatus::Failed, other.to_string(), None),
                )
                .await;
                Err(other.into())
            }
        }
    }

    async fn track_start(&self, invocation: &ToolInvocation) -> Option<Task> {
        let tracker = self.tracker?;
        let name = format!("Run {}", invocation.tool_name);
        match tracker
            .create_task(
                self.conversation_id,
                &name,
                &invocation.tool_name,
                &invocation.inputs,
            )
            .await
        {
            Ok(task) => {
                self.observers
                    .dispatch(&AgentEvent::TaskCreated { task: task.clone() });
                Some(task)
            }
            Err(e) => {
                warn!(tool = %invocation.tool_name, error = %e, "Task tracker failed to create task");
                None
            }
        }
    }

    async fn track_update(&self, task: Option<Task>, update: StepUpdate) {
        let (Some(tracker), Some(task)) = (self.tracker, task) else {
            return;
        };
        let status = update.status;
        match tracker
            .update_step(self.conversation_id, &task.id, &task.step_id, update)
            .await
        {
            Ok(_) => self.observers.dispatch(&AgentEvent::TaskUpdated {
                task_id: task.id,
                status,
            }),
            Err(e) => warn!(task_id = %task.id, error = %e, "Task tracker failed to update step"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_core::event::ObserverError;
    use switchyard_core::task::InMemoryTaskTracker;
    use switchyard_core::tool::{PropertyType, ToolDefinition, ToolProperty};

    fn registry() -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools
            .register(
                ToolDefinition::from_fn("echo", "Echo the text", |args| {
                    Ok(args.into_iter().next().unwrap_or_default())
                })
                .with_property(
                    ToolProperty::new("text", PropertyType::String, "Text to echo").required(),
                ),
            )
            .unwrap();
        tools
            .register(ToolDefinition::from_fn("broken", "Always fails", |_| {
                Err("disk full".into())
            }))
            .unwrap();
        tools
    }

    fn invocation(tool: &str, inputs: serde_json::Value) -> ToolInvocation {
        ToolInvocation::new(tool, inputs.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn missing_call_ids_are_filled_in() {
        let mut call = ToolCallMessage::new(vec![
            invocation("echo", json!({})).with_call_id("call_x"),
            invocation("echo", json!({})),
        ]);
        bind_call_ids(&mut call);
        assert_eq!(call.invocations[0].call_id.as_deref(), Some("call_x"));
        assert!(call.invocations[1].call_id.as_deref().unwrap().starts_with("call_"));
    }

    #[tokio::test]
    async fn results_match_invocations_in_order() {
        let tools = registry();
        let observers = ObserverRegistry::new();
        let conv = ConversationId::from("c1");
        let executor = ToolExecutor {
            tools: &tools,
            observers: &observers,
            tracker: None,
            conversation_id: &conv,
        };
        let mut call = ToolCallMessage::new(vec![
            invocation("echo", json!({"text": "one"})),
            invocation("broken", json!({})),
            invocation("echo", json!({"text": "three"})),
        ]);
        bind_call_ids(&mut call);

        let mut breaker = CircuitBreaker::new(1);
        let result = executor
            .run(&call, &mut breaker, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.pairs_with(&call));
        assert!(result.invocations.iter().all(ToolInvocation::is_resolved));
        assert_eq!(result.invocations[0].result_text().as_deref(), Some("one"));
        assert!(result.invocations[1].result_text().unwrap().contains("disk full"));
        assert_eq!(result.invocations[2].result_text().as_deref(), Some("three"));
        // The success after the failure cleared the breaker
        assert_eq!(breaker.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn repeated_failure_in_one_call_trips() {
        let tools = registry();
        let observers = ObserverRegistry::new();
        let conv = ConversationId::from("c1");
        let executor = ToolExecutor {
            tools: &tools,
            observers: &observers,
            tracker: None,
            conversation_id: &conv,
        };
        let call = ToolCallMessage::new(vec![
            invocation("broken", json!({})),
            invocation("broken", json!({})),
        ]);
        let err = executor
            .run(&call, &mut CircuitBreaker::new(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CircuitBreakerTripped {
                consecutive_errors: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn tracker_and_observers_see_every_step() {
        let tools = registry();
        let names = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut observers = ObserverRegistry::new();
        let log = names.clone();
        observers.subscribe_all(Arc::new(
            move |e: &AgentEvent| -> std::result::Result<(), ObserverError> {
                log.lock().unwrap().push(e.name());
                Ok(())
            },
        ));
        let tracker = Arc::new(InMemoryTaskTracker::new());
        let dyn_tracker: Arc<dyn TaskTracker> = tracker.clone();
        let conv = ConversationId::from("c1");
        let executor = ToolExecutor {
            tools: &tools,
            observers: &observers,
            tracker: Some(&dyn_tracker),
            conversation_id: &conv,
        };
        let call = ToolCallMessage::new(vec![
            invocation("echo", json!({"text": "hi"})),
            invocation("broken", json!({})),
        ]);
        executor
            .run(&call, &mut CircuitBreaker::new(1), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            *names.lock().unwrap(),
            [
                "task-created",
                "tool-calling",
                "tool-called",
                "task-updated",
                "task-created",
                "tool-calling",
                "tool-error",
                "task-updated",
            ]
        );
        let tasks = tracker.tasks(&conv).await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[1].status, TaskStatus::NeedsRecovery);
        assert!(tasks[1].content.as_deref().unwrap().contains("Do not repeat"));
    }

    #[tokio::test]
    async fn unknown_tool_is_fatal() {
        let tools = registry();
        let observers = ObserverRegistry::new();
        let conv = ConversationId::from("c1");
        let executor = ToolExecutor {
            tools: &tools,
            observers: &observers,
            tracker: None,
            conversation_id: &conv,
        };
        let call = ToolCallMessage::new(vec![invocation("nope", json!({}))]);
        let err = executor
            .run(&call, &mut CircuitBreaker::new(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool(ToolError::NotFound(name)) if name == "nope"));
    }

    #[tokio::test]
    async fn missing_parameter_is_fatal() {
        let tools = registry();
        let observers = ObserverRegistry::new();
        let conv = ConversationId::from("c1");
        let executor = ToolExecutor {
            tools: &tools,
            observers: &observers,
            tracker: None,
            conversation_id: &conv,
        };
        let call = ToolCallMessage::new(vec![invocation("echo", json!({}))]);
        let err = executor
            .run(&call, &mut CircuitBreaker::new(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Tool(ToolError::MissingParameter { parameter, .. }) if parameter == "text"
        ));
    }
}
