//! Task tracking: an optional record of tool executions.
//!
//! The agent reports every tool invocation to a [`TaskTracker`] when one is
//! attached: a task is created before the tool runs and its step is updated
//! with the outcome. The agent does not care how tasks are stored, and a
//! failing tracker never aborts a turn.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::message::ConversationId;

/// Error a tracker may report. Logged by the agent, never propagated.
pub type TrackerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    /// The tool failed but the model gets another chance.
    NeedsRecovery,
    /// The circuit breaker gave up.
    Failed,
}

/// One tracked tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub step_id: String,
    pub name: String,
    pub tool_name: String,
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What happened to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepUpdate {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable summary (e.g. the diagnostic shown to the model)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl StepUpdate {
    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
            content: None,
        }
    }

    pub fn failed(status: TaskStatus, error: impl Into<String>, content: Option<String>) -> Self {
        Self {
            status,
            result: None,
            error: Some(error.into()),
            content,
        }
    }
}

#[async_trait]
pub trait TaskTracker: Send + Sync {
    async fn create_task(
        &self,
        conversation_id: &ConversationId,
        name: &str,
        tool_name: &str,
        inputs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Task, TrackerError>;

    async fn update_step(
        &self,
        conversation_id: &ConversationId,
        task_id: &str,
        step_id: &str,
        update: StepUpdate,
    ) -> Result<Task, TrackerError>;
}

/// Tracker that keeps tasks in memory, grouped by conversation.
///
/// Results longer than `max_result_chars` (when serialized) are replaced by a
/// truncated string so one huge tool output cannot bloat the task log.
#[derive(Debug, Default)]
pub struct InMemoryTaskTracker {
    tasks: Mutex<HashMap<ConversationId, Vec<Task>>>,
    max_result_chars: Option<usize>,
}

impl InMemoryTaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_result_chars(mut self, limit: usize) -> Self {
        self.max_result_chars = Some(limit);
        self
    }

    /// Tasks of a conversation, in creation order.
    pub async fn tasks(&self, conversation_id: &ConversationId) -> Vec<Task> {
        self.tasks
            .lock()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    fn truncate(&self, value: serde_json::Value) -> serde_json::Value {
        let Some(limit) = self.max_result_chars else {
            return value;
        };
        let text = match &value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if text.chars().count() <= limit {
            return value;
        }
        let kept: String = text.chars().take(limit).collect();
        serde_json::Value::String(format!("{kept}… [truncated]"))
    }
}

#[async_trait]
impl TaskTracker for InMemoryTaskTracker {
    async fn create_task(
        &self,
        conversation_id: &ConversationId,
        name: &str,
        tool_name: &str,
        inputs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Task, TrackerError> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            step_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            tool_name: tool_name.to_string(),
            inputs: inputs.clone(),
            status: TaskStatus::Running,
            result: None,
            error: None,
            content: None,
            created_at: now,
            updated_at: now,
        };
        self.tasks
            .lock()
            .await
            .entry(conversation_id.clone())
            .or_default()
            .push(task.clone());
        Ok(task)
    }

    async fn update_step(
        &self,
        conversation_id: &ConversationId,
        task_id: &str,
        step_id: &str,
        update: StepUpdate,
    ) -> Result<Task, TrackerError> {
        let result = update.result.map(|v| self.truncate(v));
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(conversation_id)
            .and_then(|list| {
                list.iter_mut()
                    .find(|t| t.id == task_id && t.step_id == step_id)
            })
            .ok_or_else(|| format!("unknown task {task_id} in conversation {conversation_id}"))?;

        task.status = update.status;
        task.result = result;
        task.error = update.error;
        task.content = update.content;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }
}
