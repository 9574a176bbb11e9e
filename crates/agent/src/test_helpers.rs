//! Shared test helpers for agent unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use switchyard_core::error::ProviderError;
use switchyard_core::message::{AssistantMessage, Message, Usage};
use switchyard_core::provider::{Provider, ProviderRequest};
use tokio_util::sync::CancellationToken;

/// A provider that returns a sequence of scripted replies.
///
/// Each call to `request` pops the next reply. Panics if more calls are made
/// than replies provided.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<Message, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Result<Message, ProviderError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider that answers once with plain text.
    pub fn text(text: &str) -> Self {
        Self::new(vec![Ok(Message::Assistant(
            AssistantMessage::new(text).with_usage(Some(Usage::new(10, 5))),
        ))])
    }

    #[allow(dead_code)]
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn request(
        &self,
        request: ProviderRequest,
        _cancel: &CancellationToken,
    ) -> Result<Message, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("ScriptedProvider: no more replies")
    }
}
