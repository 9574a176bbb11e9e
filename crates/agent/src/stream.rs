//! The caller's end of a streaming turn.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use switchyard_core::error::Result;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::stream_event::AgentStreamEvent;

/// Events of one streaming turn, ending with `Done` or an error.
///
/// Dropping the stream cancels the turn.
pub struct AgentStream {
    events: ReceiverStream<Result<AgentStreamEvent>>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl AgentStream {
    pub(crate) fn new(rx: mpsc::Receiver<Result<AgentStreamEvent>>, cancel: CancellationToken) -> Self {
        Self {
            events: ReceiverStream::new(rx),
            _guard: cancel.clone().drop_guard(),
            cancel,
        }
    }

    /// Next event, or `None` once the turn is over.
    pub async fn recv(&mut self) -> Option<Result<AgentStreamEvent>> {
        self.events.next().await
    }

    /// Stop the turn without dropping the stream.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for AgentStream {
    type Item = Result<AgentStreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().events).poll_next(cx)
    }
}

impl std::fmt::Debug for AgentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
