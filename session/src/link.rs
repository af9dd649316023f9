use std::time::Duration;

use futures::{stream::SplitSink, SinkExt};
use serde_json::Value;
use tokio::{sync::Mutex, time::timeout};
use tokio_tungstenite::tungstenite::Message;

use crate::{correlation::CorrelationTable, error::SessionError, transport::WsStream, Frame};

pub(crate) type WsSink = SplitSink<WsStream, Message>;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Write half of the current connection plus the correlation table shared
/// with the dispatcher.
///
/// Writers are serialized by the sink lock; the table has its own sharded
/// locking, so waiting callers never hold the sink lock.
#[derive(Default)]
pub struct Link {
    sink: Mutex<Option<WsSink>>,
    pending: CorrelationTable,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Link {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &CorrelationTable {
        &self.pending
    }

    /// Write one message to the socket.
    pub async fn send(&self, message: Message) -> Result<(), SessionError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SessionError::NotConnected)?;
        sink.send(message)
            .await
            .map_err(|e| SessionError::Write(e.to_string()))
    }

    /// Serialize and write a JSON frame without waiting for a response.
    pub async fn send_json(&self, frame: &Value) -> Result<(), SessionError> {
        let text = serde_json::to_string(frame)?;
        self.send(Message::Text(text)).await
    }

    /// Register `id`, write `request` and wait for the matching response.
    ///
    /// An application error reported in the response comes back as
    /// [`SessionError::Api`].
    pub async fn request(&self, id: &str, request: &Value) -> Result<Frame, SessionError> {
        let text = serde_json::to_string(request)?;
        let rx = self.pending.register(id)?;
        if let Err(e) = self.send(Message::Text(text)).await {
            self.pending.discard(id);
            return Err(e);
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SessionError::ConnectionLost(
                "pending request dropped".to_string(),
            )),
        }
    }

    pub(crate) async fn install(&self, sink: WsSink) {
        *self.sink.lock().await = Some(sink);
    }

    /// Drop the sink without a close handshake. Used where awaiting is not
    /// possible; a writer holding the lock keeps it until the next install.
    pub(crate) fn detach(&self) {
        if let Ok(mut sink) = self.sink.try_lock() {
            sink.take();
        }
    }

    /// Remove the sink and close it. Close errors are ignored.
    pub(crate) async fn shutdown(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            match timeout(CLOSE_GRACE, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("error closing socket: {}", e),
                Err(_) => tracing::debug!("socket close timed out"),
            }
        }
    }
}
