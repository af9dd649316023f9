use async_trait::async_trait;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use crate::{
    error::{ApiError, SessionError},
    link::Link,
    transport::WsStream,
    Frame,
};

/// Exchange-specific behavior plugged into a [`Session`](crate::Session).
///
/// The session owns the socket, the correlation table and the lifecycle; the
/// hooks only describe how one particular exchange authenticates, labels its
/// requests and responses, and reports errors.
#[async_trait]
pub trait SessionHooks: Send + Sync + 'static {
    /// Perform the authentication handshake over a freshly opened socket and
    /// return the measured clock offset (local minus server) in milliseconds.
    ///
    /// Runs once per connect and reconnect, before the dispatcher starts, so
    /// the hook may read from the socket directly.
    async fn authenticate(&self, socket: &mut WsStream) -> Result<i64, SessionError>;

    /// Post-authentication setup such as subscribing to user data. Runs once
    /// per successful connect or reconnect, after the dispatcher has started
    /// and before the session accepts requests.
    async fn after_connect(&self, _link: &Link) -> Result<(), SessionError> {
        Ok(())
    }

    /// Consume one unsolicited frame. Called on the dispatcher task, so slow
    /// work should be handed off elsewhere.
    fn on_push(&self, frame: Frame);

    /// Return the correlation id of an outgoing request, assigning one into
    /// the request when it has none.
    fn request_id(&self, request: &mut Value) -> Option<String>;

    /// Pull the correlation id out of an inbound frame, if it carries one.
    fn extract_id(&self, frame: &Frame) -> Option<String>;

    /// Detect an application-level error embedded in a response frame.
    fn extract_error(&self, frame: &Frame) -> Option<ApiError>;

    /// Keepalive message sent on every ping tick. `None` disables keepalives.
    fn keepalive(&self) -> Option<Message> {
        Some(Message::Ping(Vec::new()))
    }
}
