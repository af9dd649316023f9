//! Raw socket helpers for authentication, which runs before the session's
//! dispatcher owns the read half.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use simd_json::serde::from_slice;
use tokio_tungstenite::tungstenite::Message;
use ws_session::{Frame, SessionError, WsStream};

pub(crate) async fn send_frame(socket: &mut WsStream, frame: &Value) -> Result<(), SessionError> {
    let text = serde_json::to_string(frame)?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

/// Read until a JSON object matching `accept` arrives. Other frames are
/// skipped.
pub(crate) async fn read_frame<F>(socket: &mut WsStream, accept: F) -> Result<Frame, SessionError>
where
    F: Fn(&Frame) -> bool,
{
    while let Some(msg) = socket.next().await {
        let mut bytes = match msg.map_err(|e| SessionError::Auth(format!("read error: {e}")))? {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(frame) => {
                return Err(SessionError::Auth(format!(
                    "closed during handshake: {:?}",
                    frame.map(|f| f.reason.into_owned())
                )))
            }
            _ => continue,
        };
        match from_slice::<Frame>(&mut bytes) {
            Ok(frame) if accept(&frame) => return Ok(frame),
            Ok(_) => tracing::debug!("skipping unrelated frame during handshake"),
            Err(e) => tracing::debug!("skipping non-object frame during handshake: {}", e),
        }
    }
    Err(SessionError::Auth("stream ended during handshake".to_string()))
}
