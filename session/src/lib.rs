//! Persistent, authenticated WebSocket session for one exchange.
//!
//! A [`Session`] owns a single socket, multiplexes correlated
//! request/response calls over it and forwards everything else to the
//! exchange's push handler. Exchange specifics are supplied through
//! [`SessionHooks`].

pub mod correlation;
mod dispatcher;
pub mod error;
pub mod hooks;
pub mod link;
pub mod session;
pub mod state;
pub mod transport;

/// A decoded inbound JSON object.
pub type Frame = serde_json::Map<String, serde_json::Value>;

pub use correlation::{Completion, CorrelationTable, PendingRequest};
pub use error::{ApiError, SessionError, SessionResult};
pub use hooks::SessionHooks;
pub use link::Link;
pub use session::{Session, SessionConfig};
pub use state::SessionState;
pub use transport::{dial, WsStream};
pub use tokio_tungstenite::tungstenite::Message;
