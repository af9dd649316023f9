//! Single reader loop per connection.
//!
//! The dispatcher owns the read half of the socket. Every inbound frame is
//! either delivered to the waiter registered under its correlation id or
//! handed to the push handler, strictly in arrival order.

use std::{sync::Arc, time::Duration};

use futures::{stream::SplitStream, StreamExt};
use simd_json::serde::from_slice;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use crate::{
    correlation::CorrelationTable, hooks::SessionHooks, link::Link, transport::WsStream, Frame,
};

/// Where a frame ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Routed {
    Response(String),
    Push,
}

/// Classify one frame and deliver it.
///
/// A frame is a response only when it carries an id that currently has a
/// waiter; anything else, including a duplicate or late response, goes to
/// the push handler.
pub(crate) fn route_frame<H: SessionHooks + ?Sized>(
    hooks: &H,
    pending: &CorrelationTable,
    frame: Frame,
) -> Routed {
    if let Some(id) = hooks.extract_id(&frame) {
        if let Some(waiter) = pending.take(&id) {
            let outcome = match hooks.extract_error(&frame) {
                Some(err) => Err(err.into()),
                None => Ok(frame),
            };
            waiter.complete(outcome);
            return Routed::Response(id);
        }
    }
    hooks.on_push(frame);
    Routed::Push
}

pub(crate) struct Dispatcher<H> {
    hooks: Arc<H>,
    link: Arc<Link>,
    ping_interval: Duration,
    read_timeout: Duration,
    pending_ttl: Option<Duration>,
}

impl<H: SessionHooks> Dispatcher<H> {
    pub(crate) fn new(
        hooks: Arc<H>,
        link: Arc<Link>,
        ping_interval: Duration,
        read_timeout: Duration,
        pending_ttl: Option<Duration>,
    ) -> Self {
        Self {
            hooks,
            link,
            ping_interval,
            read_timeout,
            pending_ttl,
        }
    }

    /// Run until the connection fails. Returns the reason.
    pub(crate) async fn run(self, mut read: SplitStream<WsStream>) -> String {
        let mut ping = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if last_inbound.elapsed() > self.read_timeout {
                        return format!("no frame received in {:?}", self.read_timeout);
                    }
                    if let Some(ttl) = self.pending_ttl {
                        let expired = self.link.pending().expire_older_than(ttl);
                        if expired > 0 {
                            tracing::warn!(expired, "expired stale pending requests");
                        }
                    }
                    if let Some(msg) = self.hooks.keepalive() {
                        if let Err(e) = self.link.send(msg).await {
                            return format!("keepalive failed: {e}");
                        }
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return format!("read error: {e}"),
                        None => return "stream ended".to_string(),
                    };
                    last_inbound = Instant::now();
                    match msg {
                        Message::Text(text) => self.handle_payload(text.into_bytes()),
                        Message::Binary(bytes) => self.handle_payload(bytes),
                        Message::Ping(payload) => {
                            if let Err(e) = self.link.send(Message::Pong(payload)).await {
                                return format!("pong failed: {e}");
                            }
                        }
                        Message::Close(frame) => {
                            return match frame {
                                Some(f) => format!("closed by peer: {} {}", f.code, f.reason),
                                None => "closed by peer".to_string(),
                            };
                        }
                        Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    fn handle_payload(&self, mut bytes: Vec<u8>) {
        let frame = match from_slice::<Frame>(&mut bytes) {
            Ok(frame) => frame,
            Err(e) => {
                // Plain-text keepalive replies such as "pong" land here.
                tracing::debug!("ignoring non-object frame: {}", e);
                return;
            }
        };
        #[cfg(feature = "debug-logs")]
        tracing::debug!(?frame, "inbound frame");
        if route_frame(self.hooks.as_ref(), self.link.pending(), frame) == Routed::Push {
            xchg_core::metrics::incr(xchg_core::metrics::PUSH_TOTAL);
        }
    }
}
